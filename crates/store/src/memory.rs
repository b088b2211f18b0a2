//! In-memory stores for tests and local development.
//!
//! Observable semantics mirror the Postgres stores: FIFO leases by
//! `created_at`, the lease TTL, the attempts ceiling and the idempotent
//! insert behave identically; only durability and row locking differ (one
//! process-wide mutex stands in for `FOR UPDATE SKIP LOCKED`).

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use biblio_core::{Author, AuthorId, Book, BookId, DomainError, EntityName};

use crate::catalog::{AuthorStore, BookStore, BookStream};
use crate::outbox::{OutboxKind, OutboxMessage, OutboxRecord, OutboxStatus, OutboxStore};
use crate::scope::TxScope;
use crate::transactor::Transactor;

/// In-memory catalog store.
#[derive(Debug, Default)]
pub struct InMemoryCatalogStore {
    authors: Mutex<HashMap<AuthorId, Author>>,
    books: Mutex<HashMap<BookId, Book>>,
}

impl InMemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuthorStore for InMemoryCatalogStore {
    async fn register_author(
        &self,
        _scope: &TxScope,
        name: &EntityName,
    ) -> Result<Author, DomainError> {
        let now = Utc::now();
        let author = Author {
            id: AuthorId::new(),
            name: name.as_str().to_string(),
            created_at: now,
            updated_at: now,
        };
        self.authors
            .lock()
            .unwrap()
            .insert(author.id, author.clone());
        Ok(author)
    }

    async fn change_author_info(
        &self,
        _scope: &TxScope,
        id: AuthorId,
        name: &EntityName,
    ) -> Result<(), DomainError> {
        let mut authors = self.authors.lock().unwrap();
        let author = authors.get_mut(&id).ok_or(DomainError::NotFound("author"))?;
        author.name = name.as_str().to_string();
        author.updated_at = Utc::now();
        Ok(())
    }

    async fn author_info(&self, _scope: &TxScope, id: AuthorId) -> Result<Author, DomainError> {
        self.authors
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(DomainError::NotFound("author"))
    }
}

#[async_trait]
impl BookStore for InMemoryCatalogStore {
    async fn add_book(
        &self,
        _scope: &TxScope,
        name: &EntityName,
        author_ids: &BTreeSet<AuthorId>,
    ) -> Result<Book, DomainError> {
        // Referential check before any write keeps the failure atomic.
        {
            let authors = self.authors.lock().unwrap();
            for author_id in author_ids {
                if !authors.contains_key(author_id) {
                    return Err(DomainError::ReferencedNotFound("author"));
                }
            }
        }

        let now = Utc::now();
        let book = Book {
            id: BookId::new(),
            name: name.as_str().to_string(),
            author_ids: author_ids.clone(),
            created_at: now,
            updated_at: now,
        };
        self.books.lock().unwrap().insert(book.id, book.clone());
        Ok(book)
    }

    async fn update_book(
        &self,
        _scope: &TxScope,
        id: BookId,
        name: &EntityName,
        author_ids: &BTreeSet<AuthorId>,
    ) -> Result<(), DomainError> {
        {
            let authors = self.authors.lock().unwrap();
            for author_id in author_ids {
                if !authors.contains_key(author_id) {
                    return Err(DomainError::ReferencedNotFound("author"));
                }
            }
        }

        let mut books = self.books.lock().unwrap();
        let book = books.get_mut(&id).ok_or(DomainError::NotFound("book"))?;
        book.name = name.as_str().to_string();
        book.author_ids = author_ids.clone();
        book.updated_at = Utc::now();
        Ok(())
    }

    async fn book(&self, _scope: &TxScope, id: BookId) -> Result<Book, DomainError> {
        self.books
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(DomainError::NotFound("book"))
    }

    async fn author_books(&self, author_id: AuthorId) -> Result<BookStream, DomainError> {
        let mut selected: Vec<Book> = self
            .books
            .lock()
            .unwrap()
            .values()
            .filter(|book| book.author_ids.contains(&author_id))
            .cloned()
            .collect();
        selected.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let (sender, receiver) = mpsc::channel(selected.len().max(1));
        for book in selected {
            // Capacity covers the whole snapshot.
            let _ = sender.try_send(Ok(book));
        }
        Ok(ReceiverStream::new(receiver))
    }
}

/// In-memory outbox store.
#[derive(Debug)]
pub struct InMemoryOutboxStore {
    attempts_retry: u32,
    rows: Mutex<HashMap<String, OutboxRecord>>,
}

impl InMemoryOutboxStore {
    pub fn new(attempts_retry: u32) -> Self {
        Self {
            attempts_retry,
            rows: Mutex::new(HashMap::new()),
        }
    }

    /// Inspect a record by key.
    pub fn record(&self, idempotency_key: &str) -> Option<OutboxRecord> {
        self.rows.lock().unwrap().get(idempotency_key).cloned()
    }

    /// Insert a record verbatim (seeding arbitrary states, e.g. expired
    /// leases).
    pub fn put_record(&self, record: OutboxRecord) {
        self.rows
            .lock()
            .unwrap()
            .insert(record.idempotency_key.clone(), record);
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn send_message(
        &self,
        _scope: &TxScope,
        idempotency_key: &str,
        kind: OutboxKind,
        payload: &[u8],
    ) -> Result<(), DomainError> {
        let mut rows = self.rows.lock().unwrap();
        if rows.contains_key(idempotency_key) {
            return Ok(());
        }
        let now = Utc::now();
        rows.insert(
            idempotency_key.to_string(),
            OutboxRecord {
                idempotency_key: idempotency_key.to_string(),
                kind,
                payload: payload.to_vec(),
                status: OutboxStatus::Created,
                attempts: 0,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn get_messages(
        &self,
        _scope: &TxScope,
        batch_size: u32,
        lease_ttl: Duration,
    ) -> Result<Vec<OutboxMessage>, DomainError> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease_ttl).unwrap_or(chrono::Duration::MAX);
        let mut rows = self.rows.lock().unwrap();

        let mut due: Vec<String> = rows
            .values()
            .filter(|record| match record.status {
                OutboxStatus::Created => true,
                OutboxStatus::InProgress => {
                    now.signed_duration_since(record.updated_at) > lease
                }
                _ => false,
            })
            .map(|record| record.idempotency_key.clone())
            .collect();
        due.sort_by(|a, b| {
            let (ra, rb) = (&rows[a], &rows[b]);
            ra.created_at.cmp(&rb.created_at).then_with(|| a.cmp(b))
        });
        due.truncate(batch_size as usize);

        let mut messages = Vec::with_capacity(due.len());
        for key in due {
            let record = rows.get_mut(&key).expect("due key vanished");
            record.status = OutboxStatus::InProgress;
            record.updated_at = now;
            messages.push(OutboxMessage {
                idempotency_key: record.idempotency_key.clone(),
                kind: record.kind,
                payload: record.payload.clone(),
            });
        }
        Ok(messages)
    }

    async fn mark_as(
        &self,
        _scope: &TxScope,
        idempotency_keys: &[String],
        status: OutboxStatus,
    ) -> Result<(), DomainError> {
        if idempotency_keys.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let mut rows = self.rows.lock().unwrap();
        for key in idempotency_keys {
            let Some(record) = rows.get_mut(key) else {
                continue;
            };
            if record.status != OutboxStatus::InProgress {
                continue;
            }
            record.attempts += 1;
            record.updated_at = now;
            record.status = if status == OutboxStatus::Created && record.attempts > self.attempts_retry
            {
                OutboxStatus::Abandoned
            } else {
                status
            };
        }
        Ok(())
    }
}

/// Transactor for the in-memory stores.
///
/// Runs the closure on a detached scope; each in-memory operation is
/// already applied atomically under its store mutex.
#[derive(Debug, Default)]
pub struct InMemoryTransactor;

impl InMemoryTransactor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transactor for InMemoryTransactor {
    async fn with_tx<F, Fut, R>(&self, f: F) -> Result<R, DomainError>
    where
        F: FnOnce(TxScope) -> Fut + Send,
        Fut: std::future::Future<Output = Result<R, DomainError>> + Send,
        R: Send,
    {
        f(TxScope::detached()).await
    }
}
