//! Library use cases.
//!
//! Writes that produce an entity run inside one transaction boundary: the
//! entity is persisted, serialized, and enqueued into the outbox with the
//! deterministic `"<kind>_<id>"` idempotency key, so the domain write and
//! its event either both commit or neither does. The transport adapter
//! (gRPC/REST, out of scope here) consumes these methods and maps
//! [`DomainError`] kinds to wire codes.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument};

use biblio_core::{Author, AuthorId, Book, BookId, DomainError, EntityName};
use biblio_store::{
    idempotency_key, AuthorStore, BookStore, BookStream, OutboxKind, OutboxStore, Transactor,
    TxScope,
};

/// Use-case surface over the catalog, the outbox and the transactor.
pub struct LibraryService<S, O, T> {
    store: Arc<S>,
    outbox: Arc<O>,
    transactor: Arc<T>,
}

impl<S, O, T> LibraryService<S, O, T>
where
    S: AuthorStore + BookStore + 'static,
    O: OutboxStore + 'static,
    T: Transactor,
{
    pub fn new(store: Arc<S>, outbox: Arc<O>, transactor: Arc<T>) -> Self {
        Self {
            store,
            outbox,
            transactor,
        }
    }

    #[instrument(skip(self), err)]
    pub async fn register_author(&self, name: &str) -> Result<Author, DomainError> {
        let name = EntityName::parse(name)?;

        let store = Arc::clone(&self.store);
        let outbox = Arc::clone(&self.outbox);
        let author = self
            .transactor
            .with_tx(move |scope| async move {
                let author = store.register_author(&scope, &name).await?;
                enqueue(outbox.as_ref(), &scope, OutboxKind::Author, &author).await?;
                Ok(author)
            })
            .await?;

        info!(author_id = %author.id, "registered author");
        Ok(author)
    }

    #[instrument(skip(self), err)]
    pub async fn change_author_info(&self, id: &str, name: &str) -> Result<(), DomainError> {
        let id: AuthorId = id.parse()?;
        let name = EntityName::parse(name)?;
        self.store
            .change_author_info(&TxScope::detached(), id, &name)
            .await
    }

    #[instrument(skip(self), err)]
    pub async fn get_author_info(&self, id: &str) -> Result<Author, DomainError> {
        let id: AuthorId = id.parse()?;
        self.store.author_info(&TxScope::detached(), id).await
    }

    #[instrument(skip(self), err)]
    pub async fn add_book(&self, name: &str, author_ids: &[String]) -> Result<Book, DomainError> {
        let name = EntityName::parse(name)?;
        let author_ids = parse_author_ids(author_ids)?;

        let store = Arc::clone(&self.store);
        let outbox = Arc::clone(&self.outbox);
        let book = self
            .transactor
            .with_tx(move |scope| async move {
                let book = store.add_book(&scope, &name, &author_ids).await?;
                enqueue(outbox.as_ref(), &scope, OutboxKind::Book, &book).await?;
                Ok(book)
            })
            .await?;

        info!(book_id = %book.id, "added book");
        Ok(book)
    }

    #[instrument(skip(self), err)]
    pub async fn get_book_info(&self, id: &str) -> Result<Book, DomainError> {
        let id: BookId = id.parse()?;
        self.store.book(&TxScope::detached(), id).await
    }

    #[instrument(skip(self), err)]
    pub async fn update_book(
        &self,
        id: &str,
        name: &str,
        author_ids: &[String],
    ) -> Result<(), DomainError> {
        let id: BookId = id.parse()?;
        let name = EntityName::parse(name)?;
        let author_ids = parse_author_ids(author_ids)?;
        self.store
            .update_book(&TxScope::detached(), id, &name, &author_ids)
            .await
    }

    /// Lazy, single-shot stream of the author's books (server streaming
    /// endpoints forward it without buffering).
    #[instrument(skip(self), err)]
    pub async fn get_author_books(&self, author_id: &str) -> Result<BookStream, DomainError> {
        let author_id: AuthorId = author_id.parse()?;
        BookStore::author_books(self.store.as_ref(), author_id).await
    }
}

/// Serialize the entity and enqueue it under its deterministic key.
async fn enqueue<O, E>(
    outbox: &O,
    scope: &TxScope,
    kind: OutboxKind,
    entity: &E,
) -> Result<(), DomainError>
where
    O: OutboxStore + ?Sized,
    E: Serialize + HasEntityId,
{
    let payload = serde_json::to_vec(entity)
        .map_err(|e| DomainError::permanent(format!("cannot serialize {kind} payload: {e}")))?;
    let key = idempotency_key(kind, entity.entity_id());
    outbox.send_message(scope, &key, kind, &payload).await
}

/// Store-assigned identifier used to derive the idempotency key.
trait HasEntityId {
    fn entity_id(&self) -> String;
}

impl HasEntityId for Author {
    fn entity_id(&self) -> String {
        self.id.to_string()
    }
}

impl HasEntityId for Book {
    fn entity_id(&self) -> String {
        self.id.to_string()
    }
}

fn parse_author_ids(raw: &[String]) -> Result<BTreeSet<AuthorId>, DomainError> {
    raw.iter().map(|s| s.parse::<AuthorId>()).collect()
}
