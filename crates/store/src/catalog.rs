//! Catalog store: authors, books and their bindings.
//!
//! The Postgres implementation relies on column defaults for id and
//! timestamp generation (`RETURNING` hands them back in the same round
//! trip) and on the `updated_at` trigger for mutation timestamps. Reads
//! executed inside a transactional scope take `FOR UPDATE` row locks to
//! serialize concurrent editors; detached reads do not lock.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgConnection, PgPool, Row};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use biblio_core::{Author, AuthorId, Book, BookId, DomainError, EntityName};

use crate::pg::{is_foreign_key_violation, map_sqlx_error};
use crate::scope::TxScope;

/// Page size for the lazy author-books stream.
const AUTHOR_BOOKS_PAGE: usize = 64;

/// Result stream of [`BookStore::author_books`]: finite and single-shot.
pub type BookStream = ReceiverStream<Result<Book, DomainError>>;

/// Author persistence.
#[async_trait]
pub trait AuthorStore: Send + Sync {
    /// Insert a new author and return the store-generated fields.
    async fn register_author(
        &self,
        scope: &TxScope,
        name: &EntityName,
    ) -> Result<Author, DomainError>;

    /// Rename an existing author.
    async fn change_author_info(
        &self,
        scope: &TxScope,
        id: AuthorId,
        name: &EntityName,
    ) -> Result<(), DomainError>;

    async fn author_info(&self, scope: &TxScope, id: AuthorId) -> Result<Author, DomainError>;
}

/// Book persistence.
#[async_trait]
pub trait BookStore: Send + Sync {
    /// Create a book and bind all its authors in one boundary. Binding an
    /// unknown author fails with `ReferencedNotFound`.
    async fn add_book(
        &self,
        scope: &TxScope,
        name: &EntityName,
        author_ids: &BTreeSet<AuthorId>,
    ) -> Result<Book, DomainError>;

    /// Rename a book and replace its author set. Only the set difference is
    /// written.
    async fn update_book(
        &self,
        scope: &TxScope,
        id: BookId,
        name: &EntityName,
        author_ids: &BTreeSet<AuthorId>,
    ) -> Result<(), DomainError>;

    async fn book(&self, scope: &TxScope, id: BookId) -> Result<Book, DomainError>;

    /// Lazy stream of the author's books; large catalogs are paged from the
    /// store instead of materialized.
    async fn author_books(&self, author_id: AuthorId) -> Result<BookStream, DomainError>;
}

/// Postgres-backed catalog store.
#[derive(Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn acquire(&self) -> Result<sqlx::pool::PoolConnection<sqlx::Postgres>, DomainError> {
        self.pool
            .acquire()
            .await
            .map_err(|e| DomainError::transient(format!("cannot acquire connection: {e}")))
    }
}

#[async_trait]
impl AuthorStore for PgCatalogStore {
    async fn register_author(
        &self,
        scope: &TxScope,
        name: &EntityName,
    ) -> Result<Author, DomainError> {
        match scope.handle() {
            Some(handle) => {
                let mut guard = handle.lock().await;
                insert_author(guard.conn()?, name).await
            }
            None => {
                let mut conn = self.acquire().await?;
                insert_author(&mut conn, name).await
            }
        }
    }

    async fn change_author_info(
        &self,
        scope: &TxScope,
        id: AuthorId,
        name: &EntityName,
    ) -> Result<(), DomainError> {
        match scope.handle() {
            Some(handle) => {
                let mut guard = handle.lock().await;
                update_author_name(guard.conn()?, id, name).await
            }
            None => {
                let mut conn = self.acquire().await?;
                update_author_name(&mut conn, id, name).await
            }
        }
    }

    async fn author_info(&self, scope: &TxScope, id: AuthorId) -> Result<Author, DomainError> {
        match scope.handle() {
            Some(handle) => {
                let mut guard = handle.lock().await;
                select_author(guard.conn()?, id, true).await
            }
            None => {
                let mut conn = self.acquire().await?;
                select_author(&mut conn, id, false).await
            }
        }
    }
}

#[async_trait]
impl BookStore for PgCatalogStore {
    async fn add_book(
        &self,
        scope: &TxScope,
        name: &EntityName,
        author_ids: &BTreeSet<AuthorId>,
    ) -> Result<Book, DomainError> {
        match scope.handle() {
            Some(handle) => {
                let mut guard = handle.lock().await;
                insert_book(guard.conn()?, name, author_ids).await
            }
            None => {
                // Binding authors is multi-statement; stay atomic even
                // without an ambient boundary.
                let mut tx = self
                    .pool
                    .begin()
                    .await
                    .map_err(|e| map_sqlx_error("add_book", e))?;
                let book = insert_book(&mut tx, name, author_ids).await?;
                tx.commit().await.map_err(|e| map_sqlx_error("add_book", e))?;
                Ok(book)
            }
        }
    }

    async fn update_book(
        &self,
        scope: &TxScope,
        id: BookId,
        name: &EntityName,
        author_ids: &BTreeSet<AuthorId>,
    ) -> Result<(), DomainError> {
        match scope.handle() {
            Some(handle) => {
                let mut guard = handle.lock().await;
                update_book_delta(guard.conn()?, id, name, author_ids).await
            }
            None => {
                let mut tx = self
                    .pool
                    .begin()
                    .await
                    .map_err(|e| map_sqlx_error("update_book", e))?;
                update_book_delta(&mut tx, id, name, author_ids).await?;
                tx.commit()
                    .await
                    .map_err(|e| map_sqlx_error("update_book", e))?;
                Ok(())
            }
        }
    }

    async fn book(&self, scope: &TxScope, id: BookId) -> Result<Book, DomainError> {
        match scope.handle() {
            Some(handle) => {
                let mut guard = handle.lock().await;
                select_book(guard.conn()?, id, true).await
            }
            None => {
                // Two reads; a snapshot keeps the book row and its author
                // bindings consistent.
                let mut tx = self
                    .pool
                    .begin()
                    .await
                    .map_err(|e| map_sqlx_error("get_book", e))?;
                let book = select_book(&mut tx, id, false).await?;
                tx.commit().await.map_err(|e| map_sqlx_error("get_book", e))?;
                Ok(book)
            }
        }
    }

    async fn author_books(&self, author_id: AuthorId) -> Result<BookStream, DomainError> {
        let (sender, receiver) = mpsc::channel(AUTHOR_BOOKS_PAGE);
        let pool = self.pool.clone();
        tokio::spawn(async move {
            stream_author_books(pool, author_id, sender).await;
        });
        Ok(ReceiverStream::new(receiver))
    }
}

async fn insert_author(conn: &mut PgConnection, name: &EntityName) -> Result<Author, DomainError> {
    const QUERY: &str = "\
INSERT INTO author (name)
VALUES ($1)
RETURNING id, name, created_at, updated_at";

    let row = sqlx::query(QUERY)
        .bind(name.as_str())
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("register_author", e))?;
    let row = AuthorRow::from_row(&row).map_err(|e| map_sqlx_error("register_author", e))?;
    Ok(row.into())
}

async fn update_author_name(
    conn: &mut PgConnection,
    id: AuthorId,
    name: &EntityName,
) -> Result<(), DomainError> {
    const QUERY: &str = "UPDATE author SET name = $1 WHERE id = $2";

    let result = sqlx::query(QUERY)
        .bind(name.as_str())
        .bind(id.as_uuid())
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("change_author_info", e))?;
    if result.rows_affected() == 0 {
        return Err(DomainError::NotFound("author"));
    }
    Ok(())
}

async fn select_author(
    conn: &mut PgConnection,
    id: AuthorId,
    lock: bool,
) -> Result<Author, DomainError> {
    const QUERY: &str = "SELECT id, name, created_at, updated_at FROM author WHERE id = $1";
    const QUERY_LOCKED: &str =
        "SELECT id, name, created_at, updated_at FROM author WHERE id = $1 FOR UPDATE";

    let row = sqlx::query(if lock { QUERY_LOCKED } else { QUERY })
        .bind(id.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("get_author_info", e))?
        .ok_or(DomainError::NotFound("author"))?;
    let row = AuthorRow::from_row(&row).map_err(|e| map_sqlx_error("get_author_info", e))?;
    Ok(row.into())
}

async fn insert_book(
    conn: &mut PgConnection,
    name: &EntityName,
    author_ids: &BTreeSet<AuthorId>,
) -> Result<Book, DomainError> {
    const QUERY: &str = "\
INSERT INTO book (name)
VALUES ($1)
RETURNING id, name, created_at, updated_at";

    let row = sqlx::query(QUERY)
        .bind(name.as_str())
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("add_book", e))?;
    let row = BookRow::from_row(&row).map_err(|e| map_sqlx_error("add_book", e))?;

    bind_authors(conn, row.id, author_ids.iter().copied()).await?;
    Ok(row.into_book(author_ids.clone()))
}

async fn update_book_delta(
    conn: &mut PgConnection,
    id: BookId,
    name: &EntityName,
    author_ids: &BTreeSet<AuthorId>,
) -> Result<(), DomainError> {
    // Locks the book row (and refreshes updated_at via trigger) before the
    // author bindings are read, serializing concurrent editors.
    const QUERY_NAME: &str = "UPDATE book SET name = $1 WHERE id = $2";

    let result = sqlx::query(QUERY_NAME)
        .bind(name.as_str())
        .bind(id.as_uuid())
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("update_book", e))?;
    if result.rows_affected() == 0 {
        return Err(DomainError::NotFound("book"));
    }

    let current = select_book_author_ids(conn, id).await?;
    let to_add: Vec<AuthorId> = author_ids.difference(&current).copied().collect();
    let to_remove: Vec<Uuid> = current
        .difference(author_ids)
        .map(|a| *a.as_uuid())
        .collect();

    if !to_remove.is_empty() {
        const QUERY_REMOVE: &str =
            "DELETE FROM author_book WHERE book_id = $1 AND author_id = ANY($2)";
        sqlx::query(QUERY_REMOVE)
            .bind(id.as_uuid())
            .bind(&to_remove)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("update_book", e))?;
    }
    bind_authors(conn, *id.as_uuid(), to_add.into_iter()).await
}

async fn bind_authors(
    conn: &mut PgConnection,
    book_id: Uuid,
    author_ids: impl Iterator<Item = AuthorId> + Send,
) -> Result<(), DomainError> {
    const QUERY: &str = "INSERT INTO author_book (author_id, book_id) VALUES ($1, $2)";

    for author_id in author_ids {
        sqlx::query(QUERY)
            .bind(author_id.as_uuid())
            .bind(book_id)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                if is_foreign_key_violation(&e) {
                    DomainError::ReferencedNotFound("author")
                } else {
                    map_sqlx_error("bind_authors", e)
                }
            })?;
    }
    Ok(())
}

async fn select_book(conn: &mut PgConnection, id: BookId, lock: bool) -> Result<Book, DomainError> {
    const QUERY: &str = "SELECT id, name, created_at, updated_at FROM book WHERE id = $1";
    const QUERY_LOCKED: &str =
        "SELECT id, name, created_at, updated_at FROM book WHERE id = $1 FOR UPDATE";

    let row = sqlx::query(if lock { QUERY_LOCKED } else { QUERY })
        .bind(id.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("get_book", e))?
        .ok_or(DomainError::NotFound("book"))?;
    let row = BookRow::from_row(&row).map_err(|e| map_sqlx_error("get_book", e))?;

    let author_ids = select_book_author_ids(conn, id).await?;
    Ok(row.into_book(author_ids))
}

async fn select_book_author_ids(
    conn: &mut PgConnection,
    id: BookId,
) -> Result<BTreeSet<AuthorId>, DomainError> {
    const QUERY: &str = "SELECT author_id FROM author_book WHERE book_id = $1";

    let rows = sqlx::query(QUERY)
        .bind(id.as_uuid())
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("get_book_authors", e))?;

    rows.iter()
        .map(|row| {
            row.try_get("author_id")
                .map(AuthorId::from_uuid)
                .map_err(|e| map_sqlx_error("get_book_authors", e))
        })
        .collect()
}

/// Pages the author's books from the store and feeds them through the
/// bounded channel; stops early when the receiver is dropped.
async fn stream_author_books(
    pool: PgPool,
    author_id: AuthorId,
    sender: mpsc::Sender<Result<Book, DomainError>>,
) {
    const QUERY_PAGE: &str = "\
SELECT b.id, b.name, b.created_at, b.updated_at
FROM book b
JOIN author_book ab ON ab.book_id = b.id
WHERE ab.author_id = $1 AND b.id > $2
ORDER BY b.id
LIMIT $3";
    const QUERY_AUTHORS: &str =
        "SELECT book_id, author_id FROM author_book WHERE book_id = ANY($1)";

    let mut last_id = Uuid::nil();
    loop {
        let rows = match sqlx::query(QUERY_PAGE)
            .bind(author_id.as_uuid())
            .bind(last_id)
            .bind(AUTHOR_BOOKS_PAGE as i64)
            .fetch_all(&pool)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                let _ = sender.send(Err(map_sqlx_error("get_author_books", e))).await;
                return;
            }
        };
        if rows.is_empty() {
            return;
        }
        let page_len = rows.len();

        let mut page = Vec::with_capacity(page_len);
        for row in &rows {
            match BookRow::from_row(row) {
                Ok(book_row) => page.push(book_row),
                Err(e) => {
                    let _ = sender.send(Err(map_sqlx_error("get_author_books", e))).await;
                    return;
                }
            }
        }
        last_id = page.last().map(|b| b.id).unwrap_or(last_id);

        let page_ids: Vec<Uuid> = page.iter().map(|b| b.id).collect();
        let binding_rows = match sqlx::query(QUERY_AUTHORS)
            .bind(&page_ids)
            .fetch_all(&pool)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                let _ = sender.send(Err(map_sqlx_error("get_author_books", e))).await;
                return;
            }
        };

        let mut by_book: HashMap<Uuid, BTreeSet<AuthorId>> = HashMap::new();
        for row in &binding_rows {
            let book_id: Uuid = match row.try_get("book_id") {
                Ok(id) => id,
                Err(e) => {
                    let _ = sender.send(Err(map_sqlx_error("get_author_books", e))).await;
                    return;
                }
            };
            let bound: Uuid = match row.try_get("author_id") {
                Ok(id) => id,
                Err(e) => {
                    let _ = sender.send(Err(map_sqlx_error("get_author_books", e))).await;
                    return;
                }
            };
            by_book
                .entry(book_id)
                .or_default()
                .insert(AuthorId::from_uuid(bound));
        }

        for book_row in page {
            let author_ids = by_book.remove(&book_row.id).unwrap_or_default();
            if sender.send(Ok(book_row.into_book(author_ids))).await.is_err() {
                return;
            }
        }

        if page_len < AUTHOR_BOOKS_PAGE {
            return;
        }
    }
}

#[derive(Debug)]
struct AuthorRow {
    id: Uuid,
    name: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for AuthorRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(AuthorRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl From<AuthorRow> for Author {
    fn from(row: AuthorRow) -> Self {
        Author {
            id: AuthorId::from_uuid(row.id),
            name: row.name,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug)]
struct BookRow {
    id: Uuid,
    name: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for BookRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(BookRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl BookRow {
    fn into_book(self, author_ids: BTreeSet<AuthorId>) -> Book {
        Book {
            id: BookId::from_uuid(self.id),
            name: self.name,
            author_ids,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}
