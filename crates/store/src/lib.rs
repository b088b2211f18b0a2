//! Persistence layer: transactional scope, Postgres stores, in-memory stores.
//!
//! Every store operation takes a [`TxScope`]. A scope created by
//! [`Transactor::with_tx`] carries the live transaction, which is what makes
//! a domain write and its outbox enqueue commit atomically; a detached scope
//! runs the operation auto-committed.

pub mod catalog;
pub mod memory;
pub mod outbox;
mod pg;
pub mod scope;
pub mod transactor;

pub use catalog::{AuthorStore, BookStore, BookStream, PgCatalogStore};
pub use memory::{InMemoryCatalogStore, InMemoryOutboxStore, InMemoryTransactor};
pub use outbox::{
    idempotency_key, OutboxKind, OutboxMessage, OutboxRecord, OutboxStatus, OutboxStore,
    PgOutboxStore,
};
pub use scope::TxScope;
pub use transactor::{PgTransactor, Transactor};
