//! Scoped transaction boundary.

use std::future::Future;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::warn;

use biblio_core::DomainError;

use crate::scope::{TxHandle, TxScope};

/// Transaction boundary shared by the catalog and outbox stores.
///
/// `with_tx` opens a transaction, exposes it through the [`TxScope`] passed
/// to the closure, commits on a clean return and rolls back on error. If the
/// closure unwinds, the transaction is dropped and the driver rolls it back.
#[async_trait]
pub trait Transactor: Send + Sync {
    async fn with_tx<F, Fut, R>(&self, f: F) -> Result<R, DomainError>
    where
        F: FnOnce(TxScope) -> Fut + Send,
        Fut: Future<Output = Result<R, DomainError>> + Send,
        R: Send;
}

/// Postgres transactor backed by the shared connection pool.
#[derive(Clone)]
pub struct PgTransactor {
    pool: PgPool,
}

impl PgTransactor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Transactor for PgTransactor {
    async fn with_tx<F, Fut, R>(&self, f: F) -> Result<R, DomainError>
    where
        F: FnOnce(TxScope) -> Fut + Send,
        Fut: Future<Output = Result<R, DomainError>> + Send,
        R: Send,
    {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DomainError::transient(format!("cannot begin transaction: {e}")))?;
        let handle = TxHandle::new(tx);

        let result = f(TxScope::transactional(handle.clone())).await;

        match (result, handle.take().await) {
            (Ok(value), Some(tx)) => {
                tx.commit()
                    .await
                    .map_err(|e| DomainError::transient(format!("failed commit of tx: {e}")))?;
                Ok(value)
            }
            (Err(err), Some(tx)) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "failed rollback of tx");
                }
                Err(err)
            }
            // The closure smuggled the transaction out of its scope; nothing
            // left to commit or roll back here.
            (Ok(_), None) => Err(DomainError::transient(
                "transaction escaped its scope before commit",
            )),
            (Err(err), None) => Err(err),
        }
    }
}
