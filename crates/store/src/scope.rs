//! Ambient transaction scope.

use std::sync::Arc;

use sqlx::{PgConnection, Postgres, Transaction};
use tokio::sync::{Mutex, MutexGuard};

use biblio_core::DomainError;

/// Ambient transactional context handed to every store operation.
///
/// Store methods detect whether a transaction is present and branch: with one
/// they run on the shared transaction, without one they run auto-committed on
/// the pool. Scopes are created by [`crate::Transactor::with_tx`]; callers
/// outside a boundary use [`TxScope::detached`].
#[derive(Clone, Default)]
pub struct TxScope {
    handle: Option<TxHandle>,
}

impl TxScope {
    /// Scope without an ambient transaction; operations auto-commit.
    pub fn detached() -> Self {
        Self { handle: None }
    }

    pub(crate) fn transactional(handle: TxHandle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// Whether an ambient transaction is present.
    pub fn in_tx(&self) -> bool {
        self.handle.is_some()
    }

    pub(crate) fn handle(&self) -> Option<&TxHandle> {
        self.handle.as_ref()
    }
}

impl core::fmt::Debug for TxScope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TxScope")
            .field("in_tx", &self.in_tx())
            .finish()
    }
}

/// Shared handle to the single live transaction of a scope.
///
/// The transaction sits behind a mutex so that clones of the scope (moved
/// into closures and spawned work) serialize their access; `take` hands it
/// back to the transactor for commit or rollback.
#[derive(Clone)]
pub(crate) struct TxHandle {
    inner: Arc<Mutex<Option<Transaction<'static, Postgres>>>>,
}

impl TxHandle {
    pub(crate) fn new(tx: Transaction<'static, Postgres>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(tx))),
        }
    }

    pub(crate) async fn lock(&self) -> TxGuard<'_> {
        TxGuard(self.inner.lock().await)
    }

    pub(crate) async fn take(&self) -> Option<Transaction<'static, Postgres>> {
        self.inner.lock().await.take()
    }
}

pub(crate) struct TxGuard<'a>(MutexGuard<'a, Option<Transaction<'static, Postgres>>>);

impl TxGuard<'_> {
    /// Connection of the ambient transaction, if the scope is still open.
    pub(crate) fn conn(&mut self) -> Result<&mut PgConnection, DomainError> {
        self.0
            .as_mut()
            .map(|tx| &mut **tx)
            .ok_or_else(|| DomainError::transient("transaction scope is no longer active"))
    }
}
