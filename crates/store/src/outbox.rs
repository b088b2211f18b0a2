//! Durable outbox queue.
//!
//! The queue's source of truth is the `outbox` table itself: workers
//! coordinate exclusively through row-level locks taken during the lease
//! step (`FOR UPDATE SKIP LOCKED`), so there is no in-process state to lose
//! on a crash.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use biblio_core::DomainError;

use crate::pg::map_sqlx_error;
use crate::scope::TxScope;

/// Discriminator selecting the delivery handler for a record.
///
/// `Undefined` is a sentinel: no handler is ever registered for it and the
/// delivery layer treats it as a permanent failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutboxKind {
    Undefined,
    Author,
    Book,
}

impl OutboxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxKind::Undefined => "undefined",
            OutboxKind::Author => "author",
            OutboxKind::Book => "book",
        }
    }

    /// Integer representation stored in the `kind` column.
    pub fn code(&self) -> i32 {
        match self {
            OutboxKind::Undefined => 0,
            OutboxKind::Author => 1,
            OutboxKind::Book => 2,
        }
    }

    /// Decode the stored representation; unknown codes collapse into the
    /// `Undefined` sentinel so the record ages out through the retry
    /// ceiling instead of wedging a worker.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => OutboxKind::Author,
            2 => OutboxKind::Book,
            _ => OutboxKind::Undefined,
        }
    }
}

impl core::fmt::Display for OutboxKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery state of an outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Created,
    InProgress,
    Success,
    Abandoned,
}

impl OutboxStatus {
    /// Textual representation matching the `outbox_status` enum domain.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Created => "CREATED",
            OutboxStatus::InProgress => "IN_PROGRESS",
            OutboxStatus::Success => "SUCCESS",
            OutboxStatus::Abandoned => "ABANDONED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Success | OutboxStatus::Abandoned)
    }
}

impl core::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lease projection returned by [`OutboxStore::get_messages`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxMessage {
    pub idempotency_key: String,
    pub kind: OutboxKind,
    pub payload: Vec<u8>,
}

/// Full queue row; the in-memory store keeps these and tests inspect them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxRecord {
    pub idempotency_key: String,
    pub kind: OutboxKind,
    pub payload: Vec<u8>,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Deterministic producer-side idempotency key: `"<kind>_<entity-id>"`.
pub fn idempotency_key(kind: OutboxKind, entity_id: impl core::fmt::Display) -> String {
    format!("{}_{}", kind.as_str(), entity_id)
}

/// Durable queue of pending events.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a `Created` record. Re-inserting an existing key is a silent
    /// no-op; the original record stays untouched.
    async fn send_message(
        &self,
        scope: &TxScope,
        idempotency_key: &str,
        kind: OutboxKind,
        payload: &[u8],
    ) -> Result<(), DomainError>;

    /// Atomically lease up to `batch_size` due records: each selected record
    /// transitions to `InProgress` with a refreshed `updated_at`. A record
    /// is due when it is `Created`, or `InProgress` with a lease older than
    /// `lease_ttl`. Selection is FIFO by `created_at` and skips records
    /// locked by concurrent workers.
    async fn get_messages(
        &self,
        scope: &TxScope,
        batch_size: u32,
        lease_ttl: Duration,
    ) -> Result<Vec<OutboxMessage>, DomainError>;

    /// Bulk transition for leased records; keys not currently `InProgress`
    /// are ignored. Marking `Success` completes the record; marking
    /// `Created` releases it, or abandons it once the bumped attempt count
    /// would exceed the retry ceiling. Both bump `attempts`. An empty key
    /// list is a no-op.
    async fn mark_as(
        &self,
        scope: &TxScope,
        idempotency_keys: &[String],
        status: OutboxStatus,
    ) -> Result<(), DomainError>;
}

/// Postgres-backed outbox store.
#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
    attempts_retry: u32,
}

impl PgOutboxStore {
    /// `attempts_retry` is the ceiling for the `Created` → `Abandoned`
    /// decision in [`OutboxStore::mark_as`].
    pub fn new(pool: PgPool, attempts_retry: u32) -> Self {
        Self {
            pool,
            attempts_retry,
        }
    }

    async fn acquire(&self) -> Result<sqlx::pool::PoolConnection<sqlx::Postgres>, DomainError> {
        self.pool
            .acquire()
            .await
            .map_err(|e| DomainError::transient(format!("cannot acquire connection: {e}")))
    }
}

const SEND_MESSAGE: &str = "\
INSERT INTO outbox (idempotency_key, data, status, kind, attempts)
VALUES ($1, $2, 'CREATED', $3, 0)
ON CONFLICT (idempotency_key) DO NOTHING";

const GET_MESSAGES: &str = "\
UPDATE outbox
SET status = 'IN_PROGRESS', updated_at = now()
WHERE idempotency_key IN (
    SELECT idempotency_key
    FROM outbox
    WHERE status = 'CREATED'
       OR (status = 'IN_PROGRESS' AND updated_at < now() - $1::interval)
    ORDER BY created_at
    LIMIT $2
    FOR UPDATE SKIP LOCKED
)
RETURNING idempotency_key, data, kind";

const MARK_AS: &str = "\
UPDATE outbox
SET status = CASE
        WHEN $1::outbox_status = 'CREATED' AND attempts + 1 > $3 THEN 'ABANDONED'::outbox_status
        ELSE $1::outbox_status
    END,
    attempts = attempts + 1,
    updated_at = now()
WHERE idempotency_key = ANY($2)
  AND status = 'IN_PROGRESS'";

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn send_message(
        &self,
        scope: &TxScope,
        idempotency_key: &str,
        kind: OutboxKind,
        payload: &[u8],
    ) -> Result<(), DomainError> {
        let query = sqlx::query(SEND_MESSAGE)
            .bind(idempotency_key)
            .bind(payload)
            .bind(kind.code());

        match scope.handle() {
            Some(handle) => {
                let mut guard = handle.lock().await;
                query.execute(&mut *guard.conn()?).await
            }
            None => {
                let mut conn = self.acquire().await?;
                query.execute(&mut *conn).await
            }
        }
        .map_err(|e| map_sqlx_error("send_message", e))?;
        Ok(())
    }

    async fn get_messages(
        &self,
        scope: &TxScope,
        batch_size: u32,
        lease_ttl: Duration,
    ) -> Result<Vec<OutboxMessage>, DomainError> {
        let interval = format!("{} ms", lease_ttl.as_millis());
        let query = sqlx::query(GET_MESSAGES)
            .bind(interval)
            .bind(i64::from(batch_size));

        let rows = match scope.handle() {
            Some(handle) => {
                let mut guard = handle.lock().await;
                query.fetch_all(&mut *guard.conn()?).await
            }
            None => {
                let mut conn = self.acquire().await?;
                query.fetch_all(&mut *conn).await
            }
        }
        .map_err(|e| map_sqlx_error("get_messages", e))?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let idempotency_key: String = row
                .try_get("idempotency_key")
                .map_err(|e| map_sqlx_error("get_messages", e))?;
            let payload: Vec<u8> = row
                .try_get("data")
                .map_err(|e| map_sqlx_error("get_messages", e))?;
            let kind: i32 = row
                .try_get("kind")
                .map_err(|e| map_sqlx_error("get_messages", e))?;
            messages.push(OutboxMessage {
                idempotency_key,
                kind: OutboxKind::from_code(kind),
                payload,
            });
        }
        Ok(messages)
    }

    async fn mark_as(
        &self,
        scope: &TxScope,
        idempotency_keys: &[String],
        status: OutboxStatus,
    ) -> Result<(), DomainError> {
        if idempotency_keys.is_empty() {
            return Ok(());
        }

        let query = sqlx::query(MARK_AS)
            .bind(status.as_str())
            .bind(idempotency_keys)
            .bind(self.attempts_retry as i32);

        match scope.handle() {
            Some(handle) => {
                let mut guard = handle.lock().await;
                query.execute(&mut *guard.conn()?).await
            }
            None => {
                let mut conn = self.acquire().await?;
                query.execute(&mut *conn).await
            }
        }
        .map_err(|e| map_sqlx_error("mark_as", e))?;
        Ok(())
    }
}
