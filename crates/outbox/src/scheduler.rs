//! Delivery scheduler: a pool of workers leasing outbox batches.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use biblio_core::DomainError;
use biblio_store::{OutboxMessage, OutboxStatus, OutboxStore, Transactor, TxScope};

use crate::registry::{HandlerError, HandlerRegistry};

/// Runtime knobs of the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// When false, workers keep polling the clock but never lease.
    pub enabled: bool,
    /// Number of concurrent workers.
    pub workers: usize,
    /// Maximum records leased per poll.
    pub batch_size: u32,
    /// Sleep between polls.
    pub wait_time: Duration,
    /// Time after which an `InProgress` lease is considered abandoned by
    /// its worker and the record becomes due again.
    pub lease_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: 1,
            batch_size: 100,
            wait_time: Duration::from_millis(100),
            lease_ttl: Duration::from_secs(5),
        }
    }
}

/// Worker pool delivering outbox records through registered handlers.
///
/// Workers share only the outbox store, the frozen handler registry and the
/// transactor; they never talk to each other. Coordination happens entirely
/// through row locks taken by the lease query.
pub struct DeliveryScheduler<O, T> {
    outbox: Arc<O>,
    transactor: Arc<T>,
    registry: Arc<HandlerRegistry>,
    config: SchedulerConfig,
}

impl<O, T> DeliveryScheduler<O, T>
where
    O: OutboxStore + 'static,
    T: Transactor + 'static,
{
    pub fn new(
        outbox: Arc<O>,
        transactor: Arc<T>,
        registry: Arc<HandlerRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            outbox,
            transactor,
            registry,
            config,
        }
    }

    /// Launch the worker pool and return immediately.
    ///
    /// Workers run until `cancel` fires; they finish their in-flight batch
    /// and exit before the next poll. Await the returned handles to drain
    /// on shutdown.
    pub fn start(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        (1..=self.config.workers)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    Arc::clone(&self.outbox),
                    Arc::clone(&self.transactor),
                    Arc::clone(&self.registry),
                    self.config.clone(),
                    cancel.clone(),
                ))
            })
            .collect()
    }
}

async fn worker_loop<O, T>(
    worker_id: usize,
    outbox: Arc<O>,
    transactor: Arc<T>,
    registry: Arc<HandlerRegistry>,
    config: SchedulerConfig,
    cancel: CancellationToken,
) where
    O: OutboxStore + 'static,
    T: Transactor,
{
    info!(worker_id, "outbox worker started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.wait_time) => {}
        }

        if !config.enabled {
            continue;
        }

        let outbox = Arc::clone(&outbox);
        let registry = Arc::clone(&registry);
        let batch_size = config.batch_size;
        let lease_ttl = config.lease_ttl;
        let result = transactor
            .with_tx(move |scope| async move {
                run_batch(outbox.as_ref(), registry.as_ref(), &scope, batch_size, lease_ttl).await
            })
            .await;

        if let Err(error) = result {
            // The lease expires after the TTL and the batch becomes due
            // again; the worker just moves on to the next poll.
            warn!(worker_id, %error, "outbox worker iteration failed");
        }
    }

    info!(worker_id, "outbox worker stopped");
}

async fn run_batch<O>(
    outbox: &O,
    registry: &HandlerRegistry,
    scope: &TxScope,
    batch_size: u32,
    lease_ttl: Duration,
) -> Result<(), DomainError>
where
    O: OutboxStore + ?Sized,
{
    let messages = outbox.get_messages(scope, batch_size, lease_ttl).await?;
    debug!(size = messages.len(), "messages fetched");

    let mut success_keys = Vec::with_capacity(messages.len());
    let mut fail_keys = Vec::with_capacity(messages.len());
    for message in messages {
        match deliver_one(registry, &message).await {
            Ok(()) => success_keys.push(message.idempotency_key),
            Err(error) => {
                warn!(
                    key = %message.idempotency_key,
                    kind = %message.kind,
                    %error,
                    "delivery failed"
                );
                fail_keys.push(message.idempotency_key);
            }
        }
    }

    outbox
        .mark_as(scope, &success_keys, OutboxStatus::Success)
        .await?;
    // The store resolves Created vs Abandoned from the attempts ceiling.
    outbox
        .mark_as(scope, &fail_keys, OutboxStatus::Created)
        .await?;
    Ok(())
}

/// Invoke the handler on its own task so a panic is contained and counted
/// as a failed attempt instead of taking the worker down.
async fn deliver_one(
    registry: &HandlerRegistry,
    message: &OutboxMessage,
) -> Result<(), HandlerError> {
    let handler = registry.get(message.kind)?;
    let payload = message.payload.clone();
    match tokio::spawn(async move { handler.deliver(&payload).await }).await {
        Ok(outcome) => outcome,
        Err(join_error) => Err(HandlerError::Permanent(format!(
            "handler panicked: {join_error}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;

    use biblio_store::{InMemoryOutboxStore, InMemoryTransactor, OutboxKind, OutboxRecord};

    use crate::registry::KindHandler;

    use super::*;

    struct RecordingHandler {
        calls: AtomicUsize,
        delivered: Mutex<Vec<Vec<u8>>>,
        outcome: fn() -> Result<(), HandlerError>,
    }

    impl RecordingHandler {
        fn succeeding() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delivered: Mutex::new(Vec::new()),
                outcome: || Ok(()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delivered: Mutex::new(Vec::new()),
                outcome: || Err(HandlerError::Transient("sink unavailable".to_string())),
            })
        }

        fn panicking() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delivered: Mutex::new(Vec::new()),
                outcome: || panic!("handler blew up"),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl KindHandler for RecordingHandler {
        async fn deliver(&self, payload: &[u8]) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.delivered.lock().unwrap().push(payload.to_vec());
            (self.outcome)()
        }
    }

    fn registry_with(kind: OutboxKind, handler: Arc<RecordingHandler>) -> Arc<HandlerRegistry> {
        let mut registry = HandlerRegistry::new();
        registry.register(kind, handler);
        Arc::new(registry)
    }

    fn fast_config(workers: usize) -> SchedulerConfig {
        SchedulerConfig {
            enabled: true,
            workers,
            batch_size: 50,
            wait_time: Duration::from_millis(5),
            lease_ttl: Duration::from_secs(5),
        }
    }

    fn seed_created(store: &InMemoryOutboxStore, key: &str, kind: OutboxKind) {
        let now = Utc::now();
        store.put_record(OutboxRecord {
            idempotency_key: key.to_string(),
            kind,
            payload: key.as_bytes().to_vec(),
            status: OutboxStatus::Created,
            attempts: 0,
            created_at: now,
            updated_at: now,
        });
    }

    async fn wait_for<F>(mut predicate: F, timeout: Duration) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if predicate() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        predicate()
    }

    async fn shutdown(cancel: CancellationToken, workers: Vec<JoinHandle<()>>) {
        cancel.cancel();
        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn delivers_created_record_once() {
        let store = Arc::new(InMemoryOutboxStore::new(3));
        seed_created(&store, "k1", OutboxKind::Author);
        let handler = RecordingHandler::succeeding();
        let scheduler = DeliveryScheduler::new(
            Arc::clone(&store),
            Arc::new(InMemoryTransactor::new()),
            registry_with(OutboxKind::Author, Arc::clone(&handler)),
            fast_config(1),
        );

        let cancel = CancellationToken::new();
        let workers = scheduler.start(cancel.clone());

        let delivered = wait_for(
            || {
                store
                    .record("k1")
                    .is_some_and(|r| r.status == OutboxStatus::Success)
            },
            Duration::from_secs(1),
        )
        .await;
        assert!(delivered, "record never reached Success");

        let record = store.record("k1").unwrap();
        assert_eq!(record.attempts, 1);
        assert_eq!(handler.calls(), 1);
        assert_eq!(handler.delivered.lock().unwrap()[0], b"k1");

        shutdown(cancel, workers).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failing_handler_retries_until_abandoned() {
        let store = Arc::new(InMemoryOutboxStore::new(2));
        seed_created(&store, "k2", OutboxKind::Book);
        let handler = RecordingHandler::failing();
        let scheduler = DeliveryScheduler::new(
            Arc::clone(&store),
            Arc::new(InMemoryTransactor::new()),
            registry_with(OutboxKind::Book, Arc::clone(&handler)),
            fast_config(1),
        );

        let cancel = CancellationToken::new();
        let workers = scheduler.start(cancel.clone());

        let abandoned = wait_for(
            || {
                store
                    .record("k2")
                    .is_some_and(|r| r.status == OutboxStatus::Abandoned)
            },
            Duration::from_secs(2),
        )
        .await;
        assert!(abandoned, "record never reached Abandoned");

        let record = store.record("k2").unwrap();
        assert_eq!(record.attempts, 3);

        // No further handler calls once the record is terminal.
        let calls = handler.calls();
        assert_eq!(calls, 3);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.calls(), calls);

        shutdown(cancel, workers).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn unknown_kind_ages_out_without_delivery() {
        let store = Arc::new(InMemoryOutboxStore::new(1));
        seed_created(&store, "k3", OutboxKind::Undefined);
        let handler = RecordingHandler::succeeding();
        let scheduler = DeliveryScheduler::new(
            Arc::clone(&store),
            Arc::new(InMemoryTransactor::new()),
            registry_with(OutboxKind::Author, Arc::clone(&handler)),
            fast_config(1),
        );

        let cancel = CancellationToken::new();
        let workers = scheduler.start(cancel.clone());

        let abandoned = wait_for(
            || {
                store
                    .record("k3")
                    .is_some_and(|r| r.status == OutboxStatus::Abandoned)
            },
            Duration::from_secs(2),
        )
        .await;
        assert!(abandoned, "record never reached Abandoned");
        assert_eq!(handler.calls(), 0);

        shutdown(cancel, workers).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn panicking_handler_counts_as_failed_attempt() {
        let store = Arc::new(InMemoryOutboxStore::new(1));
        seed_created(&store, "k4", OutboxKind::Author);
        let handler = RecordingHandler::panicking();
        let scheduler = DeliveryScheduler::new(
            Arc::clone(&store),
            Arc::new(InMemoryTransactor::new()),
            registry_with(OutboxKind::Author, Arc::clone(&handler)),
            fast_config(1),
        );

        let cancel = CancellationToken::new();
        let workers = scheduler.start(cancel.clone());

        let abandoned = wait_for(
            || {
                store
                    .record("k4")
                    .is_some_and(|r| r.status == OutboxStatus::Abandoned)
            },
            Duration::from_secs(2),
        )
        .await;
        assert!(abandoned, "record never reached Abandoned");

        shutdown(cancel, workers).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn disabled_scheduler_never_leases() {
        let store = Arc::new(InMemoryOutboxStore::new(3));
        seed_created(&store, "k5", OutboxKind::Author);
        let handler = RecordingHandler::succeeding();
        let config = SchedulerConfig {
            enabled: false,
            ..fast_config(1)
        };
        let scheduler = DeliveryScheduler::new(
            Arc::clone(&store),
            Arc::new(InMemoryTransactor::new()),
            registry_with(OutboxKind::Author, Arc::clone(&handler)),
            config,
        );

        let cancel = CancellationToken::new();
        let workers = scheduler.start(cancel.clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.record("k5").unwrap().status, OutboxStatus::Created);
        assert_eq!(handler.calls(), 0);

        shutdown(cancel, workers).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn expired_lease_is_recovered() {
        let lease_ttl = Duration::from_millis(50);
        let store = Arc::new(InMemoryOutboxStore::new(3));
        let now = Utc::now();
        // A worker disappeared while holding this lease twice the TTL ago.
        store.put_record(OutboxRecord {
            idempotency_key: "stale".to_string(),
            kind: OutboxKind::Author,
            payload: b"stale".to_vec(),
            status: OutboxStatus::InProgress,
            attempts: 1,
            created_at: now - chrono::Duration::seconds(5),
            updated_at: now - chrono::Duration::milliseconds(100),
        });

        let handler = RecordingHandler::succeeding();
        let config = SchedulerConfig {
            lease_ttl,
            ..fast_config(1)
        };
        let scheduler = DeliveryScheduler::new(
            Arc::clone(&store),
            Arc::new(InMemoryTransactor::new()),
            registry_with(OutboxKind::Author, Arc::clone(&handler)),
            config,
        );

        let cancel = CancellationToken::new();
        let workers = scheduler.start(cancel.clone());

        let recovered = wait_for(
            || {
                store
                    .record("stale")
                    .is_some_and(|r| r.status == OutboxStatus::Success)
            },
            Duration::from_secs(1),
        )
        .await;
        assert!(recovered, "stale lease was never re-delivered");
        assert_eq!(store.record("stale").unwrap().attempts, 2);

        shutdown(cancel, workers).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_workers_deliver_each_record_exactly_once() {
        let store = Arc::new(InMemoryOutboxStore::new(3));
        for i in 0..100 {
            seed_created(&store, &format!("k{i:03}"), OutboxKind::Author);
        }
        let handler = RecordingHandler::succeeding();
        let scheduler = DeliveryScheduler::new(
            Arc::clone(&store),
            Arc::new(InMemoryTransactor::new()),
            registry_with(OutboxKind::Author, Arc::clone(&handler)),
            fast_config(2),
        );

        let cancel = CancellationToken::new();
        let workers = scheduler.start(cancel.clone());

        let all_done = wait_for(
            || {
                (0..100).all(|i| {
                    store
                        .record(&format!("k{i:03}"))
                        .is_some_and(|r| r.status == OutboxStatus::Success)
                })
            },
            Duration::from_secs(5),
        )
        .await;
        assert!(all_done, "not every record reached Success");

        // Exactly one delivery per record across both workers.
        assert_eq!(handler.calls(), 100);
        let mut delivered = handler.delivered.lock().unwrap().clone();
        delivered.sort();
        delivered.dedup();
        assert_eq!(delivered.len(), 100);

        shutdown(cancel, workers).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn workers_stop_on_cancellation() {
        let store = Arc::new(InMemoryOutboxStore::new(3));
        let scheduler = DeliveryScheduler::new(
            Arc::clone(&store),
            Arc::new(InMemoryTransactor::new()),
            Arc::new(HandlerRegistry::new()),
            fast_config(3),
        );

        let cancel = CancellationToken::new();
        let workers = scheduler.start(cancel.clone());
        cancel.cancel();

        for worker in workers {
            tokio::time::timeout(Duration::from_secs(1), worker)
                .await
                .expect("worker did not stop after cancellation")
                .unwrap();
        }
    }
}
