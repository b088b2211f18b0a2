//! End-to-end delivery: scheduler workers leasing an in-memory outbox and
//! posting through real HTTP sinks to a local socket.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::{Client, Url};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use biblio_core::{Author, AuthorId};
use biblio_outbox::{DeliveryScheduler, HandlerRegistry, HttpSink, SchedulerConfig};
use biblio_store::{
    idempotency_key, InMemoryOutboxStore, InMemoryTransactor, OutboxKind, OutboxStatus,
    OutboxStore, TxScope,
};

/// Accept HTTP exchanges forever, answering each with `response`; counts
/// requests and remembers the last body.
async fn sink_server(
    response: &'static str,
) -> (Url, Arc<AtomicUsize>, Arc<std::sync::Mutex<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url: Url = format!("http://{}/", listener.local_addr().unwrap())
        .parse()
        .unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let last_body = Arc::new(std::sync::Mutex::new(String::new()));

    let hits_srv = Arc::clone(&hits);
    let body_srv = Arc::clone(&last_body);
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut raw = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let Ok(n) = socket.read(&mut buf).await else {
                    return;
                };
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);
                if let Some(body) = complete_body(&raw) {
                    *body_srv.lock().unwrap() = body;
                    break;
                }
            }
            hits_srv.fetch_add(1, Ordering::SeqCst);
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });

    (url, hits, last_body)
}

/// Body of the request once fully received, per content-length.
fn complete_body(raw: &[u8]) -> Option<String> {
    let header_end = raw.windows(4).position(|w| w == b"\r\n\r\n")?;
    let headers = String::from_utf8_lossy(&raw[..header_end]).to_lowercase();
    let content_length = headers
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let body_start = header_end + 4;
    if raw.len() >= body_start + content_length {
        Some(String::from_utf8_lossy(&raw[body_start..body_start + content_length]).to_string())
    } else {
        None
    }
}

fn author_registry(client: Client, url: Url) -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register(
        OutboxKind::Author,
        Arc::new(HttpSink::<Author>::new(client, url)),
    );
    Arc::new(registry)
}

async fn seed_author(store: &InMemoryOutboxStore) -> (String, Author) {
    let author = Author {
        id: AuthorId::new(),
        name: "Ada".to_string(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    let key = idempotency_key(OutboxKind::Author, author.id);
    let payload = serde_json::to_vec(&author).unwrap();
    store
        .send_message(&TxScope::detached(), &key, OutboxKind::Author, &payload)
        .await
        .unwrap();
    (key, author)
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

fn config() -> SchedulerConfig {
    SchedulerConfig {
        enabled: true,
        workers: 1,
        batch_size: 10,
        wait_time: Duration::from_millis(10),
        lease_ttl: Duration::from_secs(5),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sink_accepting_posts_drives_record_to_success() {
    let (url, hits, last_body) = sink_server("HTTP/1.1 204 No Content\r\n\r\n").await;
    let store = Arc::new(InMemoryOutboxStore::new(3));
    let (key, author) = seed_author(&store).await;

    let scheduler = DeliveryScheduler::new(
        Arc::clone(&store),
        Arc::new(InMemoryTransactor::new()),
        author_registry(Client::new(), url),
        config(),
    );
    let cancel = CancellationToken::new();
    let workers = scheduler.start(cancel.clone());

    let delivered = wait_for(
        || {
            store
                .record(&key)
                .is_some_and(|r| r.status == OutboxStatus::Success)
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(delivered, "record never reached Success");

    let record = store.record(&key).unwrap();
    assert_eq!(record.attempts, 1);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(*last_body.lock().unwrap(), author.id.to_string());

    cancel.cancel();
    for worker in workers {
        worker.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sink_returning_500_leads_to_abandonment() {
    let (url, hits, _) =
        sink_server("HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\n\r\n").await;
    let store = Arc::new(InMemoryOutboxStore::new(2));
    let (key, _) = seed_author(&store).await;

    let scheduler = DeliveryScheduler::new(
        Arc::clone(&store),
        Arc::new(InMemoryTransactor::new()),
        author_registry(Client::new(), url),
        config(),
    );
    let cancel = CancellationToken::new();
    let workers = scheduler.start(cancel.clone());

    let abandoned = wait_for(
        || {
            store
                .record(&key)
                .is_some_and(|r| r.status == OutboxStatus::Abandoned)
        },
        Duration::from_secs(3),
    )
    .await;
    assert!(abandoned, "record never reached Abandoned");

    let record = store.record(&key).unwrap();
    assert_eq!(record.attempts, 3);

    // No further posts once the record is terminal.
    let posts = hits.load(Ordering::SeqCst);
    assert_eq!(posts, 3);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hits.load(Ordering::SeqCst), posts);

    cancel.cancel();
    for worker in workers {
        worker.await.unwrap();
    }
}
