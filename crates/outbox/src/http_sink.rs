//! HTTP sink handlers.
//!
//! A sink deserializes the record payload into its entity shape and POSTs
//! the entity's id to a preconfigured URL with
//! `Content-Type: application/json`. Any 2xx response is a success; other
//! statuses, network errors and timeouts are transient failures. A payload
//! that does not deserialize is permanent.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;

use biblio_core::{Author, Book};
use biblio_store::OutboxKind;

use crate::registry::{HandlerError, HandlerRegistry, KindHandler};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const TCP_KEEPALIVE: Duration = Duration::from_secs(180);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const MAX_IDLE_PER_HOST: usize = 32;

/// Build the HTTP client shared by all sink handlers.
///
/// The client is internally thread-safe; connection pooling, keep-alive and
/// timeouts are configured here once at startup.
pub fn build_http_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .tcp_keepalive(TCP_KEEPALIVE)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
        .build()
}

/// Entity shape a sink can deliver.
pub trait SinkEntity: DeserializeOwned + Send + Sync {
    /// Identifier posted as the request body.
    fn sink_id(&self) -> String;
}

impl SinkEntity for Author {
    fn sink_id(&self) -> String {
        self.id.to_string()
    }
}

impl SinkEntity for Book {
    fn sink_id(&self) -> String {
        self.id.to_string()
    }
}

/// Handler posting the deserialized entity's id to one URL.
pub struct HttpSink<E> {
    client: Client,
    url: Url,
    _entity: PhantomData<fn() -> E>,
}

impl<E> HttpSink<E> {
    pub fn new(client: Client, url: Url) -> Self {
        Self {
            client,
            url,
            _entity: PhantomData,
        }
    }
}

#[async_trait]
impl<E> KindHandler for HttpSink<E>
where
    E: SinkEntity + 'static,
{
    async fn deliver(&self, payload: &[u8]) -> Result<(), HandlerError> {
        let entity: E = serde_json::from_slice(payload)
            .map_err(|e| HandlerError::Permanent(format!("cannot deserialize sink payload: {e}")))?;

        let response = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(entity.sink_id())
            .send()
            .await
            .map_err(|e| HandlerError::Transient(format!("post failed: {e}")))?;

        if !response.status().is_success() {
            return Err(HandlerError::Transient(format!(
                "non-2xx response: {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Wire the author and book sinks into a registry.
pub fn sink_registry(client: Client, author_url: Url, book_url: Url) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(
        OutboxKind::Author,
        Arc::new(HttpSink::<Author>::new(client.clone(), author_url)),
    );
    registry.register(
        OutboxKind::Book,
        Arc::new(HttpSink::<Book>::new(client, book_url)),
    );
    registry
}
