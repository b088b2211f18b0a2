//! Library service entry point: delivery workers over a Postgres outbox.
//!
//! The transport layer (gRPC/REST) plugs `biblio_catalog::LibraryService`
//! onto the same pool and transactor; this binary runs the store wiring and
//! the delivery scheduler and shuts both down on SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::info;

use biblio_outbox::{
    build_http_client, sink_registry, DeliveryScheduler, HandlerRegistry, OutboxConfig,
};
use biblio_store::{PgOutboxStore, PgTransactor};

const DEFAULT_MAX_CONNECTIONS: u32 = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    biblio_observability::init();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let max_connections = match std::env::var("DATABASE_MAX_CONNECTIONS") {
        Ok(raw) => raw
            .parse()
            .context("DATABASE_MAX_CONNECTIONS must be an integer")?,
        Err(_) => DEFAULT_MAX_CONNECTIONS,
    };

    let outbox_config = OutboxConfig::from_env()?;
    outbox_config.validate()?;

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(&database_url)
        .await
        .context("cannot connect to postgres")?;

    let outbox_store = Arc::new(PgOutboxStore::new(
        pool.clone(),
        outbox_config.attempts_retry,
    ));
    let transactor = Arc::new(PgTransactor::new(pool.clone()));

    let registry = match (&outbox_config.author_send_url, &outbox_config.book_send_url) {
        (Some(author_url), Some(book_url)) => {
            let client = build_http_client().context("cannot build http client")?;
            sink_registry(client, author_url.clone(), book_url.clone())
        }
        // Leasing is disabled without sink URLs; validation guarantees they
        // are present whenever the outbox is enabled.
        _ => HandlerRegistry::new(),
    };

    let scheduler = DeliveryScheduler::new(
        outbox_store,
        transactor,
        Arc::new(registry),
        outbox_config.scheduler_config(),
    );

    let cancel = CancellationToken::new();
    let workers = scheduler.start(cancel.clone());
    info!(
        workers = workers.len(),
        enabled = outbox_config.enabled,
        "outbox delivery started"
    );

    shutdown_signal()
        .await
        .context("cannot listen for shutdown signal")?;
    info!("shutdown signal received, draining workers");

    cancel.cancel();
    for worker in workers {
        let _ = worker.await;
    }

    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
