//! Asynchronous delivery of outbox records.
//!
//! A pool of workers leases due records from the outbox store, dispatches
//! each record's payload to the handler registered for its kind, and marks
//! the outcome back into the store. Delivery is at-least-once: a worker
//! crash only costs the lease TTL before another worker picks the batch up
//! again.

pub mod config;
pub mod http_sink;
pub mod registry;
pub mod scheduler;

pub use config::{ConfigError, OutboxConfig};
pub use http_sink::{build_http_client, sink_registry, HttpSink, SinkEntity};
pub use registry::{HandlerError, HandlerRegistry, KindHandler};
pub use scheduler::{DeliveryScheduler, SchedulerConfig};
