//! Kind dispatch registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use biblio_store::OutboxKind;

/// Classification of a failed delivery attempt.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Delivery may succeed on retry (network error, timeout, non-2xx
    /// response).
    #[error("transient delivery failure: {0}")]
    Transient(String),
    /// Delivery can never succeed (undecodable payload, unknown kind,
    /// handler panic).
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

/// Delivers one record's payload.
#[async_trait]
pub trait KindHandler: Send + Sync {
    async fn deliver(&self, payload: &[u8]) -> Result<(), HandlerError>;
}

impl std::fmt::Debug for dyn KindHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn KindHandler")
    }
}

/// Closed lookup table from kind to handler.
///
/// Populated during startup and frozen afterwards (the scheduler holds it
/// behind an `Arc`), so reads need no locking.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<OutboxKind, Arc<dyn KindHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for a kind; the last registration wins.
    pub fn register(&mut self, kind: OutboxKind, handler: Arc<dyn KindHandler>) {
        self.handlers.insert(kind, handler);
    }

    /// Look up the handler for a kind.
    ///
    /// `Undefined` and unregistered kinds are permanent failures: no
    /// handler will ever exist for them.
    pub fn get(&self, kind: OutboxKind) -> Result<Arc<dyn KindHandler>, HandlerError> {
        if kind == OutboxKind::Undefined {
            return Err(HandlerError::Permanent(
                "no handler for undefined kind".to_string(),
            ));
        }
        self.handlers
            .get(&kind)
            .cloned()
            .ok_or_else(|| HandlerError::Permanent(format!("no handler registered for kind {kind}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl KindHandler for NoopHandler {
        async fn deliver(&self, _payload: &[u8]) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn undefined_kind_is_permanent() {
        let registry = HandlerRegistry::new();
        let err = registry.get(OutboxKind::Undefined).unwrap_err();
        assert!(matches!(err, HandlerError::Permanent(_)));
    }

    #[test]
    fn unregistered_kind_is_permanent() {
        let registry = HandlerRegistry::new();
        let err = registry.get(OutboxKind::Author).unwrap_err();
        assert!(matches!(err, HandlerError::Permanent(_)));
    }

    #[test]
    fn registered_kind_resolves() {
        let mut registry = HandlerRegistry::new();
        registry.register(OutboxKind::Author, Arc::new(NoopHandler));
        assert!(registry.get(OutboxKind::Author).is_ok());
    }
}
