//! Domain error model.
//!
//! One transport-agnostic taxonomy for the whole service. The stores map
//! database failures into it, the use-case layer surfaces it unchanged, and
//! a transport adapter (out of scope here) translates kinds to wire codes.

use thiserror::Error;

/// Result type used across the domain and store layers.
pub type DomainResult<T> = Result<T, DomainError>;

/// Failure kinds exposed by the core.
///
/// `Validation`, `NotFound`, `ReferencedNotFound` and `Conflict` are
/// deterministic business failures. `Transient` covers store/IO errors that
/// may succeed on retry; `Permanent` covers structural failures that will
/// not. `Cancelled` reports that the ambient cancellation signal fired.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Input violates a declared constraint.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The addressed entity id is unknown.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// A referenced entity id is unknown (e.g. a book binding an unknown
    /// author).
    #[error("referenced {0} not found")]
    ReferencedNotFound(&'static str),

    /// Unique/primary-key collision distinguishable from not-found.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Store or IO failure that may succeed on retry.
    #[error("transient store failure: {0}")]
    Transient(String),

    /// Structural, non-retryable failure.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The ambient cancellation signal fired.
    #[error("operation cancelled")]
    Cancelled,
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Whether retrying the failed operation can possibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
