//! Error types for the ledger RPC core.
//!
//! A single `thiserror` enumeration covers every failure the indices, the
//! ingestion pipeline and the preflight worker pool can report. Ingestion
//! failures never leave the pipeline; query and simulation failures are
//! returned to the caller as-is.

use std::time::Duration;
use thiserror::Error;

/// Error type for all ledger RPC core operations.
#[derive(Debug, Error)]
pub enum RpcCoreError {
    /// A bucket or ledger arrived with a sequence other than the next expected one.
    ///
    /// Raised by `RetentionWindow::append` and by the ingestion pipeline when
    /// the backend delivers a ledger out of order or twice.
    #[error("Out of order ledger: expected {expected}, got {got}")]
    OutOfOrder {
        /// The sequence the receiver was waiting for.
        expected: u32,
        /// The sequence that was actually delivered.
        got: u32,
    },

    /// A ledger was skipped: the delivered sequence is ahead of the expected one.
    #[error("Ledger gap: expected {expected}, got {got}")]
    Gap {
        /// The sequence the receiver was waiting for.
        expected: u32,
        /// The sequence that was actually delivered.
        got: u32,
    },

    /// Malformed ledger metadata or a corrupt persisted blob.
    #[error("Decoding error: {0}")]
    Decode(String),

    /// The requested ledger, transaction or entry is outside the retained data.
    #[error("Not found")]
    NotFound,

    /// A query was rejected before touching any index (bad filter, bad cursor).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The preflight queue is full; the caller should back off.
    #[error("Preflight worker pool saturated")]
    PoolSaturated,

    /// The preflight worker pool has been closed.
    #[error("Preflight worker pool closed")]
    PoolClosed,

    /// A simulation job's deadline elapsed before a worker picked it up.
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// Errors encountered during database operations.
    ///
    /// Wraps `sqlx::Error` so store code can propagate with `?`.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Errors reported by the external ledger backend.
    #[error("Ledger backend error: {0}")]
    Backend(String),

    /// A single ingestion attempt exceeded the configured timeout.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Errors related to configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors from environment variable operations.
    #[error("Environment variable error: {0}")]
    EnvVar(#[from] std::env::VarError),

    /// Errors raised by the simulation executor itself.
    #[error("Simulation error: {0}")]
    Simulation(String),

    /// Catch-all for unexpected failures (task join errors and the like).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Type alias for Results using `RpcCoreError`.
pub type Result<T> = std::result::Result<T, RpcCoreError>;

impl From<borsh::io::Error> for RpcCoreError {
    fn from(err: borsh::io::Error) -> Self {
        RpcCoreError::Decode(err.to_string())
    }
}

impl From<tokio::task::JoinError> for RpcCoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        RpcCoreError::Internal(err.to_string())
    }
}
