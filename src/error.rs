//! Core error type shared by the retrieval pipeline.
//!
//! The engine distinguishes a handful of failure classes because they map to
//! different behavior at the boundaries: invalid input and unknown ids become
//! 400/404 responses, transient upstream failures are retried, and storage or
//! index failures are fatal to the request that hit them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed request or missing required field. Surfaced as HTTP 400.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Unknown document or entity id. Surfaced as HTTP 404.
    #[error("not found: {0}")]
    NotFound(String),

    /// Upstream (LM or embedding) failure worth retrying: timeout, 429, 5xx.
    #[error("upstream transient failure: {0}")]
    UpstreamTransient(String),

    /// Upstream failure that exhausted retries or cannot be retried.
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// Database failure. Fatal to the calling operation.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Vector index corruption, dimension mismatch, or duplicate id.
    #[error("index error: {0}")]
    Index(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// True for failures that `generate_with_retry` should retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::UpstreamTransient(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
