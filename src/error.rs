//! Error types for the SWIFT pipeline orchestrator

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {

    // =============================
    // Text Generation Capability
    // =============================

    #[error("Transient capability error: {0}")]
    TransientCapability(String),

    #[error("Fatal capability error: {0}")]
    FatalCapability(String),

    #[error("Capability call timed out after {0} ms")]
    Timeout(u64),

    #[error("Malformed capability response: {0}")]
    MalformedResponse(String),

    // =============================
    // Pipeline Errors
    // =============================

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Detector error: {0}")]
    DetectorError(String),

    #[error("Worker error: {0}")]
    WorkerError(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl PipelineError {
    /// Whether a bounded retry may be attempted for this failure
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::TransientCapability(_) | PipelineError::Timeout(_) => true,
            PipelineError::HttpError(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}
