//! Error types for Gatekeeper
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// All error types that can occur in Gatekeeper
#[derive(Debug, Error)]
pub enum GatekeeperError {
    /// Provider/model pair that cannot form a learned-limit key
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Advisory file lock could not be acquired in time
    #[error("Lock error: {0}")]
    Lock(String),

    /// Persisted state could not be written or read back
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Record not found in a store
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid configuration value
    #[error("Config error: {0}")]
    Config(String),

    /// Scheduler-internal failure
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for Gatekeeper operations
pub type Result<T> = std::result::Result<T, GatekeeperError>;
