//! Error types for the conversational finance engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {

    // =============================
    // Core Pipeline Errors
    // =============================

    #[error("Assistant protocol error: {0}")]
    Protocol(String),

    #[error("Assistant throttled: {0}")]
    Throttled(String),

    #[error("Could not reach the assistant: {0}")]
    AssistantUnavailable(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Monthly message limit reached ({used}/{limit})")]
    QuotaExceeded { used: i64, limit: i64 },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Unknown error: {0}")]
    Unknown(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("UUID parse error: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
