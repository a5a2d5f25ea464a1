//! Dynatrace client errors

use thiserror::Error;

/// Errors that can occur when interacting with the Dynatrace management API
#[derive(Debug, Error)]
pub enum DynatraceError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The API answered with an error status
    #[error("Dynatrace API error: {0}")]
    Api(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Authentication failed (invalid token, expired, etc.)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid client configuration (e.g., malformed URL or proxy)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
