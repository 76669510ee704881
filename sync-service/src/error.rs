//! Error types for the sync engine.
//!
//! `SyncError` is what the API client and the orchestrator return. Store
//! failures arrive wrapped as `SyncError::Persistence`; image import
//! failures have their own type because the orchestrator recovers from them.

use thiserror::Error;

/// Errors raised by the local store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database query error
    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),

    /// Could not get a connection from the pool
    #[error("Database connection error: {0}")]
    Pool(String),

    /// A schema migration failed
    #[error("Migration failed: {0}")]
    Migration(String),

    /// A JSON column could not be encoded or decoded
    #[error("Invalid JSON column: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Row expected but missing
    #[error("{0} not found")]
    NotFound(String),

    /// A write that would break a table invariant
    #[error("Rejected write: {0}")]
    Rejected(String),
}

impl From<diesel_async::pooled_connection::deadpool::PoolError> for StoreError {
    fn from(err: diesel_async::pooled_connection::deadpool::PoolError) -> Self {
        StoreError::Pool(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised while talking to the remote platform or running a sync
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport failure (DNS, TLS, timeout, connection reset)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Login rejected or credentials missing
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The local throttle refused the call
    #[error("Rate limit exceeded for {identifier} ({context})")]
    RateLimited { identifier: String, context: String },

    /// Empty body, HTML instead of JSON, or malformed JSON
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Non-2xx status from the remote API
    #[error("Remote API error {status}: {message}")]
    RemoteApi { status: u16, message: String },

    /// Local write or read failure
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// Missing or invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Another run holds the run lock
    #[error("A sync run is already in progress")]
    AlreadyRunning,
}

impl SyncError {
    pub fn remote(status: u16, message: impl Into<String>) -> Self {
        SyncError::RemoteApi {
            status,
            message: message.into(),
        }
    }

    /// Message safe to persist and show to an operator
    pub fn user_message(&self) -> String {
        match self {
            SyncError::Connection(_) => "Could not reach the remote server".to_string(),
            SyncError::Persistence(_) => "Could not write to the local database".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SyncError::InvalidResponse(err.to_string())
        } else {
            SyncError::Connection(err.to_string())
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_hides_transport_detail() {
        let err = SyncError::Connection("tcp connect error: 10.0.0.1:443".to_string());
        assert_eq!(err.user_message(), "Could not reach the remote server");

        let err = SyncError::Persistence(StoreError::NotFound("event".to_string()));
        assert!(!err.user_message().contains("event"));
    }

    #[test]
    fn test_remote_error_display() {
        let err = SyncError::remote(503, "maintenance");
        assert_eq!(err.to_string(), "Remote API error 503: maintenance");
    }
}
