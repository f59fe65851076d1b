//! Error types for trackersync
//!
//! One error enum covers the credential, remote-client, mapping and
//! persistence failure modes. Connection-level and credential-level errors are
//! fatal to a sync job; everything else is recorded per item.

use crate::devops::retry::{RetryDecision, RetryableError};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for trackersync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Error type for trackersync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// No connection row for the given id
    #[error("Connection not found: {0}")]
    ConnectionNotFound(i64),

    /// Authorization code exchange rejected upstream
    #[error("OAuth exchange failed: HTTP {status}: {body}")]
    OAuthExchange { status: u16, body: String },

    /// Refresh grant rejected upstream; the connection must be re-authorized
    #[error("OAuth refresh failed: HTTP {status}: {body}")]
    OAuthRefresh { status: u16, body: String },

    /// Token expired and no refresh token is stored
    #[error("Connection {0} has no refresh token; re-authorization required")]
    RefreshUnavailable(i64),

    /// Stored ciphertext is malformed or failed authentication
    #[error("Decryption error: {0}")]
    Decryption(String),

    /// Work-item query rejected upstream
    #[error("Query error: HTTP {status}: {body}")]
    Query { status: u16, body: String },

    /// Work-item fetch/create/update rejected upstream
    #[error("Fetch error: HTTP {status}: {body}")]
    Fetch { status: u16, body: String },

    /// The work item changed between read and patch
    #[error("Concurrency conflict on work item {id} (expected revision {rev})")]
    ConcurrencyConflict { id: i64, rev: i64 },

    /// No sync job row for the given id
    #[error("Sync job not found: {0}")]
    JobNotFound(i64),

    /// Malformed request or mapping
    #[error("Validation error: {0}")]
    Validation(String),

    /// Requester may not act on the target tenant
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage errors that are not raw SQLite errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// SQLite database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Rate limited (retry-after in seconds)
    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl SyncError {
    /// Errors that abort a whole sync job rather than a single item.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionNotFound(_)
                | SyncError::OAuthExchange { .. }
                | SyncError::OAuthRefresh { .. }
                | SyncError::RefreshUnavailable(_)
                | SyncError::Decryption(_)
                | SyncError::Config(_)
        )
    }

    /// True when the upstream rejected a write because of a unique constraint.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            SyncError::Database(rusqlite::Error::SqliteFailure(e, _)) => {
                e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
            }
            _ => false,
        }
    }
}

impl RetryableError for SyncError {
    fn retry_decision(&self) -> RetryDecision {
        match self {
            SyncError::Http(e) => {
                if e.is_connect() || e.is_timeout() {
                    RetryDecision::Retry
                } else if let Some(status) = e.status() {
                    match status.as_u16() {
                        429 => RetryDecision::RetryAfter(Duration::from_secs(60)),
                        500..=599 => RetryDecision::Retry,
                        _ => RetryDecision::NoRetry,
                    }
                } else {
                    RetryDecision::Retry
                }
            }
            SyncError::Query { status, .. } | SyncError::Fetch { status, .. } => match status {
                429 => RetryDecision::RetryAfter(Duration::from_secs(60)),
                500..=599 => RetryDecision::Retry,
                _ => RetryDecision::NoRetry,
            },
            SyncError::RateLimited(secs) => RetryDecision::RetryAfter(Duration::from_secs(*secs)),
            _ => RetryDecision::NoRetry,
        }
    }
}
