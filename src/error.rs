//! Error types for eodms-dl
//!
//! This module provides the error taxonomy for the library:
//! - Fatal errors (configuration, authentication, unreadable input) that abort a run
//! - Transient remote errors (timeouts, 5xx, throttling) that are retried with backoff
//! - Permanent remote errors that end up as a failure reason on a single record
//!
//! Per-record failures are never propagated as `Err` through the pipeline; they are
//! captured into the record's status (see [`crate::types::RecordStatus::Failed`]).

use crate::types::RecordKey;
use thiserror::Error;

/// Result type alias for eodms-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for eodms-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "rapi.username")
        key: Option<String>,
    },

    /// The remote service rejected the credentials
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Network error from the HTTP client
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The remote service answered with an error status
    #[error("remote service returned {status}: {message}")]
    Remote {
        /// HTTP status code
        status: u16,
        /// Response body or reason phrase
        message: String,
    },

    /// A remote call exceeded its configured timeout
    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        /// The remote operation that timed out (search, order, status, download)
        operation: &'static str,
        /// The timeout that elapsed, in seconds
        seconds: u64,
    },

    /// A transfer ended before the expected number of bytes arrived
    #[error("incomplete transfer: expected {expected} bytes, got {actual}")]
    IncompleteTransfer {
        /// Size reported by the remote service
        expected: u64,
        /// Size written to disk
        actual: u64,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Results table could not be read or written
    #[error("results table error: {0}")]
    Csv(#[from] csv::Error),

    /// Input (results file, record ids, dates) could not be understood
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A record was asked to move along an edge the state machine does not have
    #[error("record {key} cannot move from {from} to {to}")]
    InvalidTransition {
        /// The record being updated
        key: RecordKey,
        /// Current status label
        from: &'static str,
        /// Requested status label
        to: &'static str,
    },

    /// Record not present in the store
    #[error("record not found: {0}")]
    NotFound(RecordKey),

    /// Operation stopped because the run was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build a configuration error for a specific key
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }

    /// Whether this error must abort the whole run rather than a single record or batch
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config { .. } | Error::Authentication(_) | Error::InvalidInput(_) | Error::Csv(_)
        )
    }
}
