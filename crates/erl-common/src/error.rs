//! Error types for the entity-resolution loader
//!
//! Errors fall into four categories with different handling policies:
//! configuration errors are fatal at startup and surface usage help,
//! validation errors are terminal per-message, transport errors are
//! classified reconnectable or fatal, and downstream (engine) errors
//! are handled per-message according to the configured policy.

use thiserror::Error;

/// Result type alias for loader operations
pub type Result<T> = std::result::Result<T, LoaderError>;

/// Main error type for the loader
#[derive(Error, Debug)]
pub enum LoaderError {
    /// Configuration is missing or invalid; fatal at startup, never retried
    #[error("Configuration error: {0}. Check command-line flags, environment variables, or the config file.")]
    Config(String),

    /// A single record failed validation; the message is consumed and dropped
    #[error("Invalid record: {0}")]
    Validation(String),

    /// Queue transport failure; see [`TransportError`] for classification
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The resolution engine rejected or failed an add-record call
    #[error("Engine error for record {data_source}/{record_id}: {message}")]
    Downstream {
        data_source: String,
        record_id: String,
        message: String,
    },

    /// File system operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing failed
    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl LoaderError {
    /// Create a configuration error from any displayable message
    pub fn config(msg: impl Into<String>) -> Self {
        LoaderError::Config(msg.into())
    }

    /// Create a downstream (engine) error carrying the record identity
    pub fn downstream(
        data_source: impl Into<String>,
        record_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        LoaderError::Downstream {
            data_source: data_source.into(),
            record_id: record_id.into(),
            message: message.into(),
        }
    }
}

/// Transport failures, classified by whether reconnecting can help.
///
/// Connection drops and channel interruptions are worth retrying with
/// backoff; bad credentials or mismatched queue declare parameters are
/// not, and abort the consumption session.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection-level failure; the session may be reopened with backoff
    #[error("transport connection lost: {0}")]
    Reconnectable(String),

    /// Unrecoverable transport failure (bad credentials, declare mismatch)
    #[error("fatal transport failure: {0}")]
    Fatal(String),
}

impl TransportError {
    /// Whether the consumption session should be reopened with backoff
    pub fn is_reconnectable(&self) -> bool {
        matches!(self, TransportError::Reconnectable(_))
    }
}
