//! Error types for the parameter server and its clients.
//!
//! The variants follow the failure taxonomy of the RPC path: connection
//! failures are fatal to a client, protocol and format failures are fatal to
//! a single RPC, and store failures indicate corrupted internal state.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the adps library.
#[derive(Debug, Error)]
pub enum PsError {
    // Transport errors
    #[error("Connection error: {message}")]
    Connection {
        message: String,
        /// Optional cause description
        cause: Option<String>,
    },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // Wire envelope errors
    #[error("Format error: {message}")]
    Format { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    // Server state errors
    #[error("Store error: {message}")]
    Store { message: String },

    #[error("Usage error: {message}")]
    Usage { message: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

/// Result type alias for adps operations.
pub type Result<T> = std::result::Result<T, PsError>;

impl From<std::io::Error> for PsError {
    fn from(err: std::io::Error) -> Self {
        PsError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for PsError {
    fn from(err: serde_json::Error) -> Self {
        PsError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl PsError {
    pub fn connection(message: impl Into<String>) -> Self {
        PsError::Connection {
            message: message.into(),
            cause: None,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        PsError::Protocol {
            message: message.into(),
        }
    }

    pub fn format(message: impl Into<String>) -> Self {
        PsError::Format {
            message: message.into(),
        }
    }

    pub fn usage(message: impl Into<String>) -> Self {
        PsError::Usage {
            message: message.into(),
        }
    }

    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        PsError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Numeric code used in logs and error replies.
    ///
    /// - 1: connection
    /// - 2: protocol
    /// - 3: format
    /// - 4: invalid request
    /// - 5: store
    /// - 6: usage
    /// - 7: I/O or serialization
    pub fn code(&self) -> i32 {
        match self {
            PsError::Connection { .. } => 1,
            PsError::Protocol { .. } => 2,
            PsError::Format { .. } => 3,
            PsError::InvalidRequest { .. } => 4,
            PsError::Store { .. } => 5,
            PsError::Usage { .. } => 6,
            PsError::Io { .. } | PsError::Json { .. } => 7,
        }
    }

    /// Whether a client that observed this error must stop issuing RPCs.
    pub fn is_fatal_to_client(&self) -> bool {
        matches!(self, PsError::Connection { .. } | PsError::Usage { .. })
    }
}
