//! Error types for the central authority.

use clinisync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for central operations.
pub type CentralResult<T> = Result<T, CentralError>;

/// Errors that can occur while serving a node.
#[derive(Error, Debug)]
pub enum CentralError {
    /// Invalid request format or content.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Request body could not be decoded.
    #[error("malformed request: {0}")]
    Malformed(#[from] ProtocolError),

    /// Document body over the configured limit.
    #[error("payload of {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge {
        /// Encoded size of the document.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// No such endpoint.
    #[error("no route for {method} {path}")]
    NotFound {
        /// HTTP method.
        method: String,
        /// Request path.
        path: String,
    },

    /// Central is down for maintenance.
    #[error("central unavailable")]
    Unavailable,

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CentralError {
    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        self.status_code() >= 500
    }

    /// HTTP status reported for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            CentralError::InvalidRequest(_) | CentralError::Malformed(_) => 400,
            CentralError::NotFound { .. } => 404,
            CentralError::PayloadTooLarge { .. } => 413,
            CentralError::Unavailable => 503,
            CentralError::Internal(_) => 500,
        }
    }
}
