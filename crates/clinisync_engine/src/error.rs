//! Error types for the sync engine.

use clinisync_protocol::{ProtocolError, SyncId, SyncStatus};
use clinisync_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Central failed to process the request (5xx).
    #[error("central error {status}: {message}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// Central refused the request (4xx); retrying the same payload will not help.
    #[error("rejected by central ({status}): {message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Central did not answer the liveness probe.
    #[error("not connected to central")]
    NotConnected,

    /// Malformed wire message.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Journal storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Journal entry could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// No record with this id.
    #[error("sync record not found: {0}")]
    NotFound(SyncId),

    /// A record with this id is already queued.
    #[error("duplicate sync id: {0}")]
    DuplicateSyncId(SyncId),

    /// The record changed since the caller read it.
    #[error(
        "stale sync record {sync_id}: expected {expected}/{expected_attempts}, \
         found {actual}/{actual_attempts}"
    )]
    StaleRecord {
        /// Record id.
        sync_id: SyncId,
        /// Status the caller expected.
        expected: SyncStatus,
        /// Attempt count the caller expected.
        expected_attempts: u32,
        /// Current status.
        actual: SyncStatus,
        /// Current attempt count.
        actual_attempts: u32,
    },

    /// An older record for the same document has not settled yet.
    #[error("sync record {sync_id} waits for older record {older} of the same document")]
    OutOfOrder {
        /// Record the caller tried to claim.
        sync_id: SyncId,
        /// Older record still pending, syncing or in conflict.
        older: SyncId,
    },

    /// Invalid status transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current status.
        from: SyncStatus,
        /// Attempted target status.
        to: SyncStatus,
    },

    /// The collection is not registered with the engine.
    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    /// The document does not exist in its collection.
    #[error("document {document_id} not found in {collection}")]
    DocumentNotFound {
        /// Collection name.
        collection: String,
        /// Document id.
        document_id: String,
    },

    /// Writing a change into a local collection failed.
    #[error("apply failed for {collection}/{document_id}: {message}")]
    Apply {
        /// Collection name.
        collection: String,
        /// Document id.
        document_id: String,
        /// Failure reason.
        message: String,
    },

    /// The engine is already running.
    #[error("sync engine already running")]
    AlreadyRunning,

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates an apply error.
    pub fn apply(
        collection: impl Into<String>,
        document_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Apply {
            collection: collection.into(),
            document_id: document_id.into(),
            message: message.into(),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Server { .. } => true,
            SyncError::Timeout => true,
            SyncError::NotConnected => true,
            _ => false,
        }
    }

    /// Returns true if central refused the request as malformed or forbidden.
    pub fn is_client_error(&self) -> bool {
        matches!(self, SyncError::Rejected { .. })
    }
}

impl From<ciborium::de::Error<std::io::Error>> for SyncError {
    fn from(err: ciborium::de::Error<std::io::Error>) -> Self {
        SyncError::Codec(err.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for SyncError {
    fn from(err: ciborium::ser::Error<std::io::Error>) -> Self {
        SyncError::Codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection reset").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::Server {
            status: 503,
            message: "maintenance".into()
        }
        .is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn client_errors_are_permanent() {
        let err = SyncError::Rejected {
            status: 422,
            message: "missing patient name".into(),
        };
        assert!(err.is_client_error());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("422"));
    }

    #[test]
    fn error_display() {
        assert_eq!(SyncError::NotConnected.to_string(), "not connected to central");

        let err = SyncError::InvalidStateTransition {
            from: SyncStatus::Synced,
            to: SyncStatus::Pending,
        };
        assert_eq!(err.to_string(), "invalid state transition from synced to pending");
    }
}
