//! Error types for the sync engine.

use fieldsync_protocol::OperationId;
use thiserror::Error;

/// Result type for sync engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in the sync engine.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Journal I/O error.
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Journal frame could not be encoded or decoded.
    #[error("journal codec error: {0}")]
    Codec(String),

    /// Another process holds the journal lock.
    #[error("journal is locked by another process: {path}")]
    JournalLocked {
        /// Path to the locked journal file.
        path: String,
    },

    /// The queue state for a single record is inconsistent.
    ///
    /// Fatal to the affected record only; other records and devices
    /// are unaffected.
    #[error("queue corruption for operation {id}: {detail}")]
    QueueCorruption {
        /// The affected operation.
        id: OperationId,
        /// What was inconsistent.
        detail: String,
    },

    /// No record with the given id exists.
    #[error("unknown operation {id}")]
    UnknownOperation {
        /// The missing operation id.
        id: OperationId,
    },

    /// A remote apply call exceeded its deadline.
    #[error("remote apply timed out")]
    Timeout,

    /// The remote applier failed before producing an outcome.
    #[error("remote apply failed: {message}")]
    Remote {
        /// Error message from the applier.
        message: String,
        /// Whether the attempt can be retried.
        retryable: bool,
    },
}

impl SyncError {
    /// Creates a retryable remote error.
    pub fn remote_retryable(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable remote error.
    pub fn remote_fatal(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if a failed remote attempt with this error should
    /// be retried (transient failure) rather than dead-lettered.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Remote { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            _ => false,
        }
    }
}
