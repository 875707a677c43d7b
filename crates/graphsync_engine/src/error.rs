//! Error types for the sync engine.

use graphsync_protocol::{ConnectionId, ProtocolError};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Protocol error (invalid frame or message).
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// No healthy connection is available.
    #[error("not connected to server")]
    NotConnected,

    /// Every connection attempt failed.
    #[error("connection {connection} failed: {reason}")]
    ConnectionFailed {
        /// Connection that failed.
        connection: ConnectionId,
        /// Last failure reason.
        reason: String,
    },

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// A queue flush is already running.
    #[error("offline queue flush already in progress")]
    AlreadySyncing,

    /// The coordinator has been shut down.
    #[error("sync engine shut down")]
    Shutdown,

    /// Invalid state transition.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },
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

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout | SyncError::NotConnected => true,
            _ => false,
        }
    }
}
