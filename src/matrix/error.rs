//! Error types for credential persistence and the session lifecycle.

use std::path::PathBuf;

use thiserror::Error;

use crate::matrix::session::SessionState;

/// Boxed error reported by the homeserver collaborator.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors from reading or writing the credentials file.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// The store directory or the credentials file could not be accessed.
    #[error("credentials i/o error at {}: {source}", path.display())]
    Io {
        /// Path that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The credentials file exists but is not a valid record.
    #[error("malformed credentials file {}: {source}", path.display())]
    Malformed {
        /// Path of the credentials file.
        path: PathBuf,
        /// Parse error.
        source: serde_json::Error,
    },

    /// The credentials file holds an empty field.
    #[error("incomplete credentials file {}", path.display())]
    Incomplete {
        /// Path of the credentials file.
        path: PathBuf,
    },
}

/// Errors from [`SessionManager`](crate::matrix::SessionManager) operations.
///
/// None of these are retried.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The persisted credentials could not be loaded. Login is not attempted.
    #[error("failed to load credentials: {0}")]
    CredentialLoad(#[source] CredentialError),

    /// Login succeeded but the new credentials could not be persisted.
    #[error("failed to save credentials: {0}")]
    CredentialSave(#[source] CredentialError),

    /// The protocol client could not be built or bound to the cached session.
    #[error("failed to connect to homeserver: {0}")]
    Connect(#[source] BoxError),

    /// The homeserver rejected the login attempt.
    #[error("login failed for {username}: {source}")]
    LoginFailed {
        /// Username submitted to the homeserver.
        username: String,
        /// Rejection reason.
        source: BoxError,
    },

    /// The encryption keys of the new device could not be uploaded.
    #[error("failed to upload device keys: {0}")]
    KeyUpload(#[source] BoxError),

    /// The local store could not be loaded or the full sync failed.
    #[error("sync failed: {0}")]
    SyncFailed(#[source] BoxError),

    /// The message could not be sent.
    #[error("failed to send message to {room_id}: {source}")]
    SendFailed {
        /// Target room.
        room_id: String,
        /// Dispatch error.
        source: BoxError,
    },

    /// The operation is not valid in the current session state.
    #[error("session is {state:?}, operation requires {required:?}")]
    NotReady {
        /// Current state.
        state: SessionState,
        /// State the operation requires.
        required: SessionState,
    },

    /// The protocol client could not be released cleanly.
    #[error("failed to close session: {0}")]
    CloseFailed(#[source] BoxError),
}
