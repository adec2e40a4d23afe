//! Error types for the task engine.
//!
//! Every variant raised after a task was submitted names the task kind and id
//! so an operator can inspect or clean up the device by hand.

use thiserror::Error;

use crate::client::ClientError;
use crate::disposer::DisposeError;
use crate::task::{Checksum, TaskHandle};

#[derive(Debug, Error)]
pub enum Error {
    /// Operation refused before touching the device.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// The device rejected the request; nothing was recorded.
    #[error("failed to submit {operation} task: {source}")]
    Submit {
        operation: &'static str,
        #[source]
        source: ClientError,
    },

    /// Task reached a terminal failure status. Its handle stays recorded.
    #[error("{handle} failed: {reason}")]
    TaskFailed { handle: TaskHandle, reason: String },

    /// No terminal status before the deadline. Its handle stays recorded.
    #[error("timed out waiting for {handle} (last status: {last_status})")]
    TimedOut {
        handle: TaskHandle,
        last_status: String,
    },

    /// Stop/cancel/delete failed. The handle stays recorded for a retry.
    #[error(transparent)]
    Dispose(#[from] DisposeError),

    #[error("checksum mismatch for {path}: expected {expected}, device computed {actual}")]
    ChecksumMismatch {
        path: String,
        expected: Checksum,
        actual: Checksum,
    },

    /// The persisted handle could not be decoded.
    #[error("corrupted task handle in private state: {0}")]
    CorruptHandle(String),

    /// A non-task device call (metadata, digest retrieval) failed.
    #[error("{context}: {source}")]
    Client {
        context: String,
        #[source]
        source: ClientError,
    },

    #[error("state store: {0}")]
    Store(#[from] sqlx::Error),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn client(context: impl Into<String>, source: ClientError) -> Self {
        Error::Client {
            context: context.into(),
            source,
        }
    }

    /// Handle of the task the error refers to, if any.
    pub fn handle(&self) -> Option<TaskHandle> {
        match self {
            Error::TaskFailed { handle, .. } | Error::TimedOut { handle, .. } => Some(*handle),
            Error::Dispose(e) => Some(e.handle),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::TimedOut { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
