//! The structured transfer error and its retry classification.
//!
//! The worker pool retries a job only when the error kind is transient;
//! everything else goes straight to the dead-letter stream. Composition code
//! wraps these in `anyhow` at the tool boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CopyError {
    /// Local read/write failure. Retryable unless the underlying kind says
    /// the source is simply absent.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network or SSH transport-level failure (connect, handshake, broken
    /// session). Retryable.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A remote command (sftp write, tar extraction in a container or pod)
    /// failed; the remote message is reported verbatim. Retryable.
    #[error("remote command failed: {0}")]
    RemoteExec(String),

    /// Authentication or authorization rejected. Not retryable.
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("source not found: {0}")]
    SourceNotFound(String),

    #[error("invalid destination {uri:?}: {reason}")]
    BadUri { uri: String, reason: String },

    #[error("invalid argument: {0}")]
    BadArgument(String),

    /// A stream with a declared size ended early. Fatal for the job.
    #[error("{0}")]
    SourceTruncated(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl CopyError {
    /// Whether the worker pool may re-attempt the job.
    pub fn is_retryable(&self) -> bool {
        match self {
            CopyError::Io(err) => !matches!(
                err.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::UnexpectedEof
            ),
            CopyError::Connection(_) | CopyError::RemoteExec(_) => true,
            CopyError::Auth(_)
            | CopyError::SourceNotFound(_)
            | CopyError::BadUri { .. }
            | CopyError::BadArgument(_)
            | CopyError::SourceTruncated(_)
            | CopyError::Cancelled => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CopyError::Cancelled)
    }
}

impl From<throttle::Cancelled> for CopyError {
    fn from(_: throttle::Cancelled) -> Self {
        CopyError::Cancelled
    }
}
