use std::path::PathBuf;

/// Errors that can occur during PTY operations
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    /// Working directory missing, unreadable, or not a directory
    #[error("invalid working directory {}: {reason}", path.display())]
    InvalidPath { path: PathBuf, reason: String },
    /// Failed to open the PTY or start the process
    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),
    /// Failed to write to PTY
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),
    /// Failed to resize PTY
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),
    /// Failed to signal the PTY process
    #[error("failed to signal PTY process: {0}")]
    KillFailed(String),
    /// PTY process has exited
    #[error("PTY process has exited")]
    ProcessExited,
    /// Channel communication error (actor is gone)
    #[error("channel error: {0}")]
    ChannelError(String),
}

impl PtyError {
    /// True when the error means the process (or its actor) is no longer reachable.
    pub fn is_dead_process(&self) -> bool {
        matches!(self, PtyError::ProcessExited | PtyError::ChannelError(_))
    }
}

impl From<anyhow::Error> for PtyError {
    fn from(err: anyhow::Error) -> Self {
        PtyError::SpawnFailed(format!("{:#}", err))
    }
}
