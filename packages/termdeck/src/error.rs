use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use pty_manager::PtyError;
use termdeck_protocol::{SESSION_NOT_FOUND, api::ErrorBody};

/// Failures of session registry operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid working directory {path}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("failed to start shell: {0}")]
    SpawnFailure(String),

    #[error("session {0} not found")]
    NotFound(String),

    #[error("session {session_id} is not owned by {owner_id}")]
    Forbidden {
        session_id: String,
        owner_id: String,
    },

    /// Write or resize against a process that is no longer accepting them.
    #[error("session {session_id} process unavailable: {reason}")]
    Transport { session_id: String, reason: String },
}

impl SessionError {
    /// Map a failure from spawning a shell.
    pub fn from_spawn(err: PtyError) -> Self {
        match err {
            PtyError::InvalidPath { path, reason } => Self::InvalidPath {
                path: path.display().to_string(),
                reason,
            },
            other => Self::SpawnFailure(other.to_string()),
        }
    }

    pub fn transport(session_id: &str, err: PtyError) -> Self {
        Self::Transport {
            session_id: session_id.to_string(),
            reason: err.to_string(),
        }
    }

    /// Ownership failures report as not found.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidPath { .. } => "invalid_path",
            Self::SpawnFailure(_) => "spawn_failed",
            Self::NotFound(_) | Self::Forbidden { .. } => "not_found",
            Self::Transport { .. } => "transport_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidPath { .. } => StatusCode::BAD_REQUEST,
            Self::SpawnFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound(_) | Self::Forbidden { .. } => StatusCode::NOT_FOUND,
            Self::Transport { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Message safe to show the caller.
    pub fn client_message(&self) -> String {
        match self {
            Self::NotFound(_) | Self::Forbidden { .. } => SESSION_NOT_FOUND.to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.client_message(),
            code: self.error_code().to_string(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}
