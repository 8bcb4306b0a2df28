use termdeck_protocol::SessionId;

/// Errors from the client multiplexer
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("no virtual terminal for session {0}")]
    UnknownSession(SessionId),
    #[error("session {0} is closed")]
    SessionClosed(SessionId),
    #[error("no active session")]
    NoActiveSession,
    #[error("transport disconnected")]
    Disconnected,
}
