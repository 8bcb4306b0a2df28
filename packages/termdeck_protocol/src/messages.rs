//! WebSocket message types
//!
//! Every frame is a JSON object tagged by `type`. Byte payloads travel as
//! base64 so arbitrary terminal output survives the text channel.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::{MAX_FRAME_SIZE, SessionId};

/// Messages from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start receiving output for a session. `since` is the number of bytes
    /// the client already holds; only output after it is replayed.
    Attach {
        session_id: SessionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since: Option<u64>,
    },
    /// Keystrokes for the session's process
    Input {
        session_id: SessionId,
        #[serde(with = "crate::base64_bytes")]
        data: Vec<u8>,
    },
    Resize {
        session_id: SessionId,
        cols: u16,
        rows: u16,
    },
    Detach {
        session_id: SessionId,
    },
}

/// Messages from server to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Attach succeeded. Replay begins at `offset`, which is greater than the
    /// requested `since` when older output has been evicted.
    Attached { session_id: SessionId, offset: u64 },
    /// Process output. `offset` is the absolute position of the first byte.
    Output {
        session_id: SessionId,
        offset: u64,
        #[serde(with = "crate::base64_bytes")]
        data: Vec<u8>,
    },
    /// The session was destroyed; no further output follows.
    Closed { session_id: SessionId },
    /// Non-fatal error for a single request
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        message: String,
    },
}

impl ClientMessage {
    pub fn session_id(&self) -> &str {
        match self {
            ClientMessage::Attach { session_id, .. }
            | ClientMessage::Input { session_id, .. }
            | ClientMessage::Resize { session_id, .. }
            | ClientMessage::Detach { session_id } => session_id,
        }
    }

    pub fn to_frame(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_frame(text: &str) -> Result<Self, ProtocolError> {
        check_size(text)?;
        Ok(serde_json::from_str(text)?)
    }
}

impl ServerMessage {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ServerMessage::Attached { session_id, .. }
            | ServerMessage::Output { session_id, .. }
            | ServerMessage::Closed { session_id } => Some(session_id),
            ServerMessage::Error { session_id, .. } => session_id.as_deref(),
        }
    }

    pub fn error(session_id: Option<SessionId>, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            session_id,
            message: message.into(),
        }
    }

    pub fn to_frame(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_frame(text: &str) -> Result<Self, ProtocolError> {
        check_size(text)?;
        Ok(serde_json::from_str(text)?)
    }
}

fn check_size(text: &str) -> Result<(), ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: text.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_without_since() {
        let json = r#"{"type":"attach","session_id":"abc"}"#;
        let msg = ClientMessage::from_frame(json).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Attach {
                session_id: "abc".into(),
                since: None
            }
        );
    }

    #[test]
    fn attach_with_since() {
        let json = r#"{"type":"attach","session_id":"abc","since":42}"#;
        match ClientMessage::from_frame(json).unwrap() {
            ClientMessage::Attach { since, .. } => assert_eq!(since, Some(42)),
            other => panic!("expected Attach, got {:?}", other),
        }
    }

    #[test]
    fn input_data_is_base64() {
        let msg = ClientMessage::Input {
            session_id: "s1".into(),
            data: b"ls\r".to_vec(),
        };
        let json = msg.to_frame().unwrap();
        assert!(json.contains(r#""type":"input""#));
        assert!(json.contains(r#""data":"bHMN""#));
    }

    #[test]
    fn output_decodes_binary_payload() {
        let json = r#"{"type":"output","session_id":"s1","offset":7,"data":"G1szMW0A/w=="}"#;
        match ServerMessage::from_frame(json).unwrap() {
            ServerMessage::Output { offset, data, .. } => {
                assert_eq!(offset, 7);
                assert_eq!(data, vec![0x1b, b'[', b'3', b'1', b'm', 0x00, 0xff]);
            }
            other => panic!("expected Output, got {:?}", other),
        }
    }

    #[test]
    fn invalid_base64_is_malformed() {
        let json = r#"{"type":"input","session_id":"s1","data":"not base64!"}"#;
        assert!(matches!(
            ClientMessage::from_frame(json),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn unknown_type_is_malformed() {
        let json = r#"{"type":"teleport","session_id":"s1"}"#;
        assert!(ClientMessage::from_frame(json).is_err());
    }

    #[test]
    fn error_omits_missing_session_id() {
        let json = ServerMessage::error(None, "bad frame").to_frame().unwrap();
        assert_eq!(json, r#"{"type":"error","message":"bad frame"}"#);
    }

    #[test]
    fn closed_tag_is_snake_case() {
        let json = ServerMessage::Closed {
            session_id: "s9".into(),
        }
        .to_frame()
        .unwrap();
        assert_eq!(json, r#"{"type":"closed","session_id":"s9"}"#);
    }

    #[test]
    fn oversized_frame_rejected() {
        let huge = "x".repeat(MAX_FRAME_SIZE + 1);
        assert!(matches!(
            ClientMessage::from_frame(&huge),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn session_id_accessors() {
        let resize = ClientMessage::Resize {
            session_id: "r".into(),
            cols: 100,
            rows: 30,
        };
        assert_eq!(resize.session_id(), "r");
        assert_eq!(ServerMessage::error(None, "x").session_id(), None);
        assert_eq!(
            ServerMessage::error(Some("e".into()), "x").session_id(),
            Some("e")
        );
    }
}
