//! termdeck wire protocol
//!
//! Message types exchanged over the single multiplexed WebSocket, plus the
//! JSON bodies of the HTTP control plane. Shared by the server, the client
//! multiplexer and the command-line client.

pub mod api;
mod base64_bytes;
mod error;
mod messages;

pub use error::ProtocolError;
pub use messages::{ClientMessage, ServerMessage};

/// Session identifier (UUID v4 rendered as a string).
pub type SessionId = String;

/// Path of the WebSocket endpoint.
pub const WS_PATH: &str = "/api/ws";

/// Maximum accepted frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Message used for every ownership or existence denial, so callers cannot
/// discover sessions they do not own.
pub const SESSION_NOT_FOUND: &str = "session not found";
