//! Applies client messages to the session registry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use termdeck_protocol::{ClientMessage, ServerMessage};
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::metrics::ServerMetrics;
use crate::session_registry::{ConnectionId, SessionRegistry};

/// Error replies per connection before further ones are dropped silently.
const MAX_ERROR_REPLIES: u32 = 100;

/// Per-connection state shared by the socket tasks.
pub struct ConnectionContext {
    pub conn_id: ConnectionId,
    pub owner_id: String,
    pub registry: SessionRegistry,
    pub metrics: Arc<ServerMetrics>,
    error_replies: AtomicU32,
}

impl ConnectionContext {
    pub fn new(
        conn_id: ConnectionId,
        owner_id: String,
        registry: SessionRegistry,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            conn_id,
            owner_id,
            registry,
            metrics,
            error_replies: AtomicU32::new(0),
        }
    }

    /// Queue a non-fatal `error` message for this connection.
    pub async fn reply_error(&self, session_id: Option<String>, message: String) {
        let prev = self.error_replies.fetch_add(1, Ordering::Relaxed);
        if prev < MAX_ERROR_REPLIES {
            self.registry
                .notify(&self.conn_id, ServerMessage::error(session_id, message))
                .await;
        }
    }

    /// Handle one text frame.
    pub async fn handle_frame(&self, text: &str) {
        self.metrics.message_received();
        match ClientMessage::from_frame(text) {
            Ok(msg) => dispatch(self, msg).await,
            Err(e) => {
                self.metrics.protocol_error();
                debug!(conn_id = %self.conn_id, "bad frame: {}", e);
                self.reply_error(None, format!("invalid message: {}", e)).await;
            }
        }
    }
}

pub async fn dispatch(ctx: &ConnectionContext, msg: ClientMessage) {
    let session_id = msg.session_id().to_string();
    let registry = &ctx.registry;
    let result = match msg {
        ClientMessage::Attach { session_id, since } => {
            registry.attach(&session_id, &ctx.conn_id, since).await
        }
        ClientMessage::Input { session_id, data } => {
            registry.input(&session_id, &ctx.conn_id, &data).await
        }
        ClientMessage::Resize {
            session_id,
            cols,
            rows,
        } => registry.resize(&session_id, &ctx.conn_id, cols, rows).await,
        ClientMessage::Detach { session_id } => {
            registry.detach(&session_id, &ctx.conn_id).await;
            Ok(())
        }
    };

    if let Err(e) = result {
        match &e {
            SessionError::Forbidden { .. } => {
                warn!(conn_id = %ctx.conn_id, owner = %ctx.owner_id, "denied: {}", e)
            }
            _ => debug!(conn_id = %ctx.conn_id, "request failed: {}", e),
        }
        ctx.reply_error(Some(session_id), e.client_message()).await;
    }
}
