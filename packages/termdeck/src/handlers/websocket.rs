use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};
use termdeck_protocol::MAX_FRAME_SIZE;

use crate::AppState;
use crate::auth::AuthUser;
use crate::ws;

/// Multiplexed session channel. The auth middleware has already resolved the
/// caller, so an unauthenticated request never gets here.
pub async fn websocket_handler(
    State(state): State<AppState>,
    user: AuthUser,
    ws: WebSocketUpgrade,
) -> Response {
    let registry = state.registry.clone();
    let metrics = state.metrics.clone();
    ws.max_message_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| ws::handle_connection(socket, registry, metrics, user.owner_id))
}
