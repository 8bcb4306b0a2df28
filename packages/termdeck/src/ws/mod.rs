//! Multiplexed session transport over one WebSocket per client.

mod dispatch;
mod handler;

pub use dispatch::{ConnectionContext, dispatch};
pub use handler::handle_connection;
