pub mod health;
pub mod sessions;
pub mod websocket;

// Re-export all handlers for easy route registration
pub use health::{health_handler, health_live_handler, metrics_handler};
pub use sessions::{create_session, delete_session, get_session, list_sessions, rename_session};
pub use websocket::websocket_handler;
