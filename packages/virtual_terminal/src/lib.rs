//! Client-side virtual terminals
//!
//! Every session a client knows about gets a [`VirtualTerminal`] holding its
//! full output. A [`TerminalMultiplexer`] shows one of them at a time on a
//! single [`RenderSurface`] and speaks the termdeck protocol through a
//! [`Transport`].

mod error;
pub mod multiplexer;
pub mod surface;
pub mod terminal;
mod transport;

pub use error::ClientError;
pub use multiplexer::{MuxEvent, TerminalMultiplexer};
pub use surface::{RenderEngine, RenderSurface, Vt100Engine, Vt100Surface};
pub use terminal::{DEFAULT_COLS, DEFAULT_ROWS, TerminalStatus, VirtualTerminal};
pub use transport::Transport;
