//! PTY Manager - process adapter for interactive shells
//!
//! Spawns one shell per call inside a pseudo-terminal and exposes it through
//! an actor handle plus a single ordered event stream. It has no HTTP
//! dependencies and no knowledge of sessions or owners.
//!
//! # Example
//!
//! ```no_run
//! use pty_manager::{PtyActor, PtyConfig, PtyEvent, PtySignal};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), pty_manager::PtyError> {
//!     let (handle, mut events) = PtyActor::spawn(PtyConfig::shell("/tmp")).await?;
//!
//!     handle.write_str("echo hello\n").await?;
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             PtyEvent::Output(data) => print!("{}", String::from_utf8_lossy(&data)),
//!             PtyEvent::Exited { exit_code } => {
//!                 println!("exited: {:?}", exit_code);
//!                 break;
//!             }
//!         }
//!     }
//!
//!     handle.kill(PtySignal::Hangup).await.ok();
//!     Ok(())
//! }
//! ```

mod error;
pub mod pty;

pub use error::PtyError;
pub use pty::{
    PtyActor, PtyConfig, PtyEvent, PtyEvents, PtyHandle, PtySignal, PtyState, default_shell,
    resolve_working_dir,
};
