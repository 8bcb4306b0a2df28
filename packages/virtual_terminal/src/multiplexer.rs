//! Terminal Multiplexer
//!
//! Owns the set of virtual terminals, the single rendering surface and the
//! outbound transport. Exactly one terminal (the active one) is attached to
//! the surface at a time; every other terminal keeps buffering in the
//! background.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use termdeck_protocol::{ClientMessage, ServerMessage, SessionId};
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::surface::RenderSurface;
use crate::terminal::{TerminalStatus, VirtualTerminal};
use crate::transport::Transport;

/// What a server message meant for the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxEvent {
    /// Attach handshake completed.
    Linked {
        session_id: SessionId,
        truncated: bool,
    },
    /// The session ended server-side.
    Closed { session_id: SessionId },
    /// Server reported a non-fatal error.
    Error {
        session_id: Option<SessionId>,
        message: String,
    },
}

pub struct TerminalMultiplexer<S: RenderSurface, T: Transport> {
    surface: S,
    transport: T,
    terminals: HashMap<SessionId, VirtualTerminal<S::Engine>>,
    /// Creation order, for listing and cycling
    order: Vec<SessionId>,
    active: Option<SessionId>,
    nudge_on_link: bool,
}

impl<S: RenderSurface, T: Transport> TerminalMultiplexer<S, T> {
    pub fn new(surface: S, transport: T) -> Self {
        Self {
            surface,
            transport,
            terminals: HashMap::new(),
            order: Vec::new(),
            active: None,
            nudge_on_link: true,
        }
    }

    /// Send a carriage return when an attached, empty terminal links so the
    /// shell draws its prompt. On by default.
    pub fn with_nudge_on_link(mut self, enabled: bool) -> Self {
        self.nudge_on_link = enabled;
        self
    }

    fn send(&mut self, msg: ClientMessage) {
        if let Err(e) = self.transport.send(msg) {
            debug!("dropping outbound message: {}", e);
        }
    }

    /// Get or create the terminal for `session_id`. A new terminal is linked
    /// immediately so output buffers even before it is first shown.
    pub fn create_virtual_terminal(&mut self, session_id: &str) -> &mut VirtualTerminal<S::Engine> {
        match self.terminals.entry(session_id.to_string()) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => {
                info!(session = %session_id, "creating virtual terminal");
                let vt = VirtualTerminal::new(session_id);
                let attach = ClientMessage::Attach {
                    session_id: session_id.to_string(),
                    since: Some(vt.end_offset()),
                };
                if let Err(e) = self.transport.send(attach) {
                    debug!(session = %session_id, "attach not sent: {}", e);
                }
                self.order.push(session_id.to_string());
                slot.insert(vt)
            }
        }
    }

    /// Make `session_id` the terminal shown on the surface.
    pub fn switch_to(&mut self, session_id: &str) -> Result<(), ClientError> {
        if self.active.as_deref() == Some(session_id) {
            return Ok(());
        }
        if !self.terminals.contains_key(session_id) {
            return Err(ClientError::UnknownSession(session_id.to_string()));
        }

        debug!(from = ?self.active, to = %session_id, "switching terminal");

        if let Some(prev) = self.active.take() {
            if let Some(vt) = self.terminals.get_mut(&prev) {
                vt.detach(&mut self.surface);
            }
        }

        if let Some(vt) = self.terminals.get_mut(session_id) {
            vt.attach(&mut self.surface);
        }
        self.active = Some(session_id.to_string());
        self.fit_active();
        Ok(())
    }

    /// Re-fit the active terminal to the surface and report the size.
    pub fn fit_active(&mut self) -> Option<(u16, u16)> {
        let (cols, rows) = self.surface.fit()?;
        let id = self.active.clone()?;
        self.resize_session(&id, cols, rows).ok()?;
        Some((cols, rows))
    }

    /// Resize the active terminal.
    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), ClientError> {
        let id = self.active.clone().ok_or(ClientError::NoActiveSession)?;
        self.resize_session(&id, cols, rows)
    }

    fn resize_session(&mut self, session_id: &str, cols: u16, rows: u16) -> Result<(), ClientError> {
        let vt = self
            .terminals
            .get_mut(session_id)
            .ok_or_else(|| ClientError::UnknownSession(session_id.to_string()))?;
        vt.resize(cols, rows);
        if vt.is_linked() && !vt.is_closed() {
            self.send(ClientMessage::Resize {
                session_id: session_id.to_string(),
                cols,
                rows,
            });
        }
        Ok(())
    }

    /// Send keystrokes to the active terminal's session.
    pub fn input(&mut self, data: &[u8]) -> Result<(), ClientError> {
        let id = self.active.clone().ok_or(ClientError::NoActiveSession)?;
        self.input_to(&id, data)
    }

    pub fn input_to(&mut self, session_id: &str, data: &[u8]) -> Result<(), ClientError> {
        let vt = self
            .terminals
            .get(session_id)
            .ok_or_else(|| ClientError::UnknownSession(session_id.to_string()))?;
        if vt.is_closed() {
            return Err(ClientError::SessionClosed(session_id.to_string()));
        }
        self.transport.send(ClientMessage::Input {
            session_id: session_id.to_string(),
            data: data.to_vec(),
        })
    }

    /// Apply one message from the server.
    pub fn handle_server_message(&mut self, msg: ServerMessage) -> Option<MuxEvent> {
        match msg {
            ServerMessage::Attached { session_id, offset } => {
                let vt = self.terminals.get_mut(&session_id)?;
                if vt.is_closed() {
                    return None;
                }
                vt.mark_linked(offset);
                let truncated = vt.is_truncated();
                let nudge = self.nudge_on_link && vt.is_attached() && vt.is_empty() && offset == 0;
                let (cols, rows) = vt.size();
                debug!(session = %session_id, offset, "linked");

                if self.active.as_deref() == Some(session_id.as_str()) {
                    self.send(ClientMessage::Resize {
                        session_id: session_id.clone(),
                        cols,
                        rows,
                    });
                }
                if nudge {
                    self.send(ClientMessage::Input {
                        session_id: session_id.clone(),
                        data: b"\r".to_vec(),
                    });
                }
                Some(MuxEvent::Linked {
                    session_id,
                    truncated,
                })
            }
            ServerMessage::Output {
                session_id,
                offset,
                data,
            } => {
                match self.terminals.get_mut(&session_id) {
                    Some(vt) if !vt.is_closed() => {
                        vt.receive_output(offset, &data);
                    }
                    Some(_) => {}
                    None => warn!(session = %session_id, "output for unknown session"),
                }
                None
            }
            ServerMessage::Closed { session_id } => {
                let vt = self.terminals.get_mut(&session_id)?;
                if vt.is_closed() {
                    return None;
                }
                info!(session = %session_id, "session closed");
                vt.mark_closed();
                Some(MuxEvent::Closed { session_id })
            }
            ServerMessage::Error {
                session_id,
                message,
            } => {
                warn!(session = ?session_id, "server error: {}", message);
                Some(MuxEvent::Error {
                    session_id,
                    message,
                })
            }
        }
    }

    /// Discard the terminal for `session_id`: release the surface if it was
    /// active and tell the server this client is no longer listening.
    pub fn destroy_virtual_terminal(&mut self, session_id: &str) -> bool {
        let Some(mut vt) = self.terminals.remove(session_id) else {
            return false;
        };
        self.order.retain(|id| id != session_id);
        vt.detach(&mut self.surface);
        if self.active.as_deref() == Some(session_id) {
            self.active = None;
        }
        if !vt.is_closed() {
            self.send(ClientMessage::Detach {
                session_id: session_id.to_string(),
            });
        }
        info!(session = %session_id, "virtual terminal destroyed");
        true
    }

    /// Tear down every terminal and release the surface.
    pub fn destroy(&mut self) {
        for id in self.order.clone() {
            self.destroy_virtual_terminal(&id);
        }
        self.active = None;
    }

    /// Bring the terminal set in line with the server's session list: drop
    /// terminals whose sessions vanished and link new ones.
    pub fn resync(&mut self, session_ids: &[SessionId]) {
        let stale: Vec<SessionId> = self
            .order
            .iter()
            .filter(|id| !session_ids.contains(id))
            .cloned()
            .collect();
        for id in stale {
            self.destroy_virtual_terminal(&id);
        }
        for id in session_ids {
            self.create_virtual_terminal(id);
        }
    }

    /// Re-send `attach{since}` for every linked, open terminal.
    pub fn reconnect_all(&mut self) {
        let targets: Vec<(SessionId, u64)> = self
            .order
            .iter()
            .filter_map(|id| self.terminals.get(id))
            .filter(|vt| vt.is_linked() && !vt.is_closed())
            .map(|vt| (vt.session_id().to_string(), vt.end_offset()))
            .collect();
        for (session_id, since) in targets {
            self.send(ClientMessage::Attach {
                session_id,
                since: Some(since),
            });
        }
    }

    /// Swap in a fresh transport after a reconnect. Every open terminal is
    /// re-linked from the offset it already holds.
    pub fn replace_transport(&mut self, transport: T) {
        self.transport = transport;
        let ids: Vec<SessionId> = self.order.clone();
        for id in ids {
            let Some(vt) = self.terminals.get_mut(&id) else {
                continue;
            };
            if vt.is_closed() {
                continue;
            }
            vt.mark_unlinked();
            let since = vt.end_offset();
            self.send(ClientMessage::Attach {
                session_id: id,
                since: Some(since),
            });
        }
    }

    /// Mark every terminal unlinked (the connection dropped).
    pub fn mark_disconnected(&mut self) {
        for vt in self.terminals.values_mut() {
            vt.mark_unlinked();
        }
    }

    pub fn clear(&mut self, session_id: &str) -> Result<(), ClientError> {
        self.terminals
            .get_mut(session_id)
            .ok_or_else(|| ClientError::UnknownSession(session_id.to_string()))?
            .clear();
        Ok(())
    }

    pub fn clear_all_buffers(&mut self) {
        for vt in self.terminals.values_mut() {
            vt.clear();
        }
    }

    pub fn status(&self, session_id: &str) -> Option<TerminalStatus> {
        self.terminals.get(session_id).map(|vt| vt.status())
    }

    /// Status of every terminal in creation order.
    pub fn statuses(&self) -> Vec<TerminalStatus> {
        self.order
            .iter()
            .filter_map(|id| self.terminals.get(id))
            .map(|vt| vt.status())
            .collect()
    }

    /// The session after the active one, wrapping, skipping closed ones.
    pub fn next_session_id(&self) -> Option<SessionId> {
        let open: Vec<&SessionId> = self
            .order
            .iter()
            .filter(|id| self.terminals.get(*id).is_some_and(|vt| !vt.is_closed()))
            .collect();
        if open.is_empty() {
            return None;
        }
        let pos = self
            .active
            .as_ref()
            .and_then(|active| open.iter().position(|id| *id == active));
        let next = match pos {
            Some(i) => open[(i + 1) % open.len()],
            None => open[0],
        };
        Some(next.clone())
    }

    pub fn terminal(&self, session_id: &str) -> Option<&VirtualTerminal<S::Engine>> {
        self.terminals.get(session_id)
    }

    /// Engine currently mounted on the surface.
    pub fn active_engine(&self) -> Option<&S::Engine> {
        self.terminals.get(self.active.as_ref()?)?.engine()
    }

    pub fn session_ids(&self) -> &[SessionId] {
        &self.order
    }

    pub fn session_count(&self) -> usize {
        self.terminals.len()
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.terminals.contains_key(session_id)
    }

    pub fn active_session_id(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}
