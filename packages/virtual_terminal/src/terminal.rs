//! Virtual Terminal
//!
//! One per known session. Keeps every byte the session has produced (as seen
//! by this client) so the terminal can be re-attached to the rendering
//! surface at any time and show exactly what continuous attachment would
//! have shown.

use serde::Serialize;
use termdeck_protocol::SessionId;
use tracing::debug;

use crate::surface::{RenderEngine, RenderSurface};

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// Snapshot of a virtual terminal for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminalStatus {
    pub session_id: SessionId,
    pub attached: bool,
    pub linked: bool,
    pub closed: bool,
    pub truncated: bool,
    pub buffer_len: usize,
    pub cols: u16,
    pub rows: u16,
}

pub struct VirtualTerminal<E: RenderEngine> {
    session_id: SessionId,
    /// Output chunks in arrival order
    chunks: Vec<Vec<u8>>,
    buffer_len: usize,
    /// Bytes of the session's output this buffer does not hold (evicted on
    /// the server before we asked, or cleared locally).
    skipped: u64,
    cols: u16,
    rows: u16,
    engine: Option<E>,
    linked: bool,
    closed: bool,
    truncated: bool,
}

impl<E: RenderEngine> VirtualTerminal<E> {
    pub fn new(session_id: impl Into<SessionId>) -> Self {
        Self {
            session_id: session_id.into(),
            chunks: Vec::new(),
            buffer_len: 0,
            skipped: 0,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            engine: None,
            linked: false,
            closed: false,
            truncated: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Absolute offset just past the last byte held. Sent as `since` when
    /// (re)attaching so the server replays only what is missing.
    pub fn end_offset(&self) -> u64 {
        self.skipped + self.buffer_len as u64
    }

    /// Append output. Forwards to the engine only while attached.
    pub fn write(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.chunks.push(data.to_vec());
        self.buffer_len += data.len();
        if let Some(engine) = self.engine.as_mut() {
            engine.write(data);
        }
    }

    /// Accept server output starting at absolute `offset`, dropping any
    /// bytes already held. Returns the number of bytes appended.
    pub fn receive_output(&mut self, offset: u64, data: &[u8]) -> usize {
        let end = self.end_offset();
        let chunk_end = offset + data.len() as u64;

        if chunk_end <= end {
            debug!(session = %self.session_id, offset, "dropping duplicate output");
            return 0;
        }

        if offset > end {
            // Server no longer has the bytes in between
            self.skipped += offset - end;
            self.truncated = true;
            self.write(data);
            return data.len();
        }

        let fresh = &data[(end - offset) as usize..];
        self.write(fresh);
        fresh.len()
    }

    /// The attach handshake completed; replay starts at `offset`.
    pub fn mark_linked(&mut self, offset: u64) {
        let end = self.end_offset();
        if offset > end {
            self.skipped += offset - end;
            self.truncated = true;
        }
        self.linked = true;
    }

    /// The transport dropped; a new attach is needed to resume.
    pub fn mark_unlinked(&mut self) {
        self.linked = false;
    }

    /// The session is gone server-side. Final; the buffer is kept.
    pub fn mark_closed(&mut self) {
        self.closed = true;
        self.linked = false;
    }

    /// Mount an engine on `surface` at the stored size and replay the buffer.
    pub fn attach<S>(&mut self, surface: &mut S)
    where
        S: RenderSurface<Engine = E>,
    {
        if self.engine.is_some() {
            return;
        }
        let mut engine = surface.mount(self.cols, self.rows);
        for chunk in &self.chunks {
            engine.write(chunk);
        }
        self.engine = Some(engine);
    }

    /// Release the engine, keeping its last size. No-op when not attached.
    pub fn detach<S>(&mut self, surface: &mut S)
    where
        S: RenderSurface<Engine = E>,
    {
        if let Some(engine) = self.engine.take() {
            let (cols, rows) = engine.size();
            self.cols = cols;
            self.rows = rows;
            drop(engine);
            surface.unmount();
        }
    }

    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.cols = cols;
        self.rows = rows;
        if let Some(engine) = self.engine.as_mut() {
            engine.resize(cols, rows);
        }
    }

    /// Drop the buffered output. Offsets keep counting so the server is not
    /// asked to resend what was cleared.
    pub fn clear(&mut self) {
        self.skipped += self.buffer_len as u64;
        self.chunks.clear();
        self.buffer_len = 0;
        if let Some(engine) = self.engine.as_mut() {
            engine.write(b"\x1b[H\x1b[2J");
        }
    }

    /// The whole buffer as one contiguous byte vector.
    pub fn buffer(&self) -> Vec<u8> {
        self.chunks.concat()
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    pub fn is_empty(&self) -> bool {
        self.buffer_len == 0
    }

    pub fn size(&self) -> (u16, u16) {
        match &self.engine {
            Some(engine) => engine.size(),
            None => (self.cols, self.rows),
        }
    }

    pub fn engine(&self) -> Option<&E> {
        self.engine.as_ref()
    }

    pub fn is_attached(&self) -> bool {
        self.engine.is_some()
    }

    pub fn is_linked(&self) -> bool {
        self.linked
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// True when some of the session's early output was never received.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn status(&self) -> TerminalStatus {
        let (cols, rows) = self.size();
        TerminalStatus {
            session_id: self.session_id.clone(),
            attached: self.is_attached(),
            linked: self.linked,
            closed: self.closed,
            truncated: self.truncated,
            buffer_len: self.buffer_len,
            cols,
            rows,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::{Vt100Engine, Vt100Surface};

    type Vt = VirtualTerminal<Vt100Engine>;

    #[test]
    fn write_buffers_without_engine() {
        let mut vt = Vt::new("s");
        vt.write(b"abc");
        vt.write(b"def");
        assert_eq!(vt.buffer(), b"abcdef");
        assert!(!vt.is_attached());
        assert_eq!(vt.end_offset(), 6);
    }

    #[test]
    fn attach_replays_buffer() {
        let mut surface = Vt100Surface::new();
        let mut vt = Vt::new("s");
        vt.write(b"hello before attach");
        vt.attach(&mut surface);
        assert!(vt.engine().unwrap().contents().contains("hello before attach"));
    }

    #[test]
    fn attach_twice_mounts_once() {
        let mut surface = Vt100Surface::new();
        let mut vt = Vt::new("s");
        vt.attach(&mut surface);
        vt.attach(&mut surface);
        assert_eq!(surface.mount_count(), 1);
    }

    #[test]
    fn detach_captures_size_and_keeps_buffer() {
        let mut surface = Vt100Surface::new();
        let mut vt = Vt::new("s");
        vt.attach(&mut surface);
        vt.resize(100, 30);
        vt.write(b"kept");
        vt.detach(&mut surface);

        assert!(!vt.is_attached());
        assert!(!surface.is_mounted());
        assert_eq!(vt.size(), (100, 30));
        assert_eq!(vt.buffer(), b"kept");

        vt.attach(&mut surface);
        assert_eq!(vt.engine().unwrap().size(), (100, 30));
    }

    #[test]
    fn receive_output_drops_duplicates() {
        let mut vt = Vt::new("s");
        assert_eq!(vt.receive_output(0, b"hello"), 5);
        assert_eq!(vt.receive_output(0, b"hello"), 0);
        // Partial overlap keeps only the new tail
        assert_eq!(vt.receive_output(3, b"lo world"), 6);
        assert_eq!(vt.buffer(), b"hello world");
    }

    #[test]
    fn receive_output_gap_marks_truncated() {
        let mut vt = Vt::new("s");
        vt.receive_output(10, b"tail");
        assert!(vt.is_truncated());
        assert_eq!(vt.end_offset(), 14);
        assert_eq!(vt.buffer(), b"tail");
    }

    #[test]
    fn linked_past_end_marks_truncated() {
        let mut vt = Vt::new("s");
        vt.mark_linked(0);
        assert!(!vt.is_truncated());
        vt.mark_linked(50);
        assert!(vt.is_truncated());
        assert_eq!(vt.end_offset(), 50);
        assert!(vt.is_linked());
    }

    #[test]
    fn clear_keeps_offset() {
        let mut vt = Vt::new("s");
        vt.receive_output(0, b"12345");
        vt.clear();
        assert!(vt.is_empty());
        assert_eq!(vt.end_offset(), 5);
        assert_eq!(vt.receive_output(0, b"12345"), 0);
        assert_eq!(vt.receive_output(5, b"6"), 1);
    }

    #[test]
    fn closed_unlinks() {
        let mut vt = Vt::new("s");
        vt.mark_linked(0);
        vt.mark_closed();
        let status = vt.status();
        assert!(status.closed);
        assert!(!status.linked);
        assert_eq!((status.cols, status.rows), (DEFAULT_COLS, DEFAULT_ROWS));
    }

    #[test]
    fn status_serializes_for_status_line() {
        let mut surface = Vt100Surface::new();
        let mut vt = Vt::new("build");
        vt.mark_linked(0);
        vt.receive_output(0, b"make all\r\n");
        vt.attach(&mut surface);

        let json = serde_json::to_value(vt.status()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "session_id": "build",
                "attached": true,
                "linked": true,
                "closed": false,
                "truncated": false,
                "buffer_len": 10,
                "cols": DEFAULT_COLS,
                "rows": DEFAULT_ROWS,
            })
        );
    }
}
