//! Interactive attach: every session the user owns is linked over one
//! WebSocket, and the local tty shows one of them at a time.
//!
//! `Ctrl-]` detaches, `Ctrl-\` cycles to the next session. A dropped
//! connection is re-established with backoff; the session list is fetched
//! again and each terminal resumes from the bytes it already holds.

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use termdeck_protocol::api::SessionSummary;
use termdeck_protocol::{ClientMessage, ServerMessage, SessionId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tracing::{debug, warn};
use virtual_terminal::{MuxEvent, RenderEngine, RenderSurface, TerminalMultiplexer};

use crate::cli::ApiClient;
use crate::cli::daemon::DaemonError;
use crate::cli::terminal::{RawMode, window_size};

const DETACH_BYTE: u8 = 0x1D; // Ctrl-]
const CYCLE_BYTE: u8 = 0x1C; // Ctrl-\

const RECONNECT_INITIAL_DELAY: Duration = Duration::from_millis(250);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(5);
const RECONNECT_ATTEMPTS: u32 = 12;

/// What happened when an attach ended.
#[derive(Debug, PartialEq, Eq)]
pub enum AttachOutcome {
    /// User pressed Ctrl-]; sessions keep running.
    Detached,
    /// Every session ended.
    Exited,
}

// =============================================================================
// Rendering on the local tty
// =============================================================================

/// The local terminal as a rendering surface. Mounting an engine resets the
/// screen so the attached session's replay starts clean.
pub struct TtySurface<W: Write> {
    out: Arc<Mutex<W>>,
    fallback: (u16, u16),
}

impl TtySurface<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write> TtySurface<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Arc::new(Mutex::new(out)),
            fallback: (virtual_terminal::DEFAULT_COLS, virtual_terminal::DEFAULT_ROWS),
        }
    }

    /// Set the window title, shown while a session is active.
    fn set_title(&self, title: &str) {
        write_locked(&self.out, format!("\x1b]0;{}\x07", title).as_bytes());
    }
}

fn write_locked<W: Write>(out: &Mutex<W>, data: &[u8]) {
    if let Ok(mut out) = out.lock() {
        let _ = out.write_all(data);
        let _ = out.flush();
    }
}

impl<W: Write> RenderSurface for TtySurface<W> {
    type Engine = TtyEngine<W>;

    fn mount(&mut self, cols: u16, rows: u16) -> TtyEngine<W> {
        // RIS: leave whatever modes the previous session set
        write_locked(&self.out, b"\x1bc");
        TtyEngine {
            out: self.out.clone(),
            cols,
            rows,
        }
    }

    fn fit(&self) -> Option<(u16, u16)> {
        window_size(std::io::stdout()).or(Some(self.fallback))
    }
}

/// Passes output straight to the tty; the user's terminal emulator does
/// the interpreting.
pub struct TtyEngine<W: Write> {
    out: Arc<Mutex<W>>,
    cols: u16,
    rows: u16,
}

impl<W: Write> RenderEngine for TtyEngine<W> {
    fn write(&mut self, data: &[u8]) {
        write_locked(&self.out, data);
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        self.cols = cols;
        self.rows = rows;
    }

    fn size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }
}

type Mux = TerminalMultiplexer<TtySurface<std::io::Stdout>, mpsc::UnboundedSender<ClientMessage>>;

// =============================================================================
// Keys
// =============================================================================

#[derive(Debug, PartialEq, Eq)]
enum KeyAction {
    Input(Vec<u8>),
    Cycle,
    Detach,
}

/// Split a chunk of stdin into input runs and control keys. Anything after
/// a detach is dropped.
fn scan_keys(data: &[u8]) -> Vec<KeyAction> {
    let mut actions = Vec::new();
    let mut run = Vec::new();
    for &byte in data {
        match byte {
            DETACH_BYTE | CYCLE_BYTE => {
                if !run.is_empty() {
                    actions.push(KeyAction::Input(std::mem::take(&mut run)));
                }
                if byte == DETACH_BYTE {
                    actions.push(KeyAction::Detach);
                    return actions;
                }
                actions.push(KeyAction::Cycle);
            }
            _ => run.push(byte),
        }
    }
    if !run.is_empty() {
        actions.push(KeyAction::Input(run));
    }
    actions
}

// =============================================================================
// Socket plumbing
// =============================================================================

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

enum LinkEvent {
    Message(ServerMessage),
    Lost,
}

/// The tasks pumping one socket. Dropping the link aborts them so a stale
/// socket never feeds the multiplexer.
struct Link {
    generation: u64,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.writer.abort();
        self.reader.abort();
    }
}

fn spawn_link(
    socket: Socket,
    generation: u64,
    events: mpsc::UnboundedSender<(u64, LinkEvent)>,
) -> (mpsc::UnboundedSender<ClientMessage>, Link) {
    let (mut ws_write, mut ws_read) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let frame = match msg.to_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Failed to encode client message: {}", e);
                    continue;
                }
            };
            if ws_write
                .send(tungstenite::Message::Text(frame.into()))
                .await
                .is_err()
            {
                break;
            }
        }
        let _ = ws_write.close().await;
    });

    let reader = tokio::spawn(async move {
        while let Some(frame) = ws_read.next().await {
            match frame {
                Ok(tungstenite::Message::Text(text)) => {
                    match ServerMessage::from_frame(text.as_str()) {
                        Ok(msg) => {
                            if events.send((generation, LinkEvent::Message(msg))).is_err() {
                                return;
                            }
                        }
                        Err(e) => debug!("Ignoring malformed server frame: {}", e),
                    }
                }
                Ok(tungstenite::Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        let _ = events.send((generation, LinkEvent::Lost));
    });

    (
        out_tx,
        Link {
            generation,
            writer,
            reader,
        },
    )
}

async fn connect(client: &ApiClient) -> Result<Socket, DaemonError> {
    let (socket, _) = tokio_tungstenite::connect_async(client.ws_url())
        .await
        .map_err(DaemonError::from_tungstenite)?;
    Ok(socket)
}

// =============================================================================
// Attach loop
// =============================================================================

/// Attach the local terminal to `sessions`, showing `initial` first.
pub async fn attach(
    client: &ApiClient,
    sessions: Vec<SessionSummary>,
    initial: &str,
) -> Result<AttachOutcome, DaemonError> {
    let raw = RawMode::enter(std::io::stdin())?;

    // Connecting is the Unavailable boundary; later drops are retried
    let socket = connect(client).await?;

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (out_tx, mut link) = spawn_link(socket, 0, events_tx.clone());

    let mut names: HashMap<SessionId, String> = HashMap::new();
    let mut mux: Mux = TerminalMultiplexer::new(TtySurface::stdout(), out_tx);
    sync_sessions(&mut mux, &mut names, sessions);
    if mux.switch_to(initial).is_err() {
        return Err(anyhow::anyhow!("session {} is not available", initial).into());
    }
    set_title(&mux, &names);

    #[cfg(unix)]
    let mut sigwinch = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())
        .map_err(anyhow::Error::from)?;

    let (mut stdin_rx, stdin_shutdown) = spawn_stdin_reader();

    let outcome = loop {
        tokio::select! {
            Some(data) = stdin_rx.recv() => {
                if let Some(outcome) = handle_keys(&mut mux, &names, &data) {
                    break Ok(outcome);
                }
            }

            Some((generation, event)) = events_rx.recv() => {
                if generation != link.generation {
                    continue;
                }
                match event {
                    LinkEvent::Message(msg) => {
                        if let Some(event) = mux.handle_server_message(msg) {
                            if let Some(outcome) = handle_mux_event(&mut mux, &names, event) {
                                break Ok(outcome);
                            }
                        }
                    }
                    LinkEvent::Lost => {
                        mux.mark_disconnected();
                        status(&mux, "connection lost, reconnecting");
                        match reconnect(client, &mut mux, &mut names, &events_tx, link.generation + 1).await {
                            Ok(new_link) => link = new_link,
                            Err(e) => break Err(e),
                        }
                        if mux.session_count() == 0 {
                            break Ok(AttachOutcome::Exited);
                        }
                        if mux.active_session_id().is_none() {
                            show_next(&mut mux, &names);
                        }
                    }
                }
            }

            _ = sigwinch.recv() => {
                mux.fit_active();
            }
        }
    };

    stdin_shutdown.store(true, Ordering::Relaxed);
    mux.destroy();
    drop(link);
    drop(raw);
    outcome
}

/// Open a new socket with backoff, reconcile terminals with the server's
/// session list, then hand the multiplexer the new transport so every open
/// terminal re-links from its current offset.
async fn reconnect(
    client: &ApiClient,
    mux: &mut Mux,
    names: &mut HashMap<SessionId, String>,
    events: &mpsc::UnboundedSender<(u64, LinkEvent)>,
    generation: u64,
) -> Result<Link, DaemonError> {
    let mut delay = RECONNECT_INITIAL_DELAY;
    for attempt in 1..=RECONNECT_ATTEMPTS {
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(RECONNECT_MAX_DELAY);

        let socket = match connect(client).await {
            Ok(socket) => socket,
            Err(DaemonError::Unavailable) => {
                debug!(attempt, "server still unavailable");
                continue;
            }
            Err(e) => return Err(e),
        };
        let sessions = match client.list_sessions().await {
            Ok(sessions) => sessions,
            Err(DaemonError::Unavailable) => continue,
            Err(e) => return Err(e),
        };

        let (out_tx, link) = spawn_link(socket, generation, events.clone());
        sync_sessions(mux, names, sessions);
        mux.replace_transport(out_tx);
        mux.fit_active();
        return Ok(link);
    }
    Err(DaemonError::Unavailable)
}

fn sync_sessions(mux: &mut Mux, names: &mut HashMap<SessionId, String>, sessions: Vec<SessionSummary>) {
    let ids: Vec<SessionId> = sessions.iter().map(|s| s.session_id.clone()).collect();
    mux.resync(&ids);
    names.clear();
    names.extend(
        sessions
            .into_iter()
            .map(|s| (s.session_id, s.display_name)),
    );
}

fn handle_keys(mux: &mut Mux, names: &HashMap<SessionId, String>, data: &[u8]) -> Option<AttachOutcome> {
    for action in scan_keys(data) {
        match action {
            KeyAction::Input(bytes) => {
                if let Err(e) = mux.input(&bytes) {
                    debug!("input dropped: {}", e);
                }
            }
            KeyAction::Cycle => show_next(mux, names),
            KeyAction::Detach => return Some(AttachOutcome::Detached),
        }
    }
    None
}

fn handle_mux_event(
    mux: &mut Mux,
    names: &HashMap<SessionId, String>,
    event: MuxEvent,
) -> Option<AttachOutcome> {
    match event {
        MuxEvent::Linked {
            session_id,
            truncated: true,
        } if mux.active_session_id() == Some(session_id.as_str()) => {
            status(mux, "earlier output was discarded by the server");
        }
        MuxEvent::Linked { .. } => {}
        MuxEvent::Closed { session_id } => {
            let was_active = mux.active_session_id() == Some(session_id.as_str());
            mux.destroy_virtual_terminal(&session_id);
            if mux.session_count() == 0 {
                return Some(AttachOutcome::Exited);
            }
            if was_active {
                show_next(mux, names);
            }
        }
        MuxEvent::Error {
            session_id,
            message,
        } => {
            if session_id.is_none() || session_id.as_deref() == mux.active_session_id() {
                status(mux, &message);
            }
        }
    }
    None
}

fn show_next(mux: &mut Mux, names: &HashMap<SessionId, String>) {
    if let Some(next) = mux.next_session_id() {
        if mux.switch_to(&next).is_ok() {
            set_title(mux, names);
        }
    }
}

fn set_title(mux: &Mux, names: &HashMap<SessionId, String>) {
    if let Some(id) = mux.active_session_id() {
        let name = names.get(id).map(String::as_str).unwrap_or(id);
        mux.surface().set_title(&format!("termdeck: {}", name));
    }
}

fn status(mux: &Mux, message: &str) {
    write_locked(
        &mux.surface().out,
        format!("\r\n[termdeck: {}]\r\n", message).as_bytes(),
    );
}

/// Blocking stdin reader. Polls with a timeout so it notices the shutdown
/// flag once the attach ends.
fn spawn_stdin_reader() -> (mpsc::Receiver<Vec<u8>>, Arc<AtomicBool>) {
    let (stdin_tx, stdin_rx) = mpsc::channel::<Vec<u8>>(64);
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_thread = shutdown.clone();
    std::thread::spawn(move || {
        use std::io::Read;
        use std::os::fd::AsRawFd;
        let stdin = std::io::stdin();
        let stdin_fd = stdin.as_raw_fd();
        let mut buf = [0u8; 4096];
        loop {
            if shutdown_thread.load(Ordering::Relaxed) {
                break;
            }
            let mut pfd = nix::libc::pollfd {
                fd: stdin_fd,
                events: nix::libc::POLLIN,
                revents: 0,
            };
            let ret = unsafe { nix::libc::poll(&mut pfd, 1, 100) };
            if ret <= 0 {
                continue;
            }
            let mut handle = stdin.lock();
            match handle.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    drop(handle);
                    if stdin_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    (stdin_rx, shutdown)
}
