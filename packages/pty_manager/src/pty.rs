use anyhow::Context;
use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::PtyError;

/// Configuration for spawning a PTY
#[derive(Clone, Debug)]
pub struct PtyConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    pub rows: u16,
    pub cols: u16,
}

impl PtyConfig {
    /// A config that runs the user's default shell in `working_dir`.
    pub fn shell(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            ..Default::default()
        }
    }
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            command: default_shell(),
            args: Vec::new(),
            working_dir: PathBuf::from("."),
            env: Vec::new(),
            rows: 24,
            cols: 80,
        }
    }
}

/// The user's login shell from `$SHELL`, falling back to `/bin/bash`.
pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "/bin/bash".to_string())
}

/// Resolve and validate a working directory before anything is spawned.
pub async fn resolve_working_dir(path: &Path) -> Result<PathBuf, PtyError> {
    let invalid = |reason: String| PtyError::InvalidPath {
        path: path.to_path_buf(),
        reason,
    };

    let resolved = tokio::fs::canonicalize(path)
        .await
        .map_err(|e| invalid(e.to_string()))?;
    let meta = tokio::fs::metadata(&resolved)
        .await
        .map_err(|e| invalid(e.to_string()))?;
    if !meta.is_dir() {
        return Err(invalid("not a directory".into()));
    }
    Ok(resolved)
}

/// State of a PTY session
#[derive(Clone, Debug)]
pub struct PtyState {
    pub running: bool,
    pub pid: Option<u32>,
    pub command: String,
    pub working_dir: PathBuf,
    pub rows: u16,
    pub cols: u16,
}

/// Events emitted by a PTY, in order. `Exited` is always the last event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PtyEvent {
    Output(Vec<u8>),
    Exited { exit_code: Option<u32> },
}

/// Receiving side of a PTY's event stream. There is exactly one consumer.
pub type PtyEvents = mpsc::UnboundedReceiver<PtyEvent>;

/// Signals that can be delivered to the PTY process
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PtySignal {
    /// Terminal hangup, the normal way to end an interactive shell
    Hangup,
    Terminate,
    Kill,
    /// Written as Ctrl+C to the terminal rather than sent as a signal
    Interrupt,
}

/// Messages that can be sent to the PTY actor
pub(crate) enum PtyMessage {
    WriteInput {
        data: Vec<u8>,
        respond_to: oneshot::Sender<Result<usize, PtyError>>,
    },
    Resize {
        rows: u16,
        cols: u16,
        respond_to: oneshot::Sender<Result<(), PtyError>>,
    },
    GetState {
        respond_to: oneshot::Sender<PtyState>,
    },
    Kill {
        signal: PtySignal,
        respond_to: oneshot::Sender<Result<(), PtyError>>,
    },
}

/// Handle to communicate with a PTY actor
#[derive(Clone)]
pub struct PtyHandle {
    sender: mpsc::Sender<PtyMessage>,
    pid: Option<u32>,
}

impl PtyHandle {
    /// Write data to the PTY
    pub async fn write(&self, data: &[u8]) -> Result<usize, PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::WriteInput {
                data: data.to_vec(),
                respond_to: tx,
            })
            .await
            .map_err(|_| PtyError::ChannelError("Failed to send write message".into()))?;
        rx.await
            .map_err(|_| PtyError::ChannelError("Failed to receive write response".into()))?
    }

    /// Write a string to the PTY
    pub async fn write_str(&self, text: &str) -> Result<usize, PtyError> {
        self.write(text.as_bytes()).await
    }

    /// Resize the PTY
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::Resize {
                rows,
                cols,
                respond_to: tx,
            })
            .await
            .map_err(|_| PtyError::ChannelError("Failed to send resize message".into()))?;
        rx.await
            .map_err(|_| PtyError::ChannelError("Failed to receive resize response".into()))?
    }

    /// Get the current state of the PTY
    pub async fn state(&self) -> Result<PtyState, PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::GetState { respond_to: tx })
            .await
            .map_err(|_| PtyError::ChannelError("Failed to send state message".into()))?;
        rx.await
            .map_err(|_| PtyError::ChannelError("Failed to receive state response".into()))
    }

    /// Signal the PTY process
    pub async fn kill(&self, signal: PtySignal) -> Result<(), PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::Kill {
                signal,
                respond_to: tx,
            })
            .await
            .map_err(|_| PtyError::ChannelError("Failed to send kill message".into()))?;
        rx.await
            .map_err(|_| PtyError::ChannelError("Failed to receive kill response".into()))?
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Everything produced by opening the PTY, before the actor takes ownership.
struct Spawned {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    reader: Box<dyn Read + Send>,
    child: Box<dyn Child + Send + Sync>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    pid: Option<u32>,
}

/// The PTY actor that manages a single PTY session
pub struct PtyActor {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    exited: Arc<AtomicBool>,
    state: PtyState,
    receiver: mpsc::Receiver<PtyMessage>,
}

impl PtyActor {
    /// Spawn a new PTY and return a handle to it plus its event stream.
    ///
    /// The working directory is validated first; an invalid one fails with
    /// [`PtyError::InvalidPath`] and nothing is started.
    pub async fn spawn(config: PtyConfig) -> Result<(PtyHandle, PtyEvents), PtyError> {
        let working_dir = resolve_working_dir(&config.working_dir).await?;

        let open_config = config.clone();
        let open_dir = working_dir.clone();
        let spawned = tokio::task::spawn_blocking(move || open_pty(&open_config, &open_dir))
            .await
            .map_err(|e| PtyError::SpawnFailed(format!("spawn task failed: {}", e)))??;

        let Spawned {
            master,
            writer,
            reader,
            child,
            killer,
            pid,
        } = spawned;
        info!("PTY process started with PID: {:?}", pid);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (msg_tx, msg_rx) = mpsc::channel(32);
        let exited = Arc::new(AtomicBool::new(false));

        spawn_reader(reader, child, event_tx, exited.clone());

        let actor = Self {
            master,
            writer,
            killer,
            exited,
            state: PtyState {
                running: true,
                pid,
                command: config.command,
                working_dir,
                rows: config.rows,
                cols: config.cols,
            },
            receiver: msg_rx,
        };

        tokio::spawn(actor.run());

        Ok((
            PtyHandle {
                sender: msg_tx,
                pid,
            },
            event_rx,
        ))
    }

    async fn run(mut self) {
        debug!(
            "PTY actor started for command: {} with PID: {:?}",
            self.state.command, self.state.pid
        );

        while let Some(msg) = self.receiver.recv().await {
            match msg {
                PtyMessage::WriteInput { data, respond_to } => {
                    let result = self.handle_write_input(&data);
                    let _ = respond_to.send(result);
                }
                PtyMessage::Resize {
                    rows,
                    cols,
                    respond_to,
                } => {
                    let result = self.handle_resize(rows, cols);
                    let _ = respond_to.send(result);
                }
                PtyMessage::GetState { respond_to } => {
                    self.state.running = !self.exited.load(Ordering::SeqCst);
                    let _ = respond_to.send(self.state.clone());
                }
                PtyMessage::Kill { signal, respond_to } => {
                    let result = self.handle_kill(signal);
                    let stop = result.is_ok() && signal != PtySignal::Interrupt;
                    let _ = respond_to.send(result);
                    if stop {
                        break;
                    }
                }
            }
        }

        debug!("PTY actor shutting down (pid {:?})", self.state.pid);
    }

    fn handle_write_input(&mut self, data: &[u8]) -> Result<usize, PtyError> {
        if self.exited.load(Ordering::SeqCst) {
            return Err(PtyError::ProcessExited);
        }

        self.writer
            .write_all(data)
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;
        self.writer
            .flush()
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;

        Ok(data.len())
    }

    fn handle_resize(&mut self, rows: u16, cols: u16) -> Result<(), PtyError> {
        if self.exited.load(Ordering::SeqCst) {
            return Err(PtyError::ProcessExited);
        }

        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::ResizeFailed(e.to_string()))?;

        self.state.rows = rows;
        self.state.cols = cols;
        Ok(())
    }

    fn handle_kill(&mut self, signal: PtySignal) -> Result<(), PtyError> {
        if signal == PtySignal::Interrupt {
            self.handle_write_input(b"\x03")?;
            return Ok(());
        }

        if self.exited.load(Ordering::SeqCst) {
            return Ok(());
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Some(pid) = self.state.pid {
                let sig = match signal {
                    PtySignal::Hangup => Signal::SIGHUP,
                    PtySignal::Terminate => Signal::SIGTERM,
                    PtySignal::Kill => Signal::SIGKILL,
                    PtySignal::Interrupt => Signal::SIGINT,
                };
                match kill(Pid::from_raw(pid as i32), sig) {
                    Ok(()) => {}
                    // Already reaped
                    Err(nix::errno::Errno::ESRCH) => {}
                    Err(e) => return Err(PtyError::KillFailed(e.to_string())),
                }
                self.state.running = false;
                return Ok(());
            }
        }

        self.killer
            .kill()
            .map_err(|e| PtyError::KillFailed(e.to_string()))?;
        self.state.running = false;
        Ok(())
    }
}

fn open_pty(config: &PtyConfig, working_dir: &Path) -> Result<Spawned, PtyError> {
    let pty_system = native_pty_system();

    let pair = pty_system
        .openpty(PtySize {
            rows: config.rows,
            cols: config.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .context("Failed to open PTY")?;

    let mut cmd = CommandBuilder::new(&config.command);
    for arg in &config.args {
        cmd.arg(arg);
    }
    cmd.cwd(working_dir);

    // Environment for proper terminal behavior
    cmd.env("TERM", "xterm-256color");
    cmd.env("COLORTERM", "truecolor");
    for key in ["PATH", "HOME", "USER", "LANG"] {
        if let Ok(value) = std::env::var(key) {
            cmd.env(key, value);
        }
    }
    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    info!(
        "Spawning PTY command: {} in {}",
        config.command,
        working_dir.display()
    );

    let child = pair.slave.spawn_command(cmd).map_err(|e| {
        error!("Failed to spawn command '{}': {}", config.command, e);
        PtyError::SpawnFailed(e.to_string())
    })?;
    // The reader only sees EOF once every slave handle is closed.
    drop(pair.slave);

    let reader = pair
        .master
        .try_clone_reader()
        .context("Failed to clone PTY reader")?;
    let writer = pair
        .master
        .take_writer()
        .context("Failed to take PTY writer")?;
    let killer = child.clone_killer();
    let pid = child.process_id();

    Ok(Spawned {
        master: pair.master,
        writer,
        reader,
        child,
        killer,
        pid,
    })
}

/// Blocking reader thread. Forwards output until EOF, then reaps the child
/// and emits `Exited` as the final event.
fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    mut child: Box<dyn Child + Send + Sync>,
    events: mpsc::UnboundedSender<PtyEvent>,
    exited: Arc<AtomicBool>,
) {
    std::thread::spawn(move || {
        let mut buffer = vec![0u8; 4096];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => {
                    debug!("PTY EOF detected");
                    break;
                }
                Ok(n) => {
                    // Consumer gone means nobody cares about the rest.
                    let _ = events.send(PtyEvent::Output(buffer[..n].to_vec()));
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Linux reports EIO once the slave side is closed
                    debug!("PTY read ended: {}", e);
                    break;
                }
            }
        }

        let exit_code = match child.wait() {
            Ok(status) => Some(status.exit_code()),
            Err(e) => {
                warn!("Failed to reap PTY child: {}", e);
                None
            }
        };
        exited.store(true, Ordering::SeqCst);
        info!("PTY process exited with code {:?}", exit_code);
        let _ = events.send(PtyEvent::Exited { exit_code });
    });
}
