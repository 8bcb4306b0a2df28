//! Session Registry
//!
//! The single owner of live sessions, their output logs and the set of
//! connections attached to each. All membership and attachment changes happen
//! under one lock, and each session's output is fanned out by one pump task
//! while that lock is held, so a connection sees a session's output in
//! production order and never after `closed`.

use chrono::{DateTime, Utc};
use pty_manager::{PtyEvent, PtyEvents};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use termdeck_protocol::api::SessionSummary;
use termdeck_protocol::{ServerMessage, SessionId};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::SessionError;
use crate::metrics::ServerMetrics;
use crate::output_log::OutputLog;
use crate::process::{SessionProcess, Spawner};

pub type ConnectionId = String;
pub type ConnectionReceiver = mpsc::Receiver<ServerMessage>;

/// Messages a connection may have queued before it counts as lagging and is
/// dropped. Its client re-attaches from the offsets it holds.
pub const CONNECTION_QUEUE_CAPACITY: usize = 1024;

/// Replays are merged into about this many frames so a whole retained log
/// fits in a fresh queue.
const REPLAY_FRAME_BUDGET: usize = CONNECTION_QUEUE_CAPACITY / 4;
const REPLAY_MIN_FRAME_BYTES: usize = 64 * 1024;

/// Size and retention applied to new sessions.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub default_cols: u16,
    pub default_rows: u16,
    pub max_log_bytes: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            default_cols: 80,
            default_rows: 24,
            max_log_bytes: crate::output_log::DEFAULT_MAX_BYTES,
        }
    }
}

struct Session {
    owner_id: String,
    display_name: String,
    working_dir: PathBuf,
    created_at: DateTime<Utc>,
    process: Arc<dyn SessionProcess>,
    attached: HashSet<ConnectionId>,
    log: OutputLog,
}

impl Session {
    fn summary(&self, session_id: &str) -> SessionSummary {
        SessionSummary {
            session_id: session_id.to_string(),
            display_name: self.display_name.clone(),
            working_dir: self.working_dir.display().to_string(),
            created_at: self.created_at,
        }
    }

    fn check_owner(&self, session_id: &str, owner_id: &str) -> Result<(), SessionError> {
        if self.owner_id == owner_id {
            Ok(())
        } else {
            Err(SessionError::Forbidden {
                session_id: session_id.to_string(),
                owner_id: owner_id.to_string(),
            })
        }
    }
}

struct Connection {
    owner_id: String,
    tx: mpsc::Sender<ServerMessage>,
}

impl Connection {
    /// Queue without waiting. False only when the queue is full; a closed
    /// queue is cleaned up by `disconnect`.
    fn offer(&self, msg: ServerMessage) -> bool {
        !matches!(self.tx.try_send(msg), Err(mpsc::error::TrySendError::Full(_)))
    }
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, Session>,
    /// Insertion order of live sessions
    order: Vec<SessionId>,
    connections: HashMap<ConnectionId, Connection>,
    /// Sessions ever created per owner, for default labels
    created_per_owner: HashMap<String, u64>,
}

impl RegistryState {
    fn session(&self, session_id: &str) -> Result<&Session, SessionError> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    fn connection_owner(&self, conn_id: &str) -> Result<String, SessionError> {
        self.connections
            .get(conn_id)
            .map(|c| c.owner_id.clone())
            .ok_or_else(|| SessionError::Transport {
                session_id: String::new(),
                reason: format!("connection {} is not registered", conn_id),
            })
    }

    /// Forget a connection everywhere. Dropping its sender ends the socket.
    fn remove_connection(&mut self, conn_id: &str) -> bool {
        if self.connections.remove(conn_id).is_none() {
            return false;
        }
        for session in self.sessions.values_mut() {
            session.attached.remove(conn_id);
        }
        true
    }

    /// Session the connection owns and is attached to.
    fn attached_session(&self, session_id: &str, conn_id: &str) -> Result<&Session, SessionError> {
        let owner_id = self.connection_owner(conn_id)?;
        let session = self.session(session_id)?;
        session.check_owner(session_id, &owner_id)?;
        if !session.attached.contains(conn_id) {
            return Err(SessionError::Forbidden {
                session_id: session_id.to_string(),
                owner_id,
            });
        }
        Ok(session)
    }
}

struct Inner {
    state: Mutex<RegistryState>,
    spawner: Arc<dyn Spawner>,
    settings: RegistrySettings,
    metrics: Arc<ServerMetrics>,
}

/// Cheap to clone; all clones share one store.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    pub fn new(
        spawner: Arc<dyn Spawner>,
        settings: RegistrySettings,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(RegistryState::default()),
                spawner,
                settings,
                metrics,
            }),
        }
    }

    /// Spawn a shell in `working_dir` and register it for `owner_id`.
    /// Nothing is registered when the spawn fails.
    pub async fn create(
        &self,
        owner_id: &str,
        working_dir: &Path,
        display_name: Option<&str>,
    ) -> Result<SessionSummary, SessionError> {
        let settings = &self.inner.settings;
        let spawned = self
            .inner
            .spawner
            .spawn(working_dir, settings.default_cols, settings.default_rows)
            .await
            .map_err(|e| {
                let err = SessionError::from_spawn(e);
                if matches!(err, SessionError::SpawnFailure(_)) {
                    error!(owner = %owner_id, "spawn failed: {}", err);
                    self.inner.metrics.pty_error();
                } else {
                    warn!(owner = %owner_id, "rejected working dir: {}", err);
                }
                err
            })?;

        let session_id = Uuid::new_v4().to_string();
        let summary = {
            let mut state = self.inner.state.lock().await;
            let count = state
                .created_per_owner
                .entry(owner_id.to_string())
                .or_insert(0);
            *count += 1;
            let display_name = display_name
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("Terminal {}", count));

            let session = Session {
                owner_id: owner_id.to_string(),
                display_name,
                working_dir: spawned.working_dir,
                created_at: Utc::now(),
                process: spawned.process,
                attached: HashSet::new(),
                log: OutputLog::new(settings.max_log_bytes),
            };
            let summary = session.summary(&session_id);
            state.sessions.insert(session_id.clone(), session);
            state.order.push(session_id.clone());
            summary
        };

        self.inner.metrics.session_created();
        info!(session = %session_id, owner = %owner_id, dir = %summary.working_dir, "session created");

        tokio::spawn(self.clone().pump(session_id, spawned.events));
        Ok(summary)
    }

    /// Drain one session's events: fan output out, destroy on exit.
    async fn pump(self, session_id: SessionId, mut events: PtyEvents) {
        while let Some(event) = events.recv().await {
            match event {
                PtyEvent::Output(data) => {
                    if !self.fan_out(&session_id, &data).await {
                        debug!(session = %session_id, "session gone, pump stopping");
                        return;
                    }
                }
                PtyEvent::Exited { exit_code } => {
                    info!(session = %session_id, ?exit_code, "process exited");
                    break;
                }
            }
        }
        // Exited, or the adapter went away without saying so
        if let Err(e) = self.destroy(&session_id, None).await {
            debug!(session = %session_id, "already destroyed: {}", e);
        }
    }

    /// Append to the log and forward to attached connections. False when the
    /// session no longer exists.
    async fn fan_out(&self, session_id: &str, data: &[u8]) -> bool {
        let mut state = self.inner.state.lock().await;
        let RegistryState {
            sessions,
            connections,
            ..
        } = &mut *state;
        let Some(session) = sessions.get_mut(session_id) else {
            return false;
        };
        let offset = session.log.append(data);
        let mut lagging = Vec::new();
        for conn_id in &session.attached {
            if let Some(conn) = connections.get(conn_id) {
                let msg = ServerMessage::Output {
                    session_id: session_id.to_string(),
                    offset,
                    data: data.to_vec(),
                };
                if !conn.offer(msg) {
                    lagging.push(conn_id.clone());
                }
            }
        }
        self.drop_lagging(&mut state, lagging);
        true
    }

    /// Disconnect connections whose queue overflowed.
    fn drop_lagging(&self, state: &mut RegistryState, lagging: Vec<ConnectionId>) {
        for conn_id in lagging {
            if state.remove_connection(&conn_id) {
                self.inner.metrics.connection_lagged();
                warn!(conn_id = %conn_id, "connection queue full, disconnecting");
            }
        }
    }

    /// Owner-only; the name is trimmed and an empty result changes nothing.
    pub async fn rename(
        &self,
        session_id: &str,
        owner_id: &str,
        new_name: &str,
    ) -> Result<(), SessionError> {
        let mut state = self.inner.state.lock().await;
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        session.check_owner(session_id, owner_id)?;
        let name = new_name.trim();
        if name.is_empty() {
            return Ok(());
        }
        info!(session = %session_id, name = %name, "session renamed");
        session.display_name = name.to_string();
        Ok(())
    }

    /// Remove a session, notify every attached connection with `closed` and
    /// terminate its process. `owner_id = None` skips the ownership check
    /// (process exit, shutdown).
    pub async fn destroy(&self, session_id: &str, owner_id: Option<&str>) -> Result<(), SessionError> {
        let session = {
            let mut state = self.inner.state.lock().await;
            if let Some(owner_id) = owner_id {
                state.session(session_id)?.check_owner(session_id, owner_id)?;
            }
            let session = state
                .sessions
                .remove(session_id)
                .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
            state.order.retain(|id| id != session_id);

            let lagging: Vec<ConnectionId> = session
                .attached
                .iter()
                .filter(|conn_id| {
                    state.connections.get(*conn_id).is_some_and(|conn| {
                        !conn.offer(ServerMessage::Closed {
                            session_id: session_id.to_string(),
                        })
                    })
                })
                .cloned()
                .collect();
            self.drop_lagging(&mut state, lagging);
            session
        };

        self.inner.metrics.session_destroyed();
        info!(
            session = %session_id,
            viewers = session.attached.len(),
            "session destroyed"
        );

        if let Err(e) = session.process.terminate().await {
            if !e.is_dead_process() {
                warn!(session = %session_id, "failed to terminate process: {}", e);
            }
        }
        Ok(())
    }

    /// Destroy every session through the internal path.
    pub async fn shutdown(&self) {
        let ids: Vec<SessionId> = self.inner.state.lock().await.order.clone();
        info!("Destroying {} sessions", ids.len());
        for id in ids {
            if let Err(e) = self.destroy(&id, None).await {
                debug!(session = %id, "skipped during shutdown: {}", e);
            }
        }
    }

    /// Live sessions of `owner_id` in creation order.
    pub async fn list_for_user(&self, owner_id: &str) -> Vec<SessionSummary> {
        let state = self.inner.state.lock().await;
        state
            .order
            .iter()
            .filter_map(|id| state.sessions.get(id).map(|s| (id, s)))
            .filter(|(_, s)| s.owner_id == owner_id)
            .map(|(id, s)| s.summary(id))
            .collect()
    }

    pub async fn get(&self, session_id: &str, owner_id: &str) -> Result<SessionSummary, SessionError> {
        let state = self.inner.state.lock().await;
        let session = state.session(session_id)?;
        session.check_owner(session_id, owner_id)?;
        Ok(session.summary(session_id))
    }

    pub async fn session_count(&self) -> usize {
        self.inner.state.lock().await.sessions.len()
    }

    /// Register a transport connection for `owner_id`. Messages for it arrive
    /// on the returned queue until `disconnect`.
    pub async fn register_connection(
        &self,
        owner_id: &str,
    ) -> (ConnectionId, ConnectionReceiver) {
        let conn_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(CONNECTION_QUEUE_CAPACITY);
        self.inner.state.lock().await.connections.insert(
            conn_id.clone(),
            Connection {
                owner_id: owner_id.to_string(),
                tx,
            },
        );
        debug!(conn_id = %conn_id, owner = %owner_id, "connection registered");
        (conn_id, rx)
    }

    /// Queue a message for one connection.
    pub async fn notify(&self, conn_id: &str, msg: ServerMessage) {
        let mut state = self.inner.state.lock().await;
        let full = state
            .connections
            .get(conn_id)
            .is_some_and(|conn| !conn.offer(msg));
        if full {
            self.drop_lagging(&mut state, vec![conn_id.to_string()]);
        }
    }

    /// Detach the connection everywhere and drop its queue. Idempotent.
    pub async fn disconnect(&self, conn_id: &str) {
        let mut state = self.inner.state.lock().await;
        if state.remove_connection(conn_id) {
            debug!(conn_id = %conn_id, "connection removed");
        }
    }

    /// Drop every connection queue so their writers drain and finish.
    pub async fn close_connections(&self) {
        let mut state = self.inner.state.lock().await;
        state.connections.clear();
        for session in state.sessions.values_mut() {
            session.attached.clear();
        }
    }

    /// Attach `conn_id` to a session it owns. Sends `attached{offset}` and
    /// replays retained output after `since`, all before any live output can
    /// reach the connection. A connection that is already attached gets the
    /// acknowledgement only; live output is already flowing to it.
    pub async fn attach(
        &self,
        session_id: &str,
        conn_id: &str,
        since: Option<u64>,
    ) -> Result<(), SessionError> {
        let mut state = self.inner.state.lock().await;
        let owner_id = state.connection_owner(conn_id)?;
        let RegistryState {
            sessions,
            connections,
            ..
        } = &mut *state;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        session.check_owner(session_id, &owner_id)?;
        let Some(conn) = connections.get(conn_id) else {
            return Err(SessionError::NotFound(session_id.to_string()));
        };

        let replay = session.log.replay_from(since.unwrap_or(0));
        let attached = ServerMessage::Attached {
            session_id: session_id.to_string(),
            offset: replay.offset,
        };

        let delivered = if session.attached.contains(conn_id) {
            debug!(session = %session_id, conn_id = %conn_id, "already attached");
            conn.offer(attached)
        } else {
            let replay_bytes = replay.byte_len();
            let frames = replay.into_frames(REPLAY_FRAME_BUDGET, REPLAY_MIN_FRAME_BYTES);
            let delivered = conn.offer(attached)
                && frames.into_iter().all(|(offset, data)| {
                    conn.offer(ServerMessage::Output {
                        session_id: session_id.to_string(),
                        offset,
                        data,
                    })
                });
            if delivered {
                if replay_bytes > 0 {
                    self.inner.metrics.replayed(replay_bytes);
                }
                session.attached.insert(conn_id.to_string());
                debug!(session = %session_id, conn_id = %conn_id, since = ?since, "attached");
            }
            delivered
        };

        if !delivered {
            self.drop_lagging(&mut state, vec![conn_id.to_string()]);
            return Err(SessionError::Transport {
                session_id: session_id.to_string(),
                reason: "connection queue full".to_string(),
            });
        }
        Ok(())
    }

    /// Idempotent; detaching from a missing session is not an error.
    pub async fn detach(&self, session_id: &str, conn_id: &str) {
        let mut state = self.inner.state.lock().await;
        if let Some(session) = state.sessions.get_mut(session_id) {
            if session.attached.remove(conn_id) {
                debug!(session = %session_id, conn_id = %conn_id, "detached");
            }
        }
    }

    /// Write input bytes. The connection must own and be attached to the session.
    pub async fn input(&self, session_id: &str, conn_id: &str, data: &[u8]) -> Result<(), SessionError> {
        let process = {
            let state = self.inner.state.lock().await;
            state.attached_session(session_id, conn_id)?.process.clone()
        };
        process.write(data).await.map_err(|e| {
            self.inner.metrics.pty_error();
            SessionError::transport(session_id, e)
        })
    }

    /// Resize the session's terminal. Last writer wins.
    pub async fn resize(
        &self,
        session_id: &str,
        conn_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), SessionError> {
        let process = {
            let state = self.inner.state.lock().await;
            state.attached_session(session_id, conn_id)?.process.clone()
        };
        debug!(session = %session_id, cols, rows, "resize");
        process.resize(cols, rows).await.map_err(|e| {
            self.inner.metrics.pty_error();
            SessionError::transport(session_id, e)
        })
    }
}
