use async_trait::async_trait;
use pty_manager::{PtyError, PtyEvent, resolve_working_dir};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use termdeck_protocol::ServerMessage;
use tokio::sync::mpsc;

use crate::AppState;
use crate::config::AuthConfig;
use crate::metrics::ServerMetrics;
use crate::process::{SessionProcess, SpawnedProcess, Spawner};
use crate::session_registry::{ConnectionReceiver, RegistrySettings, SessionRegistry};

/// In-memory stand-in for a shell. Tests drive its output and exit and
/// inspect what the registry wrote to it.
pub struct FakeProcess {
    events: mpsc::UnboundedSender<PtyEvent>,
    input: Mutex<Vec<u8>>,
    sizes: Mutex<Vec<(u16, u16)>>,
    terminated: AtomicBool,
    broken: AtomicBool,
}

impl FakeProcess {
    pub fn emit(&self, data: &[u8]) {
        let _ = self.events.send(PtyEvent::Output(data.to_vec()));
    }

    pub fn exit(&self, exit_code: Option<u32>) {
        let _ = self.events.send(PtyEvent::Exited { exit_code });
    }

    pub fn input(&self) -> Vec<u8> {
        self.input.lock().unwrap().clone()
    }

    pub fn sizes(&self) -> Vec<(u16, u16)> {
        self.sizes.lock().unwrap().clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Make writes and resizes fail as if the process had died.
    pub fn break_writes(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    fn check_alive(&self) -> Result<(), PtyError> {
        if self.broken.load(Ordering::SeqCst) || self.is_terminated() {
            Err(PtyError::ProcessExited)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SessionProcess for FakeProcess {
    async fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        self.check_alive()?;
        self.input.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.check_alive()?;
        self.sizes.lock().unwrap().push((cols, rows));
        Ok(())
    }

    async fn terminate(&self) -> Result<(), PtyError> {
        if !self.terminated.swap(true, Ordering::SeqCst) {
            self.exit(Some(129));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeSpawner {
    spawned: Mutex<Vec<Arc<FakeProcess>>>,
    fail_next: AtomicBool,
}

impl FakeSpawner {
    /// The `index`-th process spawned.
    pub fn process(&self, index: usize) -> Arc<FakeProcess> {
        self.spawned.lock().unwrap()[index].clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Spawner for FakeSpawner {
    async fn spawn(
        &self,
        working_dir: &Path,
        _cols: u16,
        _rows: u16,
    ) -> Result<SpawnedProcess, PtyError> {
        let working_dir = resolve_working_dir(working_dir).await?;
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(PtyError::SpawnFailed("no such shell".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let process = Arc::new(FakeProcess {
            events: tx,
            input: Mutex::new(Vec::new()),
            sizes: Mutex::new(Vec::new()),
            terminated: AtomicBool::new(false),
            broken: AtomicBool::new(false),
        });
        self.spawned.lock().unwrap().push(process.clone());
        Ok(SpawnedProcess {
            process,
            events: rx,
            working_dir,
        })
    }
}

/// Registry over a `FakeSpawner`, plus a directory sessions can start in.
/// Hold the `TempDir` for the lifetime of the test.
pub fn test_registry() -> (SessionRegistry, Arc<FakeSpawner>, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let spawner = Arc::new(FakeSpawner::default());
    let registry = SessionRegistry::new(
        spawner.clone(),
        RegistrySettings::default(),
        Arc::new(ServerMetrics::new()),
    );
    (registry, spawner, tmp)
}

/// A fully-wired `AppState` with auth enabled and two tokens:
/// `alice-token` for `alice` and `bob-token` for `bob`.
pub fn test_app_state() -> (AppState, Arc<FakeSpawner>, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let metrics = Arc::new(ServerMetrics::new());
    let spawner = Arc::new(FakeSpawner::default());
    let registry = SessionRegistry::new(spawner.clone(), RegistrySettings::default(), metrics.clone());

    let mut tokens = HashMap::new();
    tokens.insert("alice-token".to_string(), "alice".to_string());
    tokens.insert("bob-token".to_string(), "bob".to_string());

    let state = AppState {
        registry,
        auth_config: Arc::new(AuthConfig {
            enabled: true,
            tokens,
        }),
        metrics,
    };
    (state, spawner, tmp)
}

/// Next queued message, failing the test after a second.
pub async fn recv_message(rx: &mut ConnectionReceiver) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("connection queue closed")
}
