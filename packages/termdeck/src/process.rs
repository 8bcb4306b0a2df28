//! Seam between the session registry and the processes it runs.
//!
//! The registry only needs to write, resize and terminate a process and to
//! drain its event queue; `PtySpawner` provides that over `pty_manager`.

use async_trait::async_trait;
use pty_manager::{
    PtyActor, PtyConfig, PtyError, PtyEvents, PtyHandle, PtySignal, resolve_working_dir,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// A running session process.
#[async_trait]
pub trait SessionProcess: Send + Sync {
    async fn write(&self, data: &[u8]) -> Result<(), PtyError>;
    async fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError>;
    /// Ask the process to end. Its exit still arrives on the event queue.
    async fn terminate(&self) -> Result<(), PtyError>;
}

pub struct SpawnedProcess {
    pub process: Arc<dyn SessionProcess>,
    pub events: PtyEvents,
    /// Canonical working directory the process started in
    pub working_dir: PathBuf,
}

#[async_trait]
pub trait Spawner: Send + Sync {
    async fn spawn(
        &self,
        working_dir: &Path,
        cols: u16,
        rows: u16,
    ) -> Result<SpawnedProcess, PtyError>;
}

#[async_trait]
impl SessionProcess for PtyHandle {
    async fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        PtyHandle::write(self, data).await.map(|_| ())
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        PtyHandle::resize(self, cols, rows).await
    }

    async fn terminate(&self) -> Result<(), PtyError> {
        self.kill(PtySignal::Hangup).await
    }
}

/// Spawns the configured shell on a PTY.
#[derive(Debug, Clone, Default)]
pub struct PtySpawner {
    shell: Option<String>,
}

impl PtySpawner {
    pub fn new(shell: Option<String>) -> Self {
        Self { shell }
    }
}

#[async_trait]
impl Spawner for PtySpawner {
    async fn spawn(
        &self,
        working_dir: &Path,
        cols: u16,
        rows: u16,
    ) -> Result<SpawnedProcess, PtyError> {
        let working_dir = resolve_working_dir(working_dir).await?;
        let mut config = PtyConfig::shell(working_dir.clone());
        if let Some(shell) = &self.shell {
            config.command = shell.clone();
        }
        config.cols = cols;
        config.rows = rows;

        let (handle, events) = PtyActor::spawn(config).await?;
        info!(pid = ?handle.pid(), dir = %working_dir.display(), "shell started");
        Ok(SpawnedProcess {
            process: Arc::new(handle),
            events,
            working_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pty_manager::PtyEvent;

    #[tokio::test]
    async fn test_pty_spawner_runs_shell() {
        let tmp = tempfile::tempdir().unwrap();
        let spawner = PtySpawner::new(Some("/bin/sh".into()));
        let mut spawned = spawner.spawn(tmp.path(), 80, 24).await.unwrap();
        assert_eq!(spawned.working_dir, tmp.path().canonicalize().unwrap());

        spawned.process.write(b"echo spawned-ok; exit\n").await.unwrap();
        let mut output = Vec::new();
        let exited = tokio::time::timeout(std::time::Duration::from_secs(10), async {
            while let Some(event) = spawned.events.recv().await {
                match event {
                    PtyEvent::Output(data) => output.extend_from_slice(&data),
                    PtyEvent::Exited { .. } => return true,
                }
            }
            false
        })
        .await
        .unwrap();
        assert!(exited);
        assert!(String::from_utf8_lossy(&output).contains("spawned-ok"));
    }

    #[tokio::test]
    async fn test_pty_spawner_rejects_missing_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let spawner = PtySpawner::default();
        let err = match spawner.spawn(&tmp.path().join("missing"), 80, 24).await {
            Ok(_) => panic!("spawn should fail"),
            Err(e) => e,
        };
        assert!(matches!(err, PtyError::InvalidPath { .. }));
    }
}
