//! Server discovery through the PID and port files a running server writes
//! into the data directory.

use anyhow::{Context, Result};
use tokio_tungstenite::tungstenite;

use crate::config::TermdeckConfig;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("server is unavailable")]
    Unavailable,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DaemonError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::Unavailable
        } else {
            Self::Other(err.into())
        }
    }

    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        let is_connect = match &err {
            tungstenite::Error::Io(io_err) => matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        };
        if is_connect {
            Self::Unavailable
        } else {
            Self::Other(err.into())
        }
    }
}

/// Port of a live server started with this data directory, if any.
pub fn running_port(config: &TermdeckConfig) -> Option<u16> {
    let pid_path = config.daemon_pid_path();
    let port_path = config.daemon_port_path();

    let pid: i32 = std::fs::read_to_string(&pid_path).ok()?.trim().parse().ok()?;

    // Signal 0 only checks the process exists
    #[cfg(unix)]
    {
        use nix::sys::signal;
        use nix::unistd::Pid;
        if signal::kill(Pid::from_raw(pid), None).is_err() {
            cleanup_daemon_files(config);
            return None;
        }
    }

    std::fs::read_to_string(&port_path).ok()?.trim().parse().ok()
}

pub fn cleanup_daemon_files(config: &TermdeckConfig) {
    let _ = std::fs::remove_file(config.daemon_pid_path());
    let _ = std::fs::remove_file(config.daemon_port_path());
}

/// Write PID and port files after the server binds.
pub fn write_daemon_files(config: &TermdeckConfig, pid: u32, port: u16) -> Result<()> {
    std::fs::write(config.daemon_pid_path(), pid.to_string())
        .context("Failed to write daemon PID file")?;
    std::fs::write(config.daemon_port_path(), port.to_string())
        .context("Failed to write daemon port file")?;
    Ok(())
}
