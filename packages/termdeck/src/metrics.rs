//! Server metrics for observability

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide counters
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Connections
    /// Currently open WebSocket connections
    pub active_connections: AtomicU64,
    pub total_connections: AtomicU64,
    /// Connections dropped because their outbound queue filled up
    pub lagged_connections: AtomicU64,

    // Sessions
    pub active_sessions: AtomicU64,
    pub total_sessions_created: AtomicU64,
    pub sessions_destroyed: AtomicU64,

    // Messages
    /// Frames received from clients
    pub messages_received: AtomicU64,
    /// Frames written to clients
    pub messages_sent: AtomicU64,

    // Errors
    /// Spawn failures and writes/resizes against dead processes
    pub pty_errors: AtomicU64,
    /// Malformed or oversized client frames
    pub protocol_errors: AtomicU64,

    // Replay
    /// Attaches that replayed buffered output
    pub replays: AtomicU64,
    pub replay_bytes_sent: AtomicU64,

    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_lagged(&self) {
        self.lagged_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_created(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        self.total_sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_destroyed(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
        self.sessions_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pty_error(&self) {
        self.pty_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn replayed(&self, bytes: usize) {
        self.replays.fetch_add(1, Ordering::Relaxed);
        self.replay_bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
                lagged: self.lagged_connections.load(Ordering::Relaxed),
            },
            sessions: SessionMetrics {
                active: self.active_sessions.load(Ordering::Relaxed),
                total_created: self.total_sessions_created.load(Ordering::Relaxed),
                destroyed: self.sessions_destroyed.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                received: self.messages_received.load(Ordering::Relaxed),
                sent: self.messages_sent.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                pty: self.pty_errors.load(Ordering::Relaxed),
                protocol: self.protocol_errors.load(Ordering::Relaxed),
            },
            replay: ReplayMetrics {
                count: self.replays.load(Ordering::Relaxed),
                bytes_sent: self.replay_bytes_sent.load(Ordering::Relaxed),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub sessions: SessionMetrics,
    pub messages: MessageMetrics,
    pub errors: ErrorMetrics,
    pub replay: ReplayMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
    pub lagged: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub active: u64,
    pub total_created: u64,
    pub destroyed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub received: u64,
    pub sent: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub pty: u64,
    pub protocol: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayMetrics {
    pub count: u64,
    pub bytes_sent: u64,
}

/// Body of `GET /health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub sessions: u64,
    pub connections: u64,
    pub uptime_secs: u64,
}
