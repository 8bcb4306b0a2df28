pub mod attach;
pub mod daemon;
pub mod terminal;

use anyhow::{Context, Result};
use std::path::PathBuf;
use termdeck_protocol::api::{CreateSessionRequest, ErrorBody, SessionSummary};
use tracing::debug;

use crate::config::{ServerConfig, TermdeckConfig};
use attach::AttachOutcome;
use daemon::DaemonError;

/// HTTP client for the session control plane of one server.
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            http: reqwest::Client::new(),
        }
    }

    /// Pick the server to talk to: an explicit `--server`, else a live
    /// server using this data directory, else the configured address.
    pub fn discover(
        config: &TermdeckConfig,
        server: Option<String>,
        token: Option<String>,
    ) -> Result<Self> {
        if let Some(url) = server {
            return Ok(Self::new(url, token));
        }
        let mut server_config = ServerConfig::from_file(&config.load()?.server);
        if let Some(port) = daemon::running_port(config) {
            debug!(port, "found running server");
            server_config.port = port;
        }
        Ok(Self::new(server_config.base_url(), token))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// WebSocket URL for the multiplexed channel. The token travels as a
    /// query parameter.
    pub fn ws_url(&self) -> String {
        let base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.base_url.clone()
        };
        match &self.token {
            Some(token) => format!("{}{}?token={}", base, termdeck_protocol::WS_PATH, token),
            None => format!("{}{}", base, termdeck_protocol::WS_PATH),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, DaemonError> {
        let resp = builder.send().await.map_err(DaemonError::from_reqwest)?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let message = match resp.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        Err(anyhow::anyhow!("server returned {}: {}", status.as_u16(), message).into())
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, DaemonError> {
        let resp = self
            .send(self.request(reqwest::Method::GET, "/api/sessions"))
            .await?;
        resp.json().await.map_err(DaemonError::from_reqwest)
    }

    pub async fn create_session(
        &self,
        working_dir: String,
        display_name: Option<String>,
    ) -> Result<SessionSummary, DaemonError> {
        let body = CreateSessionRequest {
            working_dir,
            display_name,
        };
        let resp = self
            .send(self.request(reqwest::Method::POST, "/api/sessions").json(&body))
            .await?;
        resp.json().await.map_err(DaemonError::from_reqwest)
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), DaemonError> {
        self.send(self.request(
            reqwest::Method::DELETE,
            &format!("/api/sessions/{}", session_id),
        ))
        .await?;
        Ok(())
    }
}

/// Map an unreachable server to a friendly message; pass other errors on.
fn report(err: DaemonError, client: &ApiClient) -> anyhow::Error {
    match err {
        DaemonError::Unavailable => anyhow::anyhow!(
            "No termdeck server at {}. Start one with `termdeck server`.",
            client.base_url()
        ),
        DaemonError::Other(e) => e,
    }
}

/// Attach this terminal to every session, showing `target` (or the most
/// recent session) first.
pub async fn attach_command(client: &ApiClient, target: Option<String>) -> Result<()> {
    let sessions = client
        .list_sessions()
        .await
        .map_err(|e| report(e, client))?;
    let initial = match target {
        Some(t) => match_session(&sessions, &t)?,
        None => sessions
            .iter()
            .max_by_key(|s| s.created_at)
            .map(|s| s.session_id.clone())
            .context("No sessions. Use `termdeck new` to start one.")?,
    };
    run_attach(client, sessions, initial).await
}

async fn run_attach(client: &ApiClient, sessions: Vec<SessionSummary>, initial: String) -> Result<()> {
    match attach::attach(client, sessions, &initial).await {
        Ok(AttachOutcome::Detached) => eprintln!("\r\n[termdeck: detached]"),
        Ok(AttachOutcome::Exited) => eprintln!("\r\n[termdeck: all sessions ended]"),
        Err(DaemonError::Unavailable) => eprintln!("\r\n[termdeck: server stopped]"),
        Err(DaemonError::Other(e)) => return Err(e),
    }
    Ok(())
}

pub async fn list_command(client: &ApiClient, json: bool) -> Result<()> {
    let sessions = client
        .list_sessions()
        .await
        .map_err(|e| report(e, client))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
    } else if sessions.is_empty() {
        println!("No sessions.");
    } else {
        println!("{:<10} {:<24} {:<20} {}", "ID", "NAME", "CREATED", "WORKING DIR");
        println!("{}", "-".repeat(90));
        for s in &sessions {
            let short_id = s.session_id.get(..8).unwrap_or(&s.session_id);
            println!(
                "{:<10} {:<24} {:<20} {}",
                short_id,
                s.display_name,
                s.created_at.format("%Y-%m-%d %H:%M:%S"),
                s.working_dir
            );
        }
        println!("\n{} session(s)", sessions.len());
    }
    Ok(())
}

pub async fn new_command(
    client: &ApiClient,
    dir: Option<PathBuf>,
    name: Option<String>,
    attach: bool,
) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    let working_dir = match dir {
        Some(d) if d.is_absolute() => d,
        Some(d) => cwd.join(d),
        None => cwd,
    };

    let created = client
        .create_session(working_dir.to_string_lossy().to_string(), name)
        .await
        .map_err(|e| report(e, client))?;
    eprintln!(
        "Started {} ({}) in {}",
        created.display_name, created.session_id, created.working_dir
    );

    if attach {
        let sessions = client
            .list_sessions()
            .await
            .map_err(|e| report(e, client))?;
        run_attach(client, sessions, created.session_id).await?;
    }
    Ok(())
}

pub async fn kill_command(client: &ApiClient, target: &str) -> Result<()> {
    let sessions = client
        .list_sessions()
        .await
        .map_err(|e| report(e, client))?;
    let session_id = match_session(&sessions, target)?;
    client
        .delete_session(&session_id)
        .await
        .map_err(|e| report(e, client))?;
    eprintln!("Killed {}", session_id);
    Ok(())
}

/// Resolve a target against a session list: exact id, then display name,
/// then unique id prefix.
fn match_session(sessions: &[SessionSummary], target: &str) -> Result<String> {
    if sessions.is_empty() {
        anyhow::bail!("No sessions. Use `termdeck new` to start one.");
    }

    if let Some(s) = sessions.iter().find(|s| s.session_id == target) {
        return Ok(s.session_id.clone());
    }
    if let Some(s) = sessions.iter().find(|s| s.display_name == target) {
        return Ok(s.session_id.clone());
    }
    let prefix_matches: Vec<_> = sessions
        .iter()
        .filter(|s| s.session_id.starts_with(target))
        .collect();
    match prefix_matches.as_slice() {
        [] => anyhow::bail!("No session found matching '{}'", target),
        [only] => Ok(only.session_id.clone()),
        many => anyhow::bail!(
            "Ambiguous: '{}' matches {} sessions. Be more specific.",
            target,
            many.len()
        ),
    }
}
