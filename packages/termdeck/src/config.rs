use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::info;

// =============================================================================
// Tunable config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [server]
//                    port = 4008
//
//   env var:         TERMDECK_SERVER__PORT=4008   (double underscore = nesting)
//
//   (single underscore stays within field names: TERMDECK_SERVER__MAX_LOG_KB)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub auth: AuthFileConfig,
}

/// Lives under `[server]` in config.toml.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shell for new sessions; `$SHELL` when unset
    #[serde(default)]
    pub shell: Option<String>,
    /// Output retained per session for replay, in KiB
    #[serde(default = "default_max_log_kb")]
    pub max_log_kb: usize,
    #[serde(default = "default_cols")]
    pub default_cols: u16,
    #[serde(default = "default_rows")]
    pub default_rows: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shell: None,
            max_log_kb: default_max_log_kb(),
            default_cols: default_cols(),
            default_rows: default_rows(),
        }
    }
}

/// Lives under `[auth]` in config.toml.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthFileConfig {
    #[serde(default = "default_auth_enabled")]
    pub enabled: bool,
    /// Bearer token -> owner id
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

impl Default for AuthFileConfig {
    fn default() -> Self {
        Self {
            enabled: default_auth_enabled(),
            tokens: HashMap::new(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    4008
}
fn default_max_log_kb() -> usize {
    25 * 1024
}
fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}
fn default_auth_enabled() -> bool {
    true
}

/// Build the figment: struct defaults, then `config.toml`, then env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `TERMDECK_AUTH__ENABLED=false`  →  `auth.enabled = false`
///   `TERMDECK_SERVER__MAX_LOG_KB=512`  →  `server.max_log_kb = 512`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("TERMDECK_").split("__"))
}

// =============================================================================
// Runtime configs (derived from FileConfig)
// =============================================================================

/// Owner id used for every caller when auth is disabled.
pub const LOCAL_OWNER: &str = "local";

#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub enabled: bool,
    pub tokens: HashMap<String, String>,
}

impl AuthConfig {
    pub fn from_file(fc: &AuthFileConfig) -> Self {
        Self {
            enabled: fc.enabled,
            tokens: fc.tokens.clone(),
        }
    }

    /// Owner id for a presented token.
    pub fn owner_for_token(&self, token: &str) -> Option<&str> {
        self.tokens.get(token).map(String::as_str)
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shell: Option<String>,
    pub max_log_bytes: usize,
    pub default_cols: u16,
    pub default_rows: u16,
}

impl ServerConfig {
    pub fn from_file(fc: &ServerFileConfig) -> Self {
        Self {
            host: fc.host.clone(),
            port: fc.port,
            shell: fc.shell.clone(),
            max_log_bytes: fc.max_log_kb * 1024,
            default_cols: fc.default_cols,
            default_rows: fc.default_rows,
        }
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// URL local clients use to reach the server. Wildcard binds are
    /// reached over loopback.
    pub fn base_url(&self) -> String {
        let host = match self.host.as_str() {
            "0.0.0.0" | "::" => "127.0.0.1",
            host => host,
        };
        format!("http://{}:{}", host, self.port)
    }
}

// =============================================================================
// Directory layout (derived from --data-dir, not tunable via figment)
// =============================================================================

#[derive(Clone, Debug)]
pub struct TermdeckConfig {
    pub data_dir: PathBuf,
}

impl TermdeckConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".termdeck"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let state_dir = data_dir.join("state");
        std::fs::create_dir_all(&state_dir)
            .with_context(|| format!("Failed to create state directory: {:?}", state_dir))?;

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir })
    }

    /// Load `config.toml` and env overrides for this data directory.
    pub fn load(&self) -> Result<FileConfig> {
        load_config(&self.data_dir)
            .extract()
            .with_context(|| format!("Invalid configuration in {:?}", self.config_toml_path()))
    }

    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    pub fn daemon_pid_path(&self) -> PathBuf {
        self.state_dir().join("daemon.pid")
    }

    pub fn daemon_port_path(&self) -> PathBuf {
        self.state_dir().join("daemon.port")
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
