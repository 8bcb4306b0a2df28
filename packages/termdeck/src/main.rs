use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{get, patch},
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod auth;
mod cli;
mod config;
mod error;
mod handlers;
mod metrics;
mod output_log;
mod process;
mod session_registry;
#[cfg(test)]
mod test_helpers;
mod ws;

use config::{AuthConfig, ServerConfig, TermdeckConfig};
use metrics::ServerMetrics;
use process::PtySpawner;
use session_registry::{RegistrySettings, SessionRegistry};

/// Custom span maker that adds a unique request_id to each HTTP request span.
#[derive(Clone, Debug)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri().path(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "termdeck")]
#[command(about = "Shell sessions in the browser, multiplexed over one connection")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.termdeck)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Server URL for client commands (defaults to the running daemon or config)
    #[arg(long, global = true)]
    server: Option<String>,

    /// Access token for client commands
    #[arg(long, global = true, env = "TERMDECK_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server in the foreground
    Server(ServerArgs),

    /// Attach to sessions in this terminal
    Attach(AttachArgs),

    /// List your sessions
    List(ListArgs),

    /// Start a new session
    New(NewArgs),

    /// End a session
    Kill(KillArgs),
}

#[derive(Parser)]
struct ServerArgs {
    /// Port for the web server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides config)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Shell for new sessions (overrides config and $SHELL)
    #[arg(long)]
    shell: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Parser)]
struct AttachArgs {
    /// Session name, ID, or ID prefix to show first (default: most recent)
    target: Option<String>,
}

#[derive(Parser)]
struct ListArgs {
    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct NewArgs {
    /// Working directory (default: current directory)
    dir: Option<PathBuf>,

    /// Display name
    #[arg(short, long)]
    name: Option<String>,

    /// Attach right after creating
    #[arg(short, long)]
    attach: bool,
}

#[derive(Parser)]
struct KillArgs {
    /// Session name, ID, or ID prefix
    target: String,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub registry: SessionRegistry,
    pub auth_config: Arc<AuthConfig>,
    pub metrics: Arc<ServerMetrics>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli {
        command,
        data_dir,
        server,
        token,
    } = Cli::parse();

    let config = TermdeckConfig::new(data_dir)?;

    match command {
        Commands::Server(args) => run_server(args, config).await,
        Commands::Attach(args) => {
            let client = cli::ApiClient::discover(&config, server, token)?;
            cli::attach_command(&client, args.target).await
        }
        Commands::List(args) => {
            let client = cli::ApiClient::discover(&config, server, token)?;
            cli::list_command(&client, args.json).await
        }
        Commands::New(args) => {
            let client = cli::ApiClient::discover(&config, server, token)?;
            cli::new_command(&client, args.dir, args.name, args.attach).await
        }
        Commands::Kill(args) => {
            let client = cli::ApiClient::discover(&config, server, token)?;
            cli::kill_command(&client, &args.target).await
        }
    }
}

/// All routes, authenticated except health and metrics.
pub(crate) fn app_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/sessions",
            get(handlers::list_sessions).post(handlers::create_session),
        )
        .route(
            "/api/sessions/{id}",
            get(handlers::get_session).delete(handlers::delete_session),
        )
        .route("/api/sessions/{id}/name", patch(handlers::rename_session))
        .route(termdeck_protocol::WS_PATH, get(handlers::websocket_handler))
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(axum::middleware::from_fn_with_state(
            state.auth_config.clone(),
            auth::auth_middleware,
        ))
        .with_state(state)
}

async fn run_server(args: ServerArgs, config: TermdeckConfig) -> Result<()> {
    // Setup logging
    let default_directive = if args.debug {
        "termdeck=debug,tower_http=debug,info"
    } else {
        "termdeck=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting termdeck");

    let file_config = config.load()?;
    let mut server_config = ServerConfig::from_file(&file_config.server);
    if let Some(port) = args.port {
        server_config.port = port;
    }
    if let Some(host) = args.host {
        server_config.host = host;
    }
    if args.shell.is_some() {
        server_config.shell = args.shell;
    }
    let auth_config = AuthConfig::from_file(&file_config.auth);
    if auth_config.enabled && auth_config.tokens.is_empty() {
        warn!(
            "Auth is enabled but no tokens are configured; add [auth.tokens] to {}",
            config.config_toml_path().display()
        );
    } else if !auth_config.enabled {
        warn!("Auth is disabled; every caller acts as the local owner");
    }

    let metrics = Arc::new(ServerMetrics::new());
    let registry = SessionRegistry::new(
        Arc::new(PtySpawner::new(server_config.shell.clone())),
        RegistrySettings {
            default_cols: server_config.default_cols,
            default_rows: server_config.default_rows,
            max_log_bytes: server_config.max_log_bytes,
        },
        metrics.clone(),
    );

    let addr = server_config.bind_addr()?;
    let app_state = AppState {
        registry: registry.clone(),
        auth_config: Arc::new(auth_config),
        metrics: metrics.clone(),
    };

    let app = app_router(app_state)
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    cli::daemon::write_daemon_files(&config, std::process::id(), actual_addr.port())?;

    info!("termdeck listening on http://{}", actual_addr);
    info!("API endpoints:");
    info!("  GET    /api/sessions            - List your sessions");
    info!("  POST   /api/sessions            - Create a session");
    info!("  PATCH  /api/sessions/:id/name   - Rename a session");
    info!("  DELETE /api/sessions/:id        - Destroy a session");
    info!("  WS     {}                  - Multiplexed session channel", termdeck_protocol::WS_PATH);

    let shutdown_registry = registry.clone();
    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Received shutdown signal, closing sessions...");
        // Viewers get `closed` for every session before their queues drop
        shutdown_registry.shutdown().await;
        shutdown_registry.close_connections().await;
    };

    let server_result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await
    .context("Server error");

    // Upgraded sockets outlive the HTTP server; give them a moment to flush
    let drained = tokio::time::timeout(Duration::from_secs(2), async {
        while metrics.snapshot().connections.active > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!("Some connections did not close before shutdown");
    }

    cli::daemon::cleanup_daemon_files(&config);

    info!("Shutdown complete");
    server_result
}
