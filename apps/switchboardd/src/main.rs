use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tracing::info;

use switchboard_core::ProxyConfig;
use switchboard_mcp::McpServerConfig;
use switchboardd::app::{self, AppState};
use switchboardd::manager::{ManagerOptions, UpstreamManager};
use switchboardd::registry::CapabilityRegistry;
use switchboardd::router::ProxyRouter;
use switchboardd::sessions::{DEFAULT_EVICTION_INTERVAL, DEFAULT_IDLE_TIMEOUT, SessionTable};

#[derive(Debug, Clone, Parser)]
#[command(name = "switchboardd", version, about = "Aggregating MCP proxy")]
struct Args {
    /// TCP port for the downstream endpoint.
    #[arg(
        long,
        env = "SWITCHBOARD_PORT",
        default_value_t = 3000,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    port: u16,

    /// Host to bind.
    #[arg(long, env = "SWITCHBOARD_HOST", default_value = "localhost")]
    host: String,

    /// Disable permissive CORS on the downstream endpoint.
    #[arg(long, default_value_t = false)]
    no_cors: bool,

    /// Path to the mcpServers configuration file.
    #[arg(long, env = "SWITCHBOARD_CONFIG", default_value = "mcp-servers.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hyper=warn,reqwest=warn".into()),
        )
        .json()
        .init();

    // `--help`/`--version` exit 0; usage errors (unknown flags, bad values)
    // exit 1.
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = if e.exit_code() == 0 { 0 } else { 1 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let text = std::fs::read_to_string(&args.config)
        .with_context(|| format!("read configuration {}", args.config.display()))?;
    let config = ProxyConfig::parse(&text).context("validate configuration")?;
    info!(upstreams = config.upstreams.len(), "configuration loaded");

    let registry = Arc::new(CapabilityRegistry::default());
    let manager = UpstreamManager::new(registry.clone(), ManagerOptions::default());
    manager.initialize_connections(&config).await;

    let sessions = SessionTable::new(DEFAULT_IDLE_TIMEOUT);
    sessions.clone().spawn_eviction_loop(DEFAULT_EVICTION_INTERVAL);

    let state = AppState {
        cfg: McpServerConfig::default_for_binary("switchboard", env!("CARGO_PKG_VERSION")),
        handler: Arc::new(ProxyRouter::new(registry.clone(), manager.clone())),
        sessions,
        registry,
        manager: manager.clone(),
    };
    let app = app::router(state, !args.no_cors);

    let listener = tokio::net::TcpListener::bind((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("bind {}:{}", args.host, args.port))?;
    info!(host = %args.host, port = args.port, "starting switchboard");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve downstream endpoint")?;

    manager.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    let mut quit = match signal(SignalKind::quit()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGQUIT handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = term.recv() => info!("received SIGTERM"),
        _ = quit.recv() => info!("received SIGQUIT"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received ctrl-c");
}
