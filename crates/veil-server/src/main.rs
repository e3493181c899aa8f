//! veil-server: WebSocket tunnel behind an ordinary-looking web front.
//!
//! Serves a maintenance page, a status API and a share link on one port,
//! and relays authenticated WebSocket sessions to arbitrary TCP targets.

mod admission;
mod config;
mod disguise;
mod http;
mod relay;
mod router;
mod server;
mod subscription;
mod transport;

use clap::Parser;
use config::{ConfigOverrides, ServerConfig};
use server::TunnelServer;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

/// veil-server: WebSocket tunnel server
#[derive(Parser, Debug)]
#[command(name = "veil-server", version, about = "WebSocket tunnel server")]
struct Cli {
    /// Shared identity (UUID) clients must present
    #[arg(long, env = "UUID")]
    uuid: Option<String>,

    /// Public domain advertised in the share link
    #[arg(long, env = "DOMAIN")]
    domain: Option<String>,

    /// Listen port
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Listen IP address (0.0.0.0, ::, 127.0.0.1, ...)
    #[arg(long, env = "LISTEN_HOST")]
    listen_host: Option<String>,

    /// Tunnel WebSocket path
    #[arg(long, env = "WS_PATH")]
    ws_path: Option<String>,

    /// Node name shown in the share link and status API
    #[arg(long, env = "NODE_NAME")]
    node_name: Option<String>,

    /// HTML file served at /
    #[arg(long, env = "HTML_FILE")]
    html_file: Option<String>,

    /// Extra path serving the share link
    #[arg(long, env = "SUB_PATH")]
    sub_path: Option<String>,

    /// Directory for the persisted share link
    #[arg(long, env = "FILE_PATH")]
    cache_dir: Option<String>,

    /// Maximum concurrent tunnel sessions
    #[arg(long, env = "MAX_CONNECTIONS")]
    max_connections: Option<usize>,

    /// Relay read buffer size in bytes
    #[arg(long, env = "BUFFER_SIZE")]
    buffer_size: Option<usize>,

    /// Port advertised in the share link
    #[arg(long, env = "LINK_PORT")]
    link_port: Option<u16>,

    /// Monitoring endpoint reported by the status API
    #[arg(long, env = "MONITOR_ENDPOINT")]
    monitor_endpoint: Option<String>,

    /// Whether an external tunnel fronts this server
    #[arg(long, env = "EXTERNAL_TUNNEL")]
    external_tunnel: Option<bool>,

    /// Config file path
    #[arg(long, default_value = "~/.veil/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            uuid: self.uuid.clone(),
            domain: self.domain.clone(),
            listen_host: self.listen_host.clone(),
            port: self.port,
            ws_path: self.ws_path.clone(),
            node_name: self.node_name.clone(),
            html_file: self.html_file.clone(),
            sub_path: self.sub_path.clone(),
            cache_dir: self.cache_dir.clone(),
            max_connections: self.max_connections,
            buffer_size: self.buffer_size,
            link_port: self.link_port,
            monitor_endpoint: self.monitor_endpoint.clone(),
            external_tunnel: self.external_tunnel,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    // Load server config (file + env/CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), cli.overrides()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %server_config.listen_addr,
        domain = %server_config.domain,
        path = %server_config.ws_path,
        node = %server_config.node_name,
        identity = %server_config.identity.redacted(),
        max_connections = server_config.max_connections,
        buffer_size = server_config.buffer_size,
        "starting veil-server"
    );
    if let Some(ref sub) = server_config.sub_path {
        info!(path = %sub, "subscription path enabled");
    }

    let server = TunnelServer::new(server_config);

    match server.disguise().store().load().await {
        Ok(Some(_)) => {
            debug!(path = %server.disguise().store().path().display(), "found persisted subscription")
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "cannot read persisted subscription"),
    }

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("veil-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler, waiting for Ctrl+C only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
