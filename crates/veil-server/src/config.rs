//! Server configuration: TOML file + environment/CLI overrides.
//!
//! Precedence, lowest first: built-in defaults, config file, environment,
//! command-line flags. The last two arrive together through clap and are
//! passed in as [`ConfigOverrides`]. The resolved [`ServerConfig`] is
//! validated once and never changes afterwards.

use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use veil_core::{Identity, VeilError, VeilResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub tunnel: TunnelSection,
    #[serde(default)]
    pub disguise: DisguiseSection,
    #[serde(default)]
    pub link: LinkSection,
    #[serde(default)]
    pub collaborators: CollaboratorSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Seconds to wait for the first WebSocket message.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,
    /// Seconds to wait for the outbound TCP connect.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            buffer_size: default_buffer_size(),
            handshake_timeout: default_handshake_timeout(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// `[tunnel]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelSection {
    pub uuid: Option<String>,
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            uuid: None,
            ws_path: default_ws_path(),
        }
    }
}

/// `[disguise]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct DisguiseSection {
    #[serde(default = "default_node_name")]
    pub node_name: String,
    #[serde(default = "default_html_file")]
    pub html_file: String,
    pub sub_path: Option<String>,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
}

impl Default for DisguiseSection {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            html_file: default_html_file(),
            sub_path: None,
            cache_dir: default_cache_dir(),
        }
    }
}

/// `[link]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct LinkSection {
    pub domain: Option<String>,
    #[serde(default = "default_link_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub tls: bool,
}

impl Default for LinkSection {
    fn default() -> Self {
        Self {
            domain: None,
            port: default_link_port(),
            tls: true,
        }
    }
}

/// `[collaborators]` section: status flags only, never contacted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CollaboratorSection {
    pub monitor_endpoint: Option<String>,
    #[serde(default)]
    pub external_tunnel: bool,
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3230
}
fn default_max_connections() -> usize {
    100
}
fn default_buffer_size() -> usize {
    16 * 1024
}
fn default_handshake_timeout() -> u64 {
    30
}
fn default_connect_timeout() -> u64 {
    15
}
fn default_ws_path() -> String {
    "/api/v2/websocket".to_string()
}
fn default_node_name() -> String {
    "VPS-Node".to_string()
}
fn default_html_file() -> String {
    "index.html".to_string()
}
fn default_cache_dir() -> String {
    "./.cache".to_string()
}
fn default_link_port() -> u16 {
    443
}
fn default_true() -> bool {
    true
}

/// Values supplied by the environment or the command line.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub uuid: Option<String>,
    pub domain: Option<String>,
    pub listen_host: Option<String>,
    pub port: Option<u16>,
    pub ws_path: Option<String>,
    pub node_name: Option<String>,
    pub html_file: Option<String>,
    pub sub_path: Option<String>,
    pub cache_dir: Option<String>,
    pub max_connections: Option<usize>,
    pub buffer_size: Option<usize>,
    pub link_port: Option<u16>,
    pub monitor_endpoint: Option<String>,
    pub external_tunnel: Option<bool>,
}

/// Resolved, validated server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub identity: Identity,
    pub ws_path: String,
    /// Extra subscription path besides `/<uuid>`.
    pub sub_path: Option<String>,
    pub max_connections: usize,
    pub buffer_size: usize,
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    pub node_name: String,
    pub html_file: PathBuf,
    pub cache_dir: PathBuf,
    pub domain: String,
    pub link_port: u16,
    pub link_tls: bool,
    pub monitor_endpoint: Option<String>,
    pub external_tunnel: bool,
}

pub const MIN_LISTEN_PORT: u16 = 1024;
pub const MAX_CONNECTIONS_LIMIT: usize = 10_000;
pub const MIN_BUFFER_SIZE: usize = 1024;
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

impl ServerConfig {
    /// Load config from TOML file, then apply overrides and validate.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> VeilResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse_config_file(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, overrides)
    }

    /// Merge overrides into a parsed file and validate the result.
    pub fn resolve(file: ConfigFile, o: ConfigOverrides) -> VeilResult<Self> {
        let uuid = o.uuid.or(file.tunnel.uuid).unwrap_or_default();
        let identity: Identity = uuid.parse()?;

        let domain = o
            .domain
            .or(file.link.domain)
            .map(|d| d.trim().to_string())
            .unwrap_or_default();
        if domain.is_empty() {
            return Err(VeilError::Config("domain is not set".into()));
        }

        let listen_host = o.listen_host.unwrap_or(file.server.listen_host);
        let port = o.port.unwrap_or(file.server.port);
        if port < MIN_LISTEN_PORT {
            return Err(VeilError::Config(format!(
                "invalid port {port}: must be between {MIN_LISTEN_PORT} and 65535"
            )));
        }
        let ip: IpAddr = listen_host
            .trim()
            .parse()
            .map_err(|e| {
                VeilError::Config(format!(
                    "invalid listen host {listen_host:?}: must be an IP address such as 0.0.0.0 or :: ({e})"
                ))
            })?;
        let listen_addr = SocketAddr::new(ip, port);

        let ws_path = o.ws_path.unwrap_or(file.tunnel.ws_path).trim().to_string();
        check_path("tunnel path", &ws_path)?;
        if ws_path == "/" {
            return Err(VeilError::Config("tunnel path must not be \"/\"".into()));
        }

        let sub_path = o
            .sub_path
            .or(file.disguise.sub_path)
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());
        if let Some(ref p) = sub_path {
            check_path("subscription path", p)?;
            if p == "/" || *p == ws_path {
                return Err(VeilError::Config(format!(
                    "subscription path {p:?} collides with another route"
                )));
            }
        }

        let max_connections = o.max_connections.unwrap_or(file.server.max_connections);
        if !(1..=MAX_CONNECTIONS_LIMIT).contains(&max_connections) {
            return Err(VeilError::Config(format!(
                "invalid max connections {max_connections}: must be between 1 and {MAX_CONNECTIONS_LIMIT}"
            )));
        }

        let buffer_size = o.buffer_size.unwrap_or(file.server.buffer_size);
        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&buffer_size) {
            return Err(VeilError::Config(format!(
                "invalid buffer size {buffer_size}: must be between {MIN_BUFFER_SIZE} and {MAX_BUFFER_SIZE}"
            )));
        }

        if file.server.handshake_timeout == 0 || file.server.connect_timeout == 0 {
            return Err(VeilError::Config("timeouts must be greater than zero".into()));
        }

        let link_port = o.link_port.unwrap_or(file.link.port);
        if link_port == 0 {
            return Err(VeilError::Config("link port must not be 0".into()));
        }

        let monitor_endpoint = o
            .monitor_endpoint
            .or(file.collaborators.monitor_endpoint)
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty());

        Ok(Self {
            listen_addr,
            identity,
            ws_path,
            sub_path,
            max_connections,
            buffer_size,
            handshake_timeout: Duration::from_secs(file.server.handshake_timeout),
            connect_timeout: Duration::from_secs(file.server.connect_timeout),
            node_name: o.node_name.unwrap_or(file.disguise.node_name).trim().to_string(),
            html_file: expand_tilde_str(&o.html_file.unwrap_or(file.disguise.html_file)),
            cache_dir: expand_tilde_str(&o.cache_dir.unwrap_or(file.disguise.cache_dir)),
            domain,
            link_port,
            link_tls: file.link.tls,
            monitor_endpoint,
            external_tunnel: o.external_tunnel.unwrap_or(file.collaborators.external_tunnel),
        })
    }

    /// Path of the persisted subscription link.
    pub fn subscription_file(&self) -> PathBuf {
        self.cache_dir.join("sub.txt")
    }

    /// `/<uuid>`, always served as a subscription route.
    pub fn secret_path(&self) -> String {
        format!("/{}", self.identity)
    }
}

/// Parse TOML text into a [`ConfigFile`].
pub fn parse_config_file(content: &str) -> VeilResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| VeilError::Config(format!("config parse error: {e}")))
}

fn check_path(what: &str, path: &str) -> VeilResult<()> {
    if !path.starts_with('/') {
        return Err(VeilError::Config(format!(
            "{what} must start with '/': {path:?}"
        )));
    }
    Ok(())
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
