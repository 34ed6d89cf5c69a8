//! Gateway configuration: TOML file + CLI overrides.

use crate::store::{SessionRecord, User};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::info;
use vernite_proto::{VerniteError, VerniteResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            path: default_path(),
            allowed_origins: default_allowed_origins(),
            max_frame_size: default_max_frame_size(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    #[serde(default = "default_forwarded_header")]
    pub forwarded_header: String,
    /// Development sessions preloaded into the in-memory store.
    #[serde(default)]
    pub sessions: Vec<SessionSeed>,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            cookie_name: default_cookie_name(),
            forwarded_header: default_forwarded_header(),
            sessions: Vec::new(),
        }
    }
}

/// One `[[auth.sessions]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionSeed {
    pub token: String,
    pub user_id: u64,
    pub username: String,
    #[serde(default)]
    pub deleted: bool,
}

impl SessionSeed {
    pub fn into_record(self) -> SessionRecord {
        SessionRecord {
            token: self.token,
            user: User {
                id: self.user_id,
                username: self.username,
                deleted: self.deleted,
            },
            ip: None,
            last_used: SystemTime::now(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}
fn default_port() -> u16 {
    8080
}
fn default_path() -> String {
    "/ws".to_string()
}
fn default_allowed_origins() -> Vec<String> {
    [
        "http://localhost:4200",
        "http://localhost:4201",
        "https://vernite.dev",
        "tauri://localhost",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_max_frame_size() -> usize {
    crate::transport::websocket::MAX_WS_FRAME_SIZE
}
fn default_heartbeat_interval_ms() -> u64 {
    1000
}
fn default_cookie_name() -> String {
    "session".to_string()
}
fn default_forwarded_header() -> String {
    "X-Forwarded-For".to_string()
}

/// Resolved gateway configuration (CLI overrides applied).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: IpAddr,
    pub port: u16,
    pub path: String,
    pub allowed_origins: Vec<String>,
    pub max_frame_size: usize,
    pub heartbeat_interval: Duration,
    pub cookie_name: String,
    pub forwarded_header: String,
    pub sessions: Vec<SessionSeed>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from_file(ConfigFile::default())
    }
}

impl GatewayConfig {
    /// Load config from TOML file, then apply CLI overrides. A missing file
    /// means defaults.
    pub fn load(
        config_path: Option<&Path>,
        cli_host: Option<IpAddr>,
        cli_port: Option<u16>,
    ) -> VerniteResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    Self::parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let mut config = Self::from_file(file_config);
        if let Some(host) = cli_host {
            config.host = host;
        }
        if let Some(port) = cli_port {
            config.port = port;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> VerniteResult<ConfigFile> {
        toml::from_str(content).map_err(|e| VerniteError::Config(format!("config parse error: {e}")))
    }

    fn from_file(file: ConfigFile) -> Self {
        Self {
            host: file.server.host,
            port: file.server.port,
            path: file.server.path,
            allowed_origins: file.server.allowed_origins,
            max_frame_size: file.server.max_frame_size,
            heartbeat_interval: Duration::from_millis(file.server.heartbeat_interval_ms),
            cookie_name: file.auth.cookie_name,
            forwarded_header: file.auth.forwarded_header,
            sessions: file.auth.sessions,
        }
    }

    fn validate(&self) -> VerniteResult<()> {
        if !self.path.starts_with('/') {
            return Err(VerniteError::Config(format!(
                "server.path must start with '/': {}",
                self.path
            )));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(VerniteError::Config("server.heartbeat_interval_ms must be > 0".into()));
        }
        if self.cookie_name.is_empty() {
            return Err(VerniteError::Config("auth.cookie_name must not be empty".into()));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
