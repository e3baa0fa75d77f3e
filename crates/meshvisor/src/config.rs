//! Configuration for the meshvisor daemon.
//!
//! Values are layered: built-in defaults, then the TOML file, then
//! `MESHVISOR__SECTION__KEY` environment variables. Command-line flags are
//! applied on top by the binary.
//!
//! ```toml
//! [server]
//! socket = "/run/meshvisor/meshvisor.sock"
//! socket_mode = "0755"
//!
//! [daemon]
//! binary = "cjdroute"
//! mtu = 1304
//!
//! [peer]
//! address = "203.0.113.7:33097"
//! password = "..."
//! public_key = "...k"
//!
//! [watchdog]
//! timeout_secs = 60
//!
//! [discovery]
//! enabled = true
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use log::debug;
use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "meshvisor";

/// Effective configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub daemon: DaemonConfig,
    pub peer: Peer,
    pub watchdog: WatchdogConfig,
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Control socket clients connect to.
    pub socket: PathBuf,
    /// Octal permission bits applied to the control socket.
    pub socket_mode: String,
    /// Parent directory for per-session scratch directories.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket: PathBuf::from("/run/meshvisor/meshvisor.sock"),
            socket_mode: "0755".to_string(),
            scratch_dir: None,
        }
    }
}

impl ServerConfig {
    pub fn socket_mode(&self) -> Result<u32> {
        let digits = self.socket_mode.trim().trim_start_matches("0o");
        u32::from_str_radix(digits, 8)
            .with_context(|| format!("invalid socket mode {:?}", self.socket_mode))
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(env::temp_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Mesh daemon executable.
    pub binary: String,
    /// MTU of the tunnel device created in each namespace.
    pub mtu: u32,
    /// Connection attempts to the rendezvous socket per daemon start.
    pub rendezvous_attempts: u32,
    /// Delay between rendezvous attempts.
    pub rendezvous_delay_ms: u64,
    /// How long to wait for the daemon to exit after SIGTERM.
    pub stop_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            binary: "cjdroute".to_string(),
            mtu: 1304,
            rendezvous_attempts: 1000,
            rendezvous_delay_ms: 10,
            stop_timeout_secs: 5,
        }
    }
}

/// Bootstrap peer every daemon instance connects to. Shared read-only by
/// all sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Peer {
    pub address: String,
    pub password: String,
    pub public_key: String,
}

impl Default for Peer {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:33097".to_string(),
            password: String::new(),
            public_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Silence after which a session is torn down.
    pub timeout_secs: u64,
    /// Heartbeat cadence clients are expected to use.
    pub heartbeat_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            heartbeat_secs: 30,
        }
    }
}

impl WatchdogConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Interval between client heartbeats, at least one second.
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Scan the process table for network namespaces.
    pub enabled: bool,
    pub interval_ms: u64,
    /// Environment variable carrying a namespace's private key.
    pub key_env: String,
    /// procfs mount point.
    pub proc_root: PathBuf,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 1000,
            key_env: "CJDNS_PRIVKEY".to_string(),
            proc_root: PathBuf::from("/proc"),
        }
    }
}

impl DiscoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl AppConfig {
    /// Load configuration from `path` (or the default location) and the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path()?,
        };
        debug!("loading config from {}", path.display());

        let built = Config::builder()
            .add_source(
                File::from(path.as_path())
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(Environment::with_prefix("MESHVISOR").separator("__"))
            .build()
            .with_context(|| format!("reading config {}", path.display()))?;

        let mut config: AppConfig = built
            .try_deserialize()
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.expand_paths()?;
        Ok(config)
    }

    fn expand_paths(&mut self) -> Result<()> {
        self.server.socket = expand_path(&self.server.socket)?;
        if let Some(dir) = self.server.scratch_dir.take() {
            self.server.scratch_dir = Some(expand_path(&dir)?);
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("serializing config to TOML")
    }
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    match path.to_str() {
        Some(text) => {
            let expanded = shellexpand::full(text).context("expanding path")?;
            Ok(PathBuf::from(expanded.to_string()))
        }
        None => Ok(path.to_path_buf()),
    }
}

fn default_config_path() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME).join("config.toml"));
    }
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
        .map(|dir| dir.join(APP_NAME).join("config.toml"))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}
