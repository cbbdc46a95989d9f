//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use switchyard_core::{DEFAULT_ROUTER_PORT, DEFAULT_SERVICE_PORT};

/// Router configuration. File: `--config PATH`, else ~/.config/switchyard/config.toml,
/// else /etc/switchyard/config.toml.
/// Env overrides: SWITCHYARD_LISTEN_PORT, SWITCHYARD_SERVICE_PORT, SWITCHYARD_PACKAGE_PATH.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Router listen port (default 31254).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Port spawned services dial back on (default 31255).
    #[serde(default = "default_service_port")]
    pub service_port: u16,
    #[serde(default = "default_pending_timeout_ms")]
    pub pending_timeout_ms: u64,
    #[serde(default = "default_service_start_timeout_ms")]
    pub service_start_timeout_ms: u64,
    /// Directories holding `<name>/<version>/` package trees, searched in order.
    #[serde(default)]
    pub package_roots: Vec<PathBuf>,
    #[serde(default)]
    pub trackers: TrackerConfig,
}

/// `[trackers]` table.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackerConfig {
    #[serde(default = "default_true")]
    pub android: bool,
    #[serde(default = "default_true")]
    pub ios: bool,
    #[serde(default = "default_winphone")]
    pub winphone: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    /// Port the router listens on inside the device.
    #[serde(default = "default_listen_port")]
    pub device_port: u16,
    #[serde(default = "default_adb")]
    pub adb_path: PathBuf,
    #[serde(default = "default_idevice_id")]
    pub idevice_id_path: PathBuf,
    #[serde(default = "default_iproxy")]
    pub iproxy_path: PathBuf,
    #[serde(default = "default_ipoverusb")]
    pub ipoverusb_path: PathBuf,
}

fn default_listen_port() -> u16 {
    DEFAULT_ROUTER_PORT
}
fn default_service_port() -> u16 {
    DEFAULT_SERVICE_PORT
}
fn default_pending_timeout_ms() -> u64 {
    4000
}
fn default_service_start_timeout_ms() -> u64 {
    10_000
}
fn default_true() -> bool {
    true
}
fn default_winphone() -> bool {
    cfg!(windows)
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_retry_interval_ms() -> u64 {
    200
}
fn default_adb() -> PathBuf {
    PathBuf::from("adb")
}
fn default_idevice_id() -> PathBuf {
    PathBuf::from("idevice_id")
}
fn default_iproxy() -> PathBuf {
    PathBuf::from("iproxy")
}
fn default_ipoverusb() -> PathBuf {
    PathBuf::from("IpOverUsbEnum")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            service_port: default_service_port(),
            pending_timeout_ms: default_pending_timeout_ms(),
            service_start_timeout_ms: default_service_start_timeout_ms(),
            package_roots: Vec::new(),
            trackers: TrackerConfig::default(),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            android: true,
            ios: true,
            winphone: default_winphone(),
            poll_interval_ms: default_poll_interval_ms(),
            retry_interval_ms: default_retry_interval_ms(),
            device_port: default_listen_port(),
            adb_path: default_adb(),
            idevice_id_path: default_idevice_id(),
            iproxy_path: default_iproxy(),
            ipoverusb_path: default_ipoverusb(),
        }
    }
}

impl Config {
    pub fn pending_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_timeout_ms)
    }

    pub fn service_start_timeout(&self) -> Duration {
        Duration::from_millis(self.service_start_timeout_ms)
    }
}

impl TrackerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Load config: defaults, then the config file (explicit path, or the first default
/// location that exists), then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(path) => load_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => load_file(&path)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |key| std::env::var_os(key));
    Ok(c)
}

fn apply_env<F>(c: &mut Config, var: F)
where
    F: Fn(&str) -> Option<std::ffi::OsString>,
{
    let port = |key: &str| var(key)?.to_str()?.parse::<u16>().ok();
    if let Some(p) = port("SWITCHYARD_LISTEN_PORT") {
        c.listen_port = p;
    }
    if let Some(p) = port("SWITCHYARD_SERVICE_PORT") {
        c.service_port = p;
    }
    if let Some(paths) = var("SWITCHYARD_PACKAGE_PATH") {
        c.package_roots
            .extend(std::env::split_paths(&paths).filter(|p| !p.as_os_str().is_empty()));
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/switchyard/config.toml"));
    }
    out.push(PathBuf::from("/etc/switchyard/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(s)
}
