//! Configuration management for the backup supervisor.
//!
//! Loads configuration from a TOML file; every field has a default so a
//! partial file (or none at all) is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub cbt: CbtConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Unique supervisor identifier
    #[serde(default = "default_supervisor_id")]
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Remote `host:port` the CONNECT request is issued to; empty disables the tunnel
    #[serde(default)]
    pub target_address: String,

    /// CA bundle used to verify the target
    #[serde(default)]
    pub ca_file: PathBuf,

    /// Client certificate and key (mutual TLS)
    #[serde(default)]
    pub cert_file: PathBuf,
    #[serde(default)]
    pub key_file: PathBuf,

    /// Local export socket; its removal stops the tunnel for good
    #[serde(default = "default_export_socket")]
    pub export_socket: PathBuf,

    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// A serving cycle longer than this resets the backoff
    #[serde(default = "default_stable_period_secs")]
    pub stable_period_secs: u64,

    #[serde(default = "default_graceful_shutdown_secs")]
    pub graceful_shutdown_secs: u64,

    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    #[serde(default = "default_keepalive_timeout_secs")]
    pub keepalive_timeout_secs: u64,

    /// Clients pinging faster than this are considered abusive
    #[serde(default = "default_min_ping_interval_secs")]
    pub min_ping_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// NBD server socket exposing the guest disks
    #[serde(default = "default_export_socket")]
    pub nbd_socket: PathBuf,

    /// Extents per MapResponse
    #[serde(default = "default_map_batch_size")]
    pub map_batch_size: usize,

    /// Bytes per DataChunk
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CbtConfig {
    /// Root directory for per-guest overlay images
    #[serde(default = "default_overlay_dir")]
    pub overlay_dir: PathBuf,

    /// Storage daemon driven over QMP to create overlays
    #[serde(default = "default_storage_daemon")]
    pub storage_daemon: String,

    /// Image inspection tool
    #[serde(default = "default_image_tool")]
    pub image_tool: String,

    #[serde(default = "default_create_timeout_secs")]
    pub create_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Unix socket the hypervisor serves pull-mode exports on
    #[serde(default = "default_export_socket")]
    pub pull_socket: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_supervisor_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "backup-supervisor".to_string())
}

fn default_export_socket() -> PathBuf {
    PathBuf::from("/var/run/kubevirt/sockets/backup-nbd-sock")
}

fn default_dial_timeout_secs() -> u64 {
    10
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30000
}

fn default_stable_period_secs() -> u64 {
    60
}

fn default_graceful_shutdown_secs() -> u64 {
    5
}

fn default_keepalive_interval_secs() -> u64 {
    30
}

fn default_keepalive_timeout_secs() -> u64 {
    10
}

fn default_min_ping_interval_secs() -> u64 {
    5
}

fn default_map_batch_size() -> usize {
    1024
}

fn default_read_chunk_size() -> u64 {
    4 * 1024 * 1024 // 4MB
}

fn default_overlay_dir() -> PathBuf {
    PathBuf::from("/var/run/kubevirt-private/cbt")
}

fn default_storage_daemon() -> String {
    "qemu-storage-daemon".to_string()
}

fn default_image_tool() -> String {
    "qemu-img".to_string()
}

fn default_create_timeout_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            id: default_supervisor_id(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            target_address: String::new(),
            ca_file: PathBuf::new(),
            cert_file: PathBuf::new(),
            key_file: PathBuf::new(),
            export_socket: default_export_socket(),
            dial_timeout_secs: default_dial_timeout_secs(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            stable_period_secs: default_stable_period_secs(),
            graceful_shutdown_secs: default_graceful_shutdown_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            keepalive_timeout_secs: default_keepalive_timeout_secs(),
            min_ping_interval_secs: default_min_ping_interval_secs(),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            nbd_socket: default_export_socket(),
            map_batch_size: default_map_batch_size(),
            read_chunk_size: default_read_chunk_size(),
        }
    }
}

impl Default for CbtConfig {
    fn default() -> Self {
        Self {
            overlay_dir: default_overlay_dir(),
            storage_daemon: default_storage_daemon(),
            image_tool: default_image_tool(),
            create_timeout_secs: default_create_timeout_secs(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            pull_socket: default_export_socket(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            supervisor: SupervisorConfig::default(),
            tunnel: TunnelConfig::default(),
            export: ExportConfig::default(),
            cbt: CbtConfig::default(),
            backup: BackupConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl TunnelConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn graceful_shutdown(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_secs)
    }

    pub fn stable_period(&self) -> Duration {
        Duration::from_secs(self.stable_period_secs)
    }
}

impl CbtConfig {
    pub fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.create_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [tunnel]
            target_address = "backup.example:443"
            max_backoff_ms = 5000

            [export]
            map_batch_size = 64
            "#,
        )
        .unwrap();

        assert_eq!(config.tunnel.target_address, "backup.example:443");
        assert_eq!(config.tunnel.max_backoff_ms, 5000);
        assert_eq!(config.tunnel.initial_backoff_ms, 1000);
        assert_eq!(config.export.map_batch_size, 64);
        assert_eq!(config.export.read_chunk_size, 4 * 1024 * 1024);
        assert_eq!(config.log.level, "info");
        assert_eq!(config.cbt.create_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supervisor.toml");
        std::fs::write(&path, "[supervisor]\nid = \"node-7\"\n\n[export]\nread_chunk_size = 1048576\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.supervisor.id, "node-7");
        assert_eq!(config.export.read_chunk_size, 1024 * 1024);
        assert!(config.tunnel.target_address.is_empty());
    }
}
