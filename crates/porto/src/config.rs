//! Daemon configuration.
//!
//! All tunables come from an optional JSON config file read before the
//! event loop starts; every field has a built-in default. The supervisor
//! consumes no environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use porto_common::{PortoPaths, PortoResult};

/// Default config file location.
pub const CONFIG_PATH: &str = "/etc/portod.conf";

/// Top-level configuration tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Daemon-wide settings.
    pub daemon: DaemonConfig,
    /// Container defaults and ceilings.
    pub container: ContainerConfig,
    /// Volume manager settings.
    pub volumes: VolumeConfig,
}

/// Daemon-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Maximum RPC message length in bytes.
    pub max_msg_len: usize,
    /// Listen backlog for the API socket.
    pub backlog: i32,
    /// Seconds the master waits for the slave to stop before SIGKILL.
    pub portod_stop_timeout_s: u64,
    /// Seconds the master waits for the slave to come up.
    pub portod_start_timeout_s: u64,
    /// Housekeeping period driving log rotation and aging, in seconds.
    pub rotate_period_s: u64,
    /// Maximum size of a container stdout/stderr file before rotation.
    pub max_log_size: u64,
    /// Size of the tmpfs mounted over the key-value directory.
    pub keyvalue_size: u64,
    /// Upper bound for a single key-value record.
    pub keyvalue_limit: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            max_msg_len: 32 << 20,
            backlog: 128,
            portod_stop_timeout_s: 30,
            portod_start_timeout_s: 60,
            rotate_period_s: 60,
            max_log_size: 10 << 20,
            keyvalue_size: 32 << 20,
            keyvalue_limit: 1 << 20,
        }
    }
}

/// Container defaults and ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Maximum number of containers.
    pub max_total: u32,
    /// Default aging time for dead containers, in seconds.
    pub default_aging_time_s: u64,
    /// Delay before a respawn attempt, in milliseconds.
    pub respawn_delay_ms: u64,
    /// Start timeout, in milliseconds.
    pub start_timeout_ms: u64,
    /// Ceiling for caller-supplied stop timeouts, in milliseconds.
    pub stop_timeout_ms: u64,
    /// Default cap on stdout/stderr bytes kept per container.
    pub stdout_limit: u64,
    /// Size of the /dev tmpfs inside a chroot.
    pub dev_size: u64,
    /// Size of the /run tmpfs inside a chroot.
    pub run_size: u64,
    /// How many pre-existing /run subdirectories are recreated.
    pub run_subdir_limit: usize,
    /// How many rotated journal files are kept per container.
    pub keep_journals: usize,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            max_total: 3000,
            default_aging_time_s: 60 * 60 * 24,
            respawn_delay_ms: 1000,
            start_timeout_ms: 300 * 1000,
            stop_timeout_ms: 30 * 1000,
            stdout_limit: 8 << 20,
            dev_size: 32 << 20,
            run_size: 256 << 20,
            run_subdir_limit: 100,
            keep_journals: 3,
        }
    }
}

/// Volume manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Maximum number of volumes.
    pub max_total: u32,
    /// Default place for volumes and layers.
    pub default_place: PathBuf,
    /// Whether ext4 project quota is probed and used.
    pub enable_quota: bool,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            max_total: 3000,
            default_place: PortoPaths::default().place,
            enable_quota: true,
        }
    }
}

impl Config {
    /// Load configuration from a file, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &Path) -> PortoResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.daemon.max_msg_len, 32 << 20);
        assert_eq!(config.container.max_total, 3000);
        assert_eq!(config.container.default_aging_time_s, 86400);
        assert_eq!(config.container.respawn_delay_ms, 1000);
        assert_eq!(config.container.start_timeout_ms, 300_000);
        assert_eq!(config.container.run_subdir_limit, 100);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load(Path::new("/nonexistent/portod.conf")).unwrap();
        assert_eq!(config.volumes.max_total, 3000);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portod.conf");
        std::fs::write(&path, r#"{"daemon": {"max_msg_len": 1024}}"#).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.daemon.max_msg_len, 1024);
        assert_eq!(config.container.max_total, 3000);
    }
}
