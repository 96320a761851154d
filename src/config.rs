use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Error;
use crate::infrastructure::bluetooth::protocol;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            console_logging_enabled: default_true(),
            log_file: default_log_file(),
            show_target: default_true(),
            show_thread_ids: default_false(),
            ansi_colors: default_true(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_file() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("ble-provision").join("peripheral.log"))
}

/// Configuration for the peripheral lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeripheralConfig {
    /// Local name carried in the advertisement. Bounded to
    /// [`protocol::MAX_DEVICE_NAME_LEN`] bytes; longer names are truncated.
    #[serde(default = "default_device_name")]
    pub device_name: String,

    /// Adapter to use ("hci0"); the first capable adapter when unset.
    #[serde(default)]
    pub adapter: Option<String>,

    /// Maximum bring-up attempts before the terminal `Failed` state.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Fixed delay between bring-up attempts in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// How many times to poll for the daemon before giving up the attempt.
    #[serde(default = "default_daemon_poll_attempts")]
    pub daemon_poll_attempts: u32,

    /// Delay between daemon polls in milliseconds.
    #[serde(default = "default_daemon_poll_delay_ms")]
    pub daemon_poll_delay_ms: u64,

    /// Upper bound for each best-effort unregister call during teardown,
    /// so teardown cannot block on an unresponsive daemon.
    #[serde(default = "default_unregister_timeout_ms")]
    pub unregister_timeout_ms: u64,

    #[serde(default)]
    pub log: LogSettings,
}

impl Default for PeripheralConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            adapter: None,
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            daemon_poll_attempts: default_daemon_poll_attempts(),
            daemon_poll_delay_ms: default_daemon_poll_delay_ms(),
            unregister_timeout_ms: default_unregister_timeout_ms(),
            log: LogSettings::default(),
        }
    }
}

fn default_device_name() -> String {
    "BLE-Provision".to_string()
}
fn default_max_attempts() -> u32 {
    5
}
fn default_retry_delay_ms() -> u64 {
    2000
}
fn default_daemon_poll_attempts() -> u32 {
    10
}
fn default_daemon_poll_delay_ms() -> u64 {
    1000
}
fn default_unregister_timeout_ms() -> u64 {
    2000
}

impl PeripheralConfig {
    /// Load a configuration from a JSON file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, Error> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        serde_json::from_str(&data)
            .map_err(|e| Error::Config(format!("cannot parse {}: {}", path.display(), e)))
    }

    /// Validate bounds and normalize the device name.
    pub fn validated(mut self) -> Result<Self, Error> {
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".into()));
        }
        if self.daemon_poll_attempts == 0 {
            return Err(Error::Config(
                "daemon_poll_attempts must be at least 1".into(),
            ));
        }
        if self.device_name.is_empty() {
            self.device_name = default_device_name();
        }
        self.device_name = protocol::truncate_name(&self.device_name);
        Ok(self)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn daemon_poll_delay(&self) -> Duration {
        Duration::from_millis(self.daemon_poll_delay_ms)
    }

    pub fn unregister_timeout(&self) -> Duration {
        Duration::from_millis(self.unregister_timeout_ms)
    }
}
