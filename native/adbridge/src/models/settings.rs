use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

pub const DEFAULT_SERVER_PORT: u16 = 5037;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    /// Path to the `adb` binary. Empty means "look it up on PATH".
    pub adb_path: String,
    pub server_host: String,
    pub server_port: u16,
    pub server_start_timeout_ms: u64,
    /// Upper bound for a single `getprop` / `wm` query during hydration.
    pub property_timeout_ms: u64,
    /// Capacity of the device event channel.
    pub event_buffer: usize,
    pub transfer_chunk_size: usize,
    /// Remote directory packages are staged in before `pm install`.
    pub install_dir: String,
    pub kill_server_on_close: bool,
    pub log_level: String,
    pub logs_dir: PathBuf,
}

impl Settings {
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    pub fn server_start_timeout(&self) -> Duration {
        Duration::from_millis(self.server_start_timeout_ms)
    }

    pub fn property_timeout(&self) -> Duration {
        Duration::from_millis(self.property_timeout_ms)
    }

    pub fn adb_path(&self) -> Option<&str> {
        if self.adb_path.is_empty() { None } else { Some(&self.adb_path) }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            adb_path: String::new(),
            server_host: "127.0.0.1".to_string(),
            server_port: DEFAULT_SERVER_PORT,
            server_start_timeout_ms: 10_000,
            property_timeout_ms: 2_000,
            event_buffer: 64,
            transfer_chunk_size: 32 * 1024,
            install_dir: "/data/local/tmp".to_string(),
            kill_server_on_close: false,
            log_level: "info".to_string(),
            logs_dir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("adbridge")
                .join("logs"),
        }
    }
}
