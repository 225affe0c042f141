use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument};

use crate::models::Device;

/// Where known devices are remembered between watcher events (and, for persistent stores,
/// between runs). Keyed by serial.
#[async_trait]
pub trait DeviceStore: Send + Sync + std::fmt::Debug {
    /// Inserts or replaces the record for `device.serial()`.
    async fn save(&self, device: &Device) -> Result<()>;
    async fn get(&self, serial: &str) -> Result<Option<Device>>;
    async fn list(&self) -> Result<Vec<Device>>;
    /// Removing an unknown serial is not an error.
    async fn delete(&self, serial: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryDeviceStore {
    devices: RwLock<HashMap<String, Device>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn save(&self, device: &Device) -> Result<()> {
        self.devices.write().await.insert(device.serial().to_string(), device.clone());
        Ok(())
    }

    async fn get(&self, serial: &str) -> Result<Option<Device>> {
        Ok(self.devices.read().await.get(serial).cloned())
    }

    async fn list(&self) -> Result<Vec<Device>> {
        let mut devices: Vec<Device> = self.devices.read().await.values().cloned().collect();
        devices.sort_by(|a, b| a.serial().cmp(b.serial()));
        Ok(devices)
    }

    async fn delete(&self, serial: &str) -> Result<()> {
        self.devices.write().await.remove(serial);
        Ok(())
    }
}

/// Keeps all devices in one pretty-printed JSON object, rewritten on every change.
#[derive(Debug)]
pub struct JsonDeviceStore {
    path: PathBuf,
    devices: Mutex<BTreeMap<String, Device>>,
}

impl JsonDeviceStore {
    /// Opens `path`, starting empty if the file doesn't exist yet.
    #[instrument(level = "debug", err)]
    pub async fn open(path: &Path) -> Result<Self> {
        let devices = if tokio::fs::try_exists(path).await.unwrap_or(false) {
            let content = fs_err::tokio::read_to_string(path)
                .await
                .context("Failed to read device store")?;
            serde_json::from_str(&content).context("Failed to parse device store")?
        } else {
            info!(path = %path.display(), "Device store doesn't exist, starting empty");
            BTreeMap::new()
        };
        Ok(Self { path: path.to_path_buf(), devices: Mutex::new(devices) })
    }

    async fn persist(&self, devices: &BTreeMap<String, Device>) -> Result<()> {
        let json = serde_json::to_string_pretty(devices).context("Failed to serialize devices")?;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs_err::tokio::create_dir_all(parent)
                .await
                .context("Failed to create device store directory")?;
        }
        // replaced atomically
        let tmp = self.path.with_extension("json.tmp");
        fs_err::tokio::write(&tmp, json).await.context("Failed to write device store")?;
        fs_err::tokio::rename(&tmp, &self.path).await.context("Failed to replace device store")?;
        debug!(path = %self.path.display(), count = devices.len(), "Device store written");
        Ok(())
    }
}

#[async_trait]
impl DeviceStore for JsonDeviceStore {
    async fn save(&self, device: &Device) -> Result<()> {
        let mut devices = self.devices.lock().await;
        devices.insert(device.serial().to_string(), device.clone());
        self.persist(&devices).await
    }

    async fn get(&self, serial: &str) -> Result<Option<Device>> {
        Ok(self.devices.lock().await.get(serial).cloned())
    }

    async fn list(&self) -> Result<Vec<Device>> {
        Ok(self.devices.lock().await.values().cloned().collect())
    }

    async fn delete(&self, serial: &str) -> Result<()> {
        let mut devices = self.devices.lock().await;
        if devices.remove(serial).is_some() {
            self.persist(&devices).await?;
        }
        Ok(())
    }
}
