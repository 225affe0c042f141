use std::{collections::HashMap, error::Error, sync::Arc};

use derive_more::Debug;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, instrument, warn};

use crate::{
    adb::{AdbServer, watcher::DeviceWatcher},
    models::{Device, DeviceState, DeviceStateChangedEvent},
    storage::DeviceStore,
};

/// Live view of every device the watcher has reported, mirrored into a [`DeviceStore`].
#[derive(Debug)]
pub struct DeviceRegistry {
    #[debug(skip)]
    server: AdbServer,
    store: Arc<dyn DeviceStore>,
    devices: RwLock<HashMap<String, Device>>,
    updates: broadcast::Sender<Device>,
}

/// Build properties are only filled by a successful hydration.
fn is_hydrated(device: &Device) -> bool {
    !device.release_version.is_empty() || device.sdk_version != 0
}

impl DeviceRegistry {
    pub fn new(server: AdbServer, store: Arc<dyn DeviceStore>) -> Self {
        let (updates, _) = broadcast::channel(64);
        Self { server, store, devices: RwLock::new(HashMap::new()), updates }
    }

    /// Every record produced by [`DeviceRegistry::apply`]. Slow subscribers lose the oldest
    /// updates.
    pub fn subscribe(&self) -> broadcast::Receiver<Device> {
        self.updates.subscribe()
    }

    /// Current records, ordered by serial.
    pub async fn devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.read().await.values().cloned().collect();
        devices.sort_by(|a, b| a.serial().cmp(b.serial()));
        devices
    }

    pub async fn device(&self, serial: &str) -> Option<Device> {
        self.devices.read().await.get(serial).cloned()
    }

    /// Applies one watcher event and returns the updated record.
    ///
    /// A new serial is looked up on the server (a bare record with the event's state if the
    /// lookup fails). A known serial only changes state, unless it comes online without ever
    /// having been hydrated.
    #[instrument(level = "debug", skip(self), fields(serial = %event.serial, state = %event.state))]
    pub async fn apply(&self, event: &DeviceStateChangedEvent) -> Device {
        let known = self.device(&event.serial).await;
        let device = match known {
            None => {
                let mut device = match self.server.get_device(&event.serial).await {
                    Ok(device) => device.into_info(),
                    Err(e) => {
                        debug!(
                            error = &e as &dyn Error,
                            "Device lookup failed, keeping a bare record"
                        );
                        Device::new(event.serial.clone(), event.state)
                    }
                };
                device.set_state(event.state);
                info!(device = %device, state = %device.state, "New device");
                device
            }
            Some(mut device) => {
                let previous = device.state;
                device.set_state(event.state);
                if event.state == DeviceState::Online
                    && (previous == DeviceState::Invalid || !is_hydrated(&device))
                {
                    debug!(%previous, "Device came online, hydrating");
                    let mut bound = self.server.device(device);
                    bound.hydrate().await;
                    device = bound.into_info();
                }
                if previous != event.state {
                    info!(
                        device = %device,
                        %previous,
                        state = %device.state,
                        "Device state changed"
                    );
                }
                device
            }
        };

        self.devices.write().await.insert(device.serial().to_string(), device.clone());
        if let Err(e) = self.store.save(&device).await {
            warn!(error = e.as_ref() as &dyn Error, "Failed to save device");
        }
        // no subscribers is fine
        let _ = self.updates.send(device.clone());
        device
    }

    /// Forgets `serial` here and in the store.
    #[instrument(level = "debug", skip(self))]
    pub async fn remove(&self, serial: &str) -> Option<Device> {
        let removed = self.devices.write().await.remove(serial);
        if let Err(e) = self.store.delete(serial).await {
            warn!(error = e.as_ref() as &dyn Error, "Failed to delete device from store");
        }
        removed
    }

    /// Applies events until the watcher stops, then stops it for good.
    pub async fn run(&self, mut watcher: DeviceWatcher) {
        while let Some(event) = watcher.recv().await {
            self.apply(&event).await;
        }
        watcher.stop().await;
        let count = self.devices.read().await.len();
        debug!(devices = count, "Device registry stopped");
    }
}
