use std::{error::Error, future::Future};

use derive_more::Debug;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::{
    adb::{AdbServer, connection::Connection},
    error::{BridgeError, Result},
    models::{Device, DeviceState, DisplayParams},
};

mod input;
pub mod logcat;
pub mod media;
pub mod package;
pub mod shell;
pub mod transfer;

pub use logcat::{LogcatOptions, LogcatStream, watch_records};
pub use media::{ScreenRecordOptions, ScreenshotOptions};
pub use package::InstallOptions;
pub use shell::{ShellStream, parse_key_value};
pub use transfer::TransferOptions;

/// A device record bound to the server it was discovered on.
///
/// The record is a snapshot; [`AdbDevice::refresh`] re-reads it and watcher events update the
/// state through [`AdbDevice::set_state`].
#[derive(Debug, Clone)]
pub struct AdbDevice {
    #[debug(skip)]
    server: AdbServer,
    info: Device,
}

impl AdbDevice {
    pub(crate) fn new(server: AdbServer, info: Device) -> Self {
        Self { server, info }
    }

    pub fn serial(&self) -> &str {
        self.info.serial()
    }

    pub fn info(&self) -> &Device {
        &self.info
    }

    pub fn into_info(self) -> Device {
        self.info
    }

    pub fn state(&self) -> DeviceState {
        self.info.state
    }

    pub fn set_state(&mut self, state: DeviceState) {
        self.info.set_state(state);
    }

    pub(crate) fn server(&self) -> &AdbServer {
        &self.server
    }

    /// Opens a connection already switched to this device's transport.
    pub(crate) async fn connect(&self) -> Result<Connection> {
        let mut conn = self.server.connect().await?;
        conn.execute(&format!("host:transport:{}", self.serial())).await?;
        Ok(conn)
    }

    /// Re-reads the state from the server and re-hydrates if the device is online.
    #[instrument(level = "debug", skip(self), fields(serial = %self.serial()), err)]
    pub async fn refresh(&mut self) -> Result<()> {
        let brief = self
            .server
            .list_devices()
            .await?
            .into_iter()
            .find(|d| d.serial == self.serial())
            .ok_or_else(|| BridgeError::NotFound(format!("device '{}'", self.serial())))?;
        self.info.state = brief.state;
        if self.info.model.is_empty() {
            let fresh = Device::from_brief(&brief);
            self.info.model = fresh.model;
            self.info.product = fresh.product;
            self.info.device_info = fresh.device_info;
            self.info.usb = fresh.usb;
        }
        if self.info.is_online() {
            self.hydrate().await;
        }
        Ok(())
    }

    /// Fills build properties and display parameters. Each query is bounded by the property
    /// timeout and degrades to an empty value on failure.
    #[instrument(level = "debug", skip(self), fields(serial = %self.serial()))]
    pub(crate) async fn hydrate(&mut self) {
        let (release, sdk, abi, egl, size, density) = tokio::join!(
            self.bounded("ro.build.version.release", self.get_prop("ro.build.version.release")),
            self.bounded("ro.build.version.sdk", self.get_prop("ro.build.version.sdk")),
            self.bounded("ro.product.cpu.abi", self.get_prop("ro.product.cpu.abi")),
            self.bounded("ro.hardware.egl", self.get_prop("ro.hardware.egl")),
            self.bounded("wm size", self.shell("wm size")),
            self.bounded("wm density", self.shell("wm density")),
        );

        self.info.release_version = release;
        self.info.sdk_version = sdk.trim().parse().unwrap_or(0);
        self.info.abi = abi;
        self.info.egl_version = egl;
        let (width, height) = shell::parse_display_size(&size).unwrap_or_default();
        self.info.display =
            DisplayParams {
                width,
                height,
                density_dpi: shell::parse_density(&density).unwrap_or(0),
            };
        debug!(device = ?self.info, "Hydrated device");
    }

    async fn bounded(&self, what: &str, query: impl Future<Output = Result<String>>) -> String {
        match timeout(self.server.property_timeout, query).await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                warn!(error = &e as &dyn Error, what, "Device query failed");
                String::new()
            }
            Err(_) => {
                warn!(what, "Device query timed out");
                String::new()
            }
        }
    }
}
