use std::{error::Error, sync::Arc, time::Duration};

use derive_more::Debug;
use tokio::{process::Command, sync::Mutex, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    adb::{
        connection::{Connection, Dialer, TcpDialer},
        device::AdbDevice,
        watcher::DeviceWatcher,
    },
    error::{BridgeError, Result},
    models::{Device, DeviceBrief, DeviceState, Settings},
    utils::resolve_binary_path,
};

pub mod connection;
pub mod device;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testing;

/// Client for one bridge server.
///
/// Cheap to clone; clones share the dialer and the start-server lock. Every request opens its
/// own connection.
#[derive(Debug, Clone)]
pub struct AdbServer {
    address: String,
    port: u16,
    dialer: Arc<dyn Dialer>,
    adb_path: Option<String>,
    start_timeout: Duration,
    pub(crate) property_timeout: Duration,
    pub(crate) chunk_size: usize,
    pub(crate) install_dir: String,
    event_buffer: usize,
    #[debug(skip)]
    start_lock: Arc<Mutex<()>>,
}

impl AdbServer {
    pub fn new(settings: &Settings) -> Self {
        Self::with_dialer(settings, Arc::new(TcpDialer))
    }

    /// Same as [`AdbServer::new`] but with a custom way of opening connections.
    pub fn with_dialer(settings: &Settings, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            address: settings.server_address(),
            port: settings.server_port,
            dialer,
            adb_path: settings.adb_path().map(str::to_string),
            start_timeout: settings.server_start_timeout(),
            property_timeout: settings.property_timeout(),
            chunk_size: settings.transfer_chunk_size,
            install_dir: settings.install_dir.clone(),
            event_buffer: settings.event_buffer.max(1),
            start_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub(crate) async fn connect(&self) -> Result<Connection> {
        self.dialer.dial(&self.address).await
    }

    /// Runs a host request whose answer is a single length-prefixed message.
    async fn host_query(&self, request: &str) -> Result<Vec<u8>> {
        let mut conn = self.connect().await?;
        conn.execute(request).await?;
        let payload = conn.read_length_prefixed().await;
        conn.close();
        payload
    }

    /// Protocol version reported by the running server.
    #[instrument(level = "debug", skip(self), ret, err)]
    pub async fn server_version(&self) -> Result<u32> {
        let payload = self.host_query("host:version").await?;
        let text = String::from_utf8_lossy(&payload);
        u32::from_str_radix(text.trim(), 16).map_err(|_| BridgeError::parse("server version", text))
    }

    /// Checks if the server is reachable
    #[instrument(level = "debug", skip(self), ret)]
    pub async fn is_running(&self) -> bool {
        match timeout(Duration::from_millis(1000), self.server_version()).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(error = &e as &dyn Error, "Server not reachable");
                false
            }
            Err(_) => {
                debug!("Timed out while checking server status (likely not running)");
                false
            }
        }
    }

    /// Starts the server through the `adb` binary unless it is already running.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn ensure_running(&self) -> Result<()> {
        let _guard = self.start_lock.lock().await;
        if self.is_running().await {
            return Ok(());
        }
        info!("Bridge server not running, attempting to start it");
        let adb_path = resolve_binary_path(self.adb_path.as_deref(), "adb")?;
        info!(path = %adb_path.display(), port = self.port, "Found adb binary, starting server");

        let output = match timeout(self.start_timeout, {
            let mut command = Command::new(&adb_path);
            command.arg("-P").arg(self.port.to_string()).arg("start-server");
            #[cfg(target_os = "windows")]
            // CREATE_NO_WINDOW
            command.creation_flags(0x08000000);
            command.output()
        })
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                error!(error = &e as &dyn Error, "Failed to run adb start-server");
                return Err(BridgeError::ServerStart(e.to_string()));
            }
            Err(_) => {
                return Err(BridgeError::ServerStart("timed out while starting server".into()));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(BridgeError::ServerStart(stderr));
        }
        if !self.is_running().await {
            return Err(BridgeError::ServerStart(format!(
                "server still unreachable at {}",
                self.address
            )));
        }
        info!("Bridge server started");
        Ok(())
    }

    /// Makes sure the server runs, then starts watching device state changes until `cancel`
    /// fires or the watcher is stopped.
    #[instrument(level = "debug", skip(self, cancel), err)]
    pub async fn start(&self, cancel: CancellationToken) -> Result<DeviceWatcher> {
        self.ensure_running().await?;
        DeviceWatcher::spawn(self.clone(), self.event_buffer, cancel).await
    }

    /// Asks the server to exit. Failures are logged and otherwise ignored.
    #[instrument(level = "debug", skip(self))]
    pub async fn stop(&self) {
        info!("Killing bridge server");
        let result: Result<()> = async {
            let mut conn = self.connect().await?;
            conn.execute("host:kill").await
        }
        .await;
        if let Err(e) = result {
            warn!(error = &e as &dyn Error, "Failed to kill bridge server");
        }
    }

    #[instrument(level = "debug", skip(self), err)]
    pub async fn list_devices(&self) -> Result<Vec<DeviceBrief>> {
        let payload = self.host_query("host:devices-l").await?;
        let devices: Vec<DeviceBrief> =
            String::from_utf8_lossy(&payload).lines().filter_map(DeviceBrief::parse).collect();
        debug!(count = devices.len(), "Listed devices");
        Ok(devices)
    }

    /// Looks up `serial` and, when it is online, checks its transport and hydrates its
    /// properties.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn get_device(&self, serial: &str) -> Result<AdbDevice> {
        let brief = self
            .list_devices()
            .await?
            .into_iter()
            .find(|d| d.serial == serial)
            .ok_or_else(|| BridgeError::NotFound(format!("device '{serial}'")))?;
        let mut device = self.device(Device::from_brief(&brief));
        if device.info().is_online() {
            device.connect().await?.close();
            device.hydrate().await;
        }
        Ok(device)
    }

    /// First online device in listing order.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn get_any_online_device(&self) -> Result<AdbDevice> {
        let brief = self
            .list_devices()
            .await?
            .into_iter()
            .find(|d| d.state == DeviceState::Online)
            .ok_or_else(|| BridgeError::NotFound("no online device".into()))?;
        let mut device = self.device(Device::from_brief(&brief));
        device.connect().await?.close();
        device.hydrate().await;
        Ok(device)
    }

    /// Wraps an already known record without touching the server.
    pub fn device(&self, info: Device) -> AdbDevice {
        AdbDevice::new(self.clone(), info)
    }
}

#[cfg(test)]
mod tests {
    use super::{testing::*, *};
    use crate::error::ErrorKind;

    fn pixel_state() -> FakeState {
        FakeState::default()
            .with_device("EMU01 offline transport_id:1")
            .with_device(
                "PIXEL7 device usb:3-2 product:panther model:Pixel_7 device:panther transport_id:2",
            )
            .with_shell("shell:getprop ro.build.version.release", "14\n")
            .with_shell("shell:getprop ro.build.version.sdk", "34\n")
            .with_shell("shell:getprop ro.product.cpu.abi", "arm64-v8a\n")
            .with_shell("shell:getprop ro.hardware.egl", "mali\n")
            .with_shell("shell:wm size", "Physical size: 1080x2400\n")
            .with_shell("shell:wm density", "Physical density: 420\n")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reports_server_version() {
        let fake = FakeServer::start(FakeState { version: 0x29, ..Default::default() }).await;
        let server = fake.server();
        assert_eq!(server.server_version().await.unwrap(), 41);
        assert!(server.is_running().await);
        server.ensure_running().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreachable_server_without_binary_fails_to_start() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let settings = Settings {
            server_port: port,
            adb_path: "/nonexistent/adb".into(),
            ..Default::default()
        };
        let server = AdbServer::new(&settings);
        assert!(!server.is_running().await);
        let err = server.start(CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Server);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lists_devices_in_server_order() {
        let fake = FakeServer::start(pixel_state()).await;
        let devices = fake.server().list_devices().await.unwrap();
        let serials: Vec<_> = devices.iter().map(|d| d.serial.as_str()).collect();
        assert_eq!(serials, ["EMU01", "PIXEL7"]);
        assert_eq!(devices[1].model, "Pixel_7");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn get_device_hydrates_online_device() {
        let fake = FakeServer::start(pixel_state()).await;
        let device = fake.server().get_device("PIXEL7").await.unwrap();
        let info = device.info();
        assert_eq!(info.state, DeviceState::Online);
        assert_eq!(info.model, "Pixel_7");
        assert_eq!(info.product, "panther");
        assert_eq!(info.usb, "3-2");
        assert_eq!(info.release_version, "14");
        assert_eq!(info.sdk_version, 34);
        assert_eq!(info.abi, "arm64-v8a");
        assert_eq!(info.egl_version, "mali");
        let display = &info.display;
        assert_eq!((display.width, display.height, display.density_dpi), (1080, 2400, 420));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn online_device_without_transport_is_rejected() {
        let mut state = pixel_state();
        state.unreachable.insert("PIXEL7".into());
        let fake = FakeServer::start(state).await;
        let err = fake.server().get_device("PIXEL7").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Rejected);
        assert_eq!(err.diagnostic(), Some("device offline"));
        assert!(!fake.requests().iter().any(|r| r.starts_with("shell:getprop")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_device_is_not_hydrated() {
        let fake = FakeServer::start(pixel_state()).await;
        let device = fake.server().get_device("EMU01").await.unwrap();
        assert_eq!(device.state(), DeviceState::Offline);
        assert_eq!(device.info().sdk_version, 0);
        assert!(!fake.requests().iter().any(|r| r.starts_with("host:transport:EMU01")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_serial_is_not_found() {
        let fake = FakeServer::start(pixel_state()).await;
        let err = fake.server().get_device("NOPE").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn any_online_device() {
        let fake = FakeServer::start(pixel_state()).await;
        let device = fake.server().get_any_online_device().await.unwrap();
        assert_eq!(device.serial(), "PIXEL7");
        assert!(device.info().is_online());

        let fake = FakeServer::start(
            FakeState::default()
                .with_device("EMU01 offline")
                .with_device("EMU02 unauthorized"),
        )
        .await;
        let err = fake.server().get_any_online_device().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_is_best_effort() {
        let fake = FakeServer::start(FakeState::default()).await;
        let server = fake.server();
        server.stop().await;
        assert!(fake.killed());
        drop(fake);

        // Nothing listening anymore: must not panic or error.
        server.stop().await;
    }
}
