use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a device as seen by the bridge server.
///
/// `Invalid` doubles as "not hydrated yet" and as the catch-all for state names the server
/// reports that we don't know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    #[default]
    Invalid,
    Unauthorized,
    Disconnected,
    Offline,
    Online,
}

impl DeviceState {
    /// Maps a state name as reported by `host:devices` / `host:track-devices`.
    pub fn from_server_name(name: &str) -> Self {
        match name {
            "device" => DeviceState::Online,
            "offline" => DeviceState::Offline,
            "unauthorized" => DeviceState::Unauthorized,
            "disconnected" => DeviceState::Disconnected,
            _ => DeviceState::Invalid,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceState::Invalid => "invalid",
            DeviceState::Unauthorized => "unauthorized",
            DeviceState::Disconnected => "disconnected",
            DeviceState::Offline => "offline",
            DeviceState::Online => "online",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DisplayParams {
    pub width: u32,
    pub height: u32,
    pub density_dpi: u32,
}

/// One line of a `host:devices-l` listing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceBrief {
    pub serial: String,
    pub state: DeviceState,
    pub product: String,
    pub model: String,
    pub device: String,
    pub usb: String,
    pub transport_id: Option<u32>,
}

impl DeviceBrief {
    /// Parses `serial  state key:value key:value ...`. Unknown keys are ignored.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let serial = parts.next()?;
        let state = parts.next()?;
        let mut brief = DeviceBrief {
            serial: serial.to_string(),
            state: DeviceState::from_server_name(state),
            ..Default::default()
        };
        for pair in parts {
            let Some((key, value)) = pair.split_once(':') else { continue };
            match key {
                "product" => brief.product = value.to_string(),
                "model" => brief.model = value.to_string(),
                "device" => brief.device = value.to_string(),
                "usb" => brief.usb = value.to_string(),
                "transport_id" => brief.transport_id = value.parse().ok(),
                _ => {}
            }
        }
        Some(brief)
    }
}

/// Everything known about one attached device.
///
/// Descriptive fields are filled once on the first successful hydration; `display` and the
/// build properties are only meaningful while the device is [`DeviceState::Online`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Device {
    serial: String,
    pub state: DeviceState,
    pub model: String,
    pub product: String,
    pub device_info: String,
    pub usb: String,
    pub display: DisplayParams,
    pub sdk_version: u32,
    pub release_version: String,
    pub abi: String,
    pub egl_version: String,
}

impl Device {
    pub fn new(serial: impl Into<String>, state: DeviceState) -> Self {
        Self { serial: serial.into(), state, ..Default::default() }
    }

    pub fn from_brief(brief: &DeviceBrief) -> Self {
        Self {
            serial: brief.serial.clone(),
            state: brief.state,
            model: brief.model.clone(),
            product: brief.product.clone(),
            device_info: brief.device.clone(),
            usb: brief.usb.clone(),
            ..Default::default()
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn is_online(&self) -> bool {
        self.state == DeviceState::Online
    }

    pub fn set_state(&mut self, state: DeviceState) {
        self.state = state;
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.serial, self.model)
    }
}

/// A state transition reported by the device watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStateChangedEvent {
    pub serial: String,
    pub state: DeviceState,
}

impl DeviceStateChangedEvent {
    pub fn new(serial: impl Into<String>, state: DeviceState) -> Self {
        Self { serial: serial.into(), state }
    }
}
