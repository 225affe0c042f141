use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::models::Settings;

/// Standard adb environment variable overriding the server port.
pub const SERVER_PORT_ENV: &str = "ANDROID_ADB_SERVER_PORT";

/// `<config dir>/adbridge/settings.json`
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("adbridge").join("settings.json"))
}

/// Loads settings from `path`, or defaults if the file doesn't exist.
/// Environment overrides are applied on top.
#[instrument(level = "debug", err)]
pub fn load_settings(path: &Path) -> Result<Settings> {
    let mut settings = if path.exists() {
        info!(path = %path.display(), "Loading settings from file");
        let content = fs_err::read_to_string(path).context("Failed to read settings file")?;
        serde_json::from_str(&content).context("Failed to parse settings file")?
    } else {
        info!(path = %path.display(), "Settings file doesn't exist, using defaults");
        Settings::default()
    };
    apply_env_overrides(&mut settings, std::env::var(SERVER_PORT_ENV).ok().as_deref());
    debug!(?settings, "Loaded settings");
    Ok(settings)
}

/// Writes `settings` as pretty JSON, creating the parent directory if needed.
#[instrument(level = "debug", skip(settings), err)]
pub fn save_settings(path: &Path, settings: &Settings) -> Result<()> {
    let json = serde_json::to_string_pretty(settings).context("Failed to serialize settings")?;
    if let Some(parent) = path.parent()
        && !parent.exists()
    {
        info!(path = %parent.display(), "Creating settings directory");
        fs_err::create_dir_all(parent).context("Failed to create settings directory")?;
    }
    fs_err::write(path, json).context("Failed to write settings file")?;
    info!(path = %path.display(), "Saved settings");
    Ok(())
}

fn apply_env_overrides(settings: &mut Settings, port: Option<&str>) {
    let Some(port) = port else { return };
    match port.trim().parse::<u16>() {
        Ok(port) => {
            debug!(port, "Using server port from {SERVER_PORT_ENV}");
            settings.server_port = port;
        }
        Err(_) => warn!(value = port, "Ignoring invalid {SERVER_PORT_ENV}"),
    }
}
