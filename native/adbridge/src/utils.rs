use std::{
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use humansize::{DECIMAL, format_size};
use tracing::{debug, instrument};

use crate::error::{BridgeError, Result};

/// Resolves the binary to run: `custom` if given (a path or a name on PATH), otherwise
/// `name` looked up on PATH.
#[instrument(level = "debug", ret, err)]
pub fn resolve_binary_path(custom: Option<&str>, name: &str) -> Result<PathBuf> {
    let candidate = custom.unwrap_or(name);
    if Path::new(candidate).is_file() {
        return Ok(PathBuf::from(candidate));
    }
    which::which(candidate).map_err(|e| {
        debug!(candidate, error = %e, "Binary lookup failed");
        BridgeError::ServerStart(format!("'{candidate}' not found: {e}"))
    })
}

/// Seconds since the Unix epoch, truncated to the 32 bits the sync protocol carries.
pub fn unix_mtime_now() -> u32 {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    (secs & 0xFFFF_FFFF) as u32
}

/// Human-readable byte count for log fields.
pub fn display_size(bytes: u64) -> String {
    format_size(bytes, DECIMAL)
}
