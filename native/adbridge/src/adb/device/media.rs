use std::time::Duration;

use tracing::{debug, info, instrument};

use super::{AdbDevice, ShellStream};
use crate::error::{BridgeError, Result};

const PNG_SIGNATURE: &[u8; 8] = b"\x89PNG\r\n\x1a\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenshotOptions {
    /// Ask `screencap` for PNG instead of raw pixels.
    pub png: bool,
}

impl Default for ScreenshotOptions {
    fn default() -> Self {
        Self { png: true }
    }
}

/// Captured screen contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Screenshot {
    Png(Vec<u8>),
    /// Raw framebuffer dump: `pixel_format` follows Android's `PixelFormat` constants (1 is
    /// RGBA_8888).
    Raw { width: u32, height: u32, pixel_format: u32, pixels: Vec<u8> },
}

impl Screenshot {
    fn parse_raw(data: Vec<u8>) -> Result<Self> {
        let word = |i: usize| -> Option<u32> {
            data.get(i * 4..i * 4 + 4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        };
        let (Some(width), Some(height), Some(pixel_format)) = (word(0), word(1), word(2)) else {
            return Err(BridgeError::parse("screencap header", format!("{} bytes", data.len())));
        };
        let expected = width as usize * height as usize * 4;
        // Since Android 8 the header carries a fourth word (color space).
        let header = if data.len() >= 16 && data.len() - 16 == expected { 16 } else { 12 };
        Ok(Screenshot::Raw { width, height, pixel_format, pixels: data[header..].to_vec() })
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Screenshot::Png(data) => data,
            Screenshot::Raw { pixels, .. } => pixels,
        }
    }
}

/// Settings for `screenrecord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenRecordOptions {
    /// Output size; the device's native resolution when `None`.
    pub size: Option<(u32, u32)>,
    /// Upper bound of the recording. `screenrecord` itself caps this at 180 seconds.
    pub time_limit: Duration,
    /// Bits per second.
    pub bit_rate: u32,
}

impl Default for ScreenRecordOptions {
    fn default() -> Self {
        Self { size: None, time_limit: Duration::from_secs(180), bit_rate: 20_000_000 }
    }
}

impl ScreenRecordOptions {
    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["--verbose".to_string()];
        if let Some((width, height)) = self.size {
            args.push("--size".to_string());
            args.push(format!("{width}x{height}"));
        }
        if !self.time_limit.is_zero() {
            args.push("--time-limit".to_string());
            args.push(self.time_limit.as_secs().max(1).to_string());
        }
        if self.bit_rate != 0 {
            args.push("--bit-rate".to_string());
            args.push(self.bit_rate.to_string());
        }
        args
    }
}

impl AdbDevice {
    #[instrument(level = "debug", skip(self), fields(serial = %self.serial()), err)]
    pub async fn screenshot(&self, options: ScreenshotOptions) -> Result<Screenshot> {
        let command = if options.png { "screencap -p" } else { "screencap" };
        let data = self.exec_out(command).await?;
        debug!(bytes = data.len(), "Screenshot captured");
        if options.png {
            if !data.starts_with(PNG_SIGNATURE) {
                let head = String::from_utf8_lossy(&data[..data.len().min(64)]).into_owned();
                return Err(BridgeError::parse("screencap PNG", head));
            }
            return Ok(Screenshot::Png(data));
        }
        Screenshot::parse_raw(data)
    }

    /// Records the screen into `remote_path` on the device and waits for the recording to end.
    /// Returns the tool's verbose output.
    #[instrument(level = "debug", skip(self), fields(serial = %self.serial()), err)]
    pub async fn screen_record(
        &self,
        remote_path: &str,
        options: &ScreenRecordOptions,
    ) -> Result<String> {
        let mut args = options.args();
        args.push(remote_path.to_string());
        info!(remote_path, "Recording screen");
        let output = self.run_command("screenrecord", &args).await?;
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    /// Live raw H.264 stream of the screen. Close the stream to stop recording.
    #[instrument(level = "debug", skip(self), fields(serial = %self.serial()), err)]
    pub async fn screen_record_stream(&self, options: &ScreenRecordOptions) -> Result<ShellStream> {
        let mut args: Vec<String> =
            options.args().into_iter().filter(|a| a != "--verbose").collect();
        args.push("--output-format=h264".to_string());
        args.push("-".to_string());
        self.open_exec_stream(&format!("screenrecord {}", args.join(" "))).await
    }
}
