use tracing::instrument;

use super::AdbDevice;
use crate::{
    error::{BridgeError, Result},
    models::{InputCommand, InputSource},
};

impl AdbDevice {
    /// Injects one input event through the `input` tool.
    #[instrument(
        level = "debug",
        skip(self, command),
        fields(serial = %self.serial(), command = command.name()),
        err
    )]
    pub async fn send_input(&self, source: InputSource, command: &InputCommand) -> Result<()> {
        let args = command.to_shell_args(source);
        let output = self.run_command("input", &args).await?;
        let output = String::from_utf8_lossy(&output);
        // `input` exits quietly on success and prints usage or a stack trace otherwise
        if output.contains("Error") || output.contains("Exception") || output.contains("Usage:") {
            return Err(BridgeError::CommandFailed {
                command: format!("input {}", args.join(" ")),
                output: output.trim().to_string(),
            });
        }
        Ok(())
    }
}
