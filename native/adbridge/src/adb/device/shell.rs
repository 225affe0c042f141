use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::io::{AsyncRead, ReadBuf};
use tracing::{debug, instrument, trace};

use super::AdbDevice;
use crate::{
    adb::connection::Connection,
    error::{BridgeError, Result},
};

/// Joins a command and its arguments with single spaces. No quoting is applied; arguments
/// containing shell metacharacters are the caller's business.
pub fn build_command_line<S: AsRef<str>>(command: &str, args: &[S]) -> String {
    std::iter::once(command)
        .chain(args.iter().map(AsRef::as_ref))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Splits `key: value` output lines. The value is the segment after the last colon, trimmed;
/// a line without a colon is all value.
pub fn parse_key_value(line: &str) -> Option<(&str, &str)> {
    let Some((key, _)) = line.split_once(':') else {
        return Some(("", line.trim()));
    };
    let (_, value) = line.rsplit_once(':')?;
    Some((key.trim(), value.trim()))
}

/// Value of `getprop` output, which is either the bare value or a `[key]: [value]` line.
/// Colons inside the value are kept.
pub(crate) fn parse_prop_output(output: &str) -> &str {
    let output = output.trim();
    match output.strip_prefix('[').and_then(|rest| rest.split_once("]:")) {
        Some((_, value)) => {
            let value = value.trim();
            value.strip_prefix('[').and_then(|v| v.strip_suffix(']')).unwrap_or(value)
        }
        None => output,
    }
}

/// `Physical size: 1080x2400` -> `(1080, 2400)`
pub(crate) fn parse_display_size(output: &str) -> Option<(u32, u32)> {
    let (_, value) = output.lines().find_map(parse_key_value)?;
    let (width, height) = value.split_once('x')?;
    Some((width.trim().parse().ok()?, height.trim().parse().ok()?))
}

/// `Physical density: 420` -> `420`
pub(crate) fn parse_density(output: &str) -> Option<u32> {
    let (_, value) = output.lines().find_map(parse_key_value)?;
    value.parse().ok()
}

/// Live output of a long-running shell command.
///
/// Reads see the command's stdout as it is produced and return EOF once the command exits or
/// the stream is closed.
#[derive(Debug)]
pub struct ShellStream {
    command: String,
    conn: Connection,
}

impl ShellStream {
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Stops reading and drops the socket. Safe to call more than once.
    pub fn close(&mut self) {
        if !self.conn.is_closed() {
            debug!(command = %self.command, "Closing shell stream");
        }
        self.conn.close();
    }
}

impl AsyncRead for ShellStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.conn).poll_read(cx, buf)
    }
}

impl AdbDevice {
    async fn open_service(&self, service: &str) -> Result<Connection> {
        let mut conn = self.connect().await?;
        conn.execute(service).await?;
        Ok(conn)
    }

    /// Runs `command args...` and returns everything it printed.
    #[instrument(level = "debug", skip(self, args), fields(serial = %self.serial()), err)]
    pub async fn run_command<S: AsRef<str>>(&self, command: &str, args: &[S]) -> Result<Vec<u8>> {
        let line = build_command_line(command, args);
        let mut conn = self.open_service(&format!("shell:{line}")).await?;
        let output = conn.read_all().await;
        conn.close();
        let output = output?;
        trace!(command = %line, bytes = output.len(), "Shell command finished");
        Ok(output)
    }

    /// Runs a full command line and returns its output as (lossy) UTF-8.
    pub async fn shell(&self, command_line: &str) -> Result<String> {
        let output = self.run_command::<&str>(command_line, &[]).await?;
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    /// Runs through the `exec:` service, which bypasses the pty and keeps binary output intact.
    #[instrument(level = "debug", skip(self), fields(serial = %self.serial()), err)]
    pub async fn exec_out(&self, command_line: &str) -> Result<Vec<u8>> {
        let mut conn = self.open_service(&format!("exec:{command_line}")).await?;
        let output = conn.read_all().await;
        conn.close();
        output
    }

    /// Starts `command_line` and hands back its output as a stream.
    #[instrument(level = "debug", skip(self), fields(serial = %self.serial()), err)]
    pub async fn open_stream(&self, command_line: &str) -> Result<ShellStream> {
        let conn = self.open_service(&format!("shell:{command_line}")).await?;
        Ok(ShellStream { command: command_line.to_string(), conn })
    }

    /// Same as [`AdbDevice::open_stream`] over the `exec:` service.
    pub async fn open_exec_stream(&self, command_line: &str) -> Result<ShellStream> {
        let conn = self.open_service(&format!("exec:{command_line}")).await?;
        Ok(ShellStream { command: command_line.to_string(), conn })
    }

    /// Value of a system property, empty if unset.
    pub async fn get_prop(&self, key: &str) -> Result<String> {
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(BridgeError::InvalidArgument(format!("invalid property name {key:?}")));
        }
        let output = self.shell(&format!("getprop {key}")).await?;
        Ok(parse_prop_output(&output).to_string())
    }

    /// Deletes a remote file; a missing file is not an error.
    #[instrument(level = "debug", skip(self), fields(serial = %self.serial()), err)]
    pub async fn remove_file(&self, path: &str) -> Result<()> {
        let output = self.run_command("rm", &["-f", path]).await?;
        let output = String::from_utf8_lossy(&output);
        if !output.trim().is_empty() {
            return Err(BridgeError::CommandFailed {
                command: format!("rm -f {path}"),
                output: output.trim().to_string(),
            });
        }
        Ok(())
    }
}
