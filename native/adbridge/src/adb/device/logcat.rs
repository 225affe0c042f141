use std::{error::Error, pin::Pin};

use futures::{Stream, stream};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::AdbDevice;
use crate::{
    error::Result,
    models::{LogParser, LogPriority, LogRecord},
};

pub type LogcatStream = Pin<Box<dyn Stream<Item = LogRecord> + Send>>;

/// Longest line kept in memory; anything longer is dropped up to its newline.
pub const MAX_LINE_LEN: u64 = 16 * 1024;

/// Filters for a logcat session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogcatOptions {
    /// Only this tag. `None` means all tags.
    pub tag: Option<String>,
    /// Only this process.
    pub pid: Option<u32>,
    /// Minimum priority.
    pub priority: LogPriority,
    /// Run `logcat -c` before streaming.
    pub clear: bool,
    /// Year stamped on records; the current year when `None`.
    pub reference_year: Option<i32>,
}

impl Default for LogcatOptions {
    fn default() -> Self {
        Self {
            tag: None,
            pid: None,
            priority: LogPriority::Verbose,
            clear: false,
            reference_year: None,
        }
    }
}

impl LogcatOptions {
    /// Arguments after `logcat -v threadtime`.
    ///
    /// The wildcard tag is quoted so the device shell doesn't glob it.
    pub fn filter_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(pid) = self.pid {
            args.push("--pid".to_string());
            args.push(pid.to_string());
        }
        args.push("-s".to_string());
        match self.tag.as_deref().filter(|t| !t.is_empty()) {
            Some(tag) if self.priority == LogPriority::Verbose => args.push(tag.to_string()),
            Some(tag) => args.push(format!("{tag}:{}", self.priority.letter())),
            None if self.priority == LogPriority::Debug => args.push("'*'".to_string()),
            None => args.push(format!("'*:{}'", self.priority.letter())),
        }
        args
    }

    pub fn command_line(&self) -> String {
        let mut line = String::from("logcat -v threadtime");
        for arg in self.filter_args() {
            line.push(' ');
            line.push_str(&arg);
        }
        line
    }

    fn parser(&self) -> LogParser {
        match self.reference_year {
            Some(year) => LogParser::with_reference_year(year),
            None => LogParser::new(),
        }
    }
}

/// Turns a byte stream of threadtime output into records.
///
/// The stream is lazy and single-pass. Lines that don't parse, or run past [`MAX_LINE_LEN`],
/// are skipped. It ends on EOF, on a read error, or when `cancel` fires; dropping it releases
/// `reader`.
pub fn watch_records<R>(reader: R, parser: LogParser, cancel: CancellationToken) -> LogcatStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let state = (BufReader::new(reader), Vec::new(), false, parser, cancel);
    Box::pin(stream::unfold(state, |state| async move {
        let (mut reader, mut line, mut skipping, parser, cancel) = state;
        loop {
            line.clear();
            let mut limited = (&mut reader).take(MAX_LINE_LEN);
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Logcat stream cancelled");
                    return None;
                }
                read = limited.read_until(b'\n', &mut line) => read,
            };
            match read {
                Ok(0) => {
                    debug!("Logcat stream reached EOF");
                    return None;
                }
                Ok(n) => {
                    let complete = line.last() == Some(&b'\n');
                    if skipping {
                        skipping = !complete;
                        continue;
                    }
                    if !complete && n as u64 == MAX_LINE_LEN {
                        warn!(limit = MAX_LINE_LEN, "Dropping oversized logcat line");
                        skipping = true;
                        continue;
                    }
                    let text = String::from_utf8_lossy(&line);
                    match parser.parse_line(&text) {
                        Ok(record) => {
                            return Some((record, (reader, line, skipping, parser, cancel)));
                        }
                        Err(e) => debug!(error = &e as &dyn Error, "Skipping logcat line"),
                    }
                }
                Err(e) => {
                    warn!(error = &e as &dyn Error, "Logcat stream read failed");
                    return None;
                }
            }
        }
    }))
}

impl AdbDevice {
    /// Clears the device log buffers.
    #[instrument(level = "debug", skip(self), fields(serial = %self.serial()), err)]
    pub async fn clear_log(&self) -> Result<()> {
        self.run_command("logcat", &["-c"]).await?;
        Ok(())
    }

    /// Streams parsed log records until `cancel` fires or the device stops sending.
    #[instrument(level = "debug", skip(self, cancel), fields(serial = %self.serial()), err)]
    pub async fn logcat(
        &self,
        options: &LogcatOptions,
        cancel: CancellationToken,
    ) -> Result<LogcatStream> {
        if options.clear {
            self.clear_log().await?;
        }
        let stream = self.open_stream(&options.command_line()).await?;
        Ok(watch_records(stream, options.parser(), cancel))
    }
}
