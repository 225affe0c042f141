use std::fmt;

use lazy_regex::{Lazy, Regex, lazy_regex};
use serde::{Deserialize, Serialize};
use time::{
    Date, Month, OffsetDateTime, PrimitiveDateTime, Time, format_description::BorrowedFormatItem,
    macros::format_description,
};

use crate::error::{BridgeError, Result};

/// `MM-DD HH:MM:SS.mmm PID TID P TAG: MESSAGE` as printed by `logcat -v threadtime`.
static THREADTIME_REGEX: Lazy<Regex> = lazy_regex!(
    r"^\s*(\d+)-(\d+)\s+(\d+):(\d+):(\d+)\.(\d+)\s+(\d+)\s+(\d+)\s+([VDIWEF])\s+(.*?)\s*:\s?(.*)$"
);

const DISPLAY_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]");

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogPriority {
    Verbose,
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl LogPriority {
    pub fn from_letter(letter: char) -> Option<Self> {
        Some(match letter {
            'V' => LogPriority::Verbose,
            'D' => LogPriority::Debug,
            'I' => LogPriority::Info,
            'W' => LogPriority::Warning,
            'E' => LogPriority::Error,
            'F' => LogPriority::Fatal,
            _ => return None,
        })
    }

    pub fn letter(self) -> char {
        match self {
            LogPriority::Verbose => 'V',
            LogPriority::Debug => 'D',
            LogPriority::Info => 'I',
            LogPriority::Warning => 'W',
            LogPriority::Error => 'E',
            LogPriority::Fatal => 'F',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: PrimitiveDateTime,
    pub priority: LogPriority,
    pub tag: String,
    pub process_id: u32,
    pub thread_id: u32,
    pub message: String,
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let timestamp = self.timestamp.format(DISPLAY_FORMAT).map_err(|_| fmt::Error)?;
        write!(
            f,
            "{timestamp} {:>5} {:>5} {} {}: {}",
            self.process_id,
            self.thread_id,
            self.priority.letter(),
            self.tag,
            self.message
        )
    }
}

/// Parses threadtime lines into [`LogRecord`]s.
///
/// Logcat lines carry no year. By default the current local year is used; set a reference
/// year to get reproducible timestamps (tests, replaying old captures).
#[derive(Debug, Clone, Copy, Default)]
pub struct LogParser {
    reference_year: Option<i32>,
}

impl LogParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reference_year(year: i32) -> Self {
        Self { reference_year: Some(year) }
    }

    fn year(&self) -> i32 {
        self.reference_year.unwrap_or_else(|| {
            OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc()).year()
        })
    }

    /// Parses a single line. Fails only when the line does not have the threadtime shape;
    /// out-of-range numbers degrade to zero and impossible dates to the nearest valid one.
    pub fn parse_line(&self, raw: &str) -> Result<LogRecord> {
        let caps = THREADTIME_REGEX
            .captures(raw.trim_end_matches(['\r', '\n']))
            .ok_or_else(|| BridgeError::parse("logcat line", raw))?;
        let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok()).unwrap_or(0);

        let priority = caps
            .get(9)
            .and_then(|m| m.as_str().chars().next())
            .and_then(LogPriority::from_letter)
            .ok_or_else(|| BridgeError::parse("logcat priority", raw))?;

        Ok(LogRecord {
            timestamp: build_timestamp(
                self.year(),
                num(1),
                num(2),
                num(3),
                num(4),
                num(5),
                num(6),
            ),
            priority,
            tag: caps.get(10).map(|m| m.as_str().trim().to_string()).unwrap_or_default(),
            process_id: num(7),
            thread_id: num(8),
            message: caps.get(11).map(|m| m.as_str().to_string()).unwrap_or_default(),
        })
    }
}

/// Parses a threadtime line using the current year.
pub fn parse_line(raw: &str) -> Result<LogRecord> {
    LogParser::new().parse_line(raw)
}

fn build_timestamp(
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
    millis: u32,
) -> PrimitiveDateTime {
    let month = u8::try_from(month)
        .ok()
        .and_then(|m| Month::try_from(m).ok())
        .unwrap_or(Month::January);
    let date = u8::try_from(day)
        .ok()
        .and_then(|d| Date::from_calendar_date(year, month, d).ok())
        .or_else(|| Date::from_calendar_date(year, month, 1).ok())
        .unwrap_or(Date::MIN);

    let (hour, minute, second) = (
        u8::try_from(hour).unwrap_or(u8::MAX),
        u8::try_from(minute).unwrap_or(u8::MAX),
        u8::try_from(second).unwrap_or(u8::MAX),
    );
    let time = u16::try_from(millis)
        .ok()
        .and_then(|ms| Time::from_hms_milli(hour, minute, second, ms).ok())
        .or_else(|| Time::from_hms(hour, minute, second).ok())
        .unwrap_or(Time::MIDNIGHT);

    PrimitiveDateTime::new(date, time)
}
