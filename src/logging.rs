//! Run log sink.
//!
//! Every record is rendered as `TIME - FILE:LINE - LEVEL - MSG`, optionally
//! coloured (white/yellow/red for info/warning/error). When a report is
//! requested the sink writes to a capture file instead of stderr so the full
//! log can be attached to the end-of-run email.

use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::panic::Location;
use std::path::PathBuf;
use std::sync::Mutex;

use log::{Level, LevelFilter, Log, Metadata, Record};
use time::OffsetDateTime;

use crate::error::{Error, Result};

const RESET: &str = "\x1b[0m";

fn level_color(level: Level) -> Option<&'static str> {
    match level {
        Level::Error => Some("\x1b[31m"),
        Level::Warn => Some("\x1b[33m"),
        Level::Info => Some("\x1b[37m"),
        _ => None,
    }
}

enum Output {
    Stderr,
    Capture(File),
}

struct Sink {
    colored: bool,
    output: Mutex<Output>,
}

impl Log for Sink {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let timestamp = now_formatted();
        let file = record.file().unwrap_or("?");
        let line = record
            .line()
            .map(|line| line.to_string())
            .unwrap_or_else(|| "?".to_string());
        let base = format!(
            "{timestamp} - {file}:{line} - {level} - {args}",
            level = record.level(),
            args = record.args()
        );
        let rendered = match (self.colored, level_color(record.level())) {
            (true, Some(color)) => format!("{color}{base}{RESET}\n"),
            _ => format!("{base}\n"),
        };

        let mut output = match self.output.lock() {
            Ok(output) => output,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = match &mut *output {
            Output::Stderr => io::stderr().write_all(rendered.as_bytes()),
            Output::Capture(file) => file.write_all(rendered.as_bytes()),
        };
    }

    fn flush(&self) {
        let mut output = match self.output.lock() {
            Ok(output) => output,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = match &mut *output {
            Output::Stderr => io::stderr().flush(),
            Output::Capture(file) => file.flush(),
        };
    }
}

fn now_formatted() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02},{:03}",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
        now.millisecond()
    )
}

/// Sink configuration for one run.
pub struct Options {
    /// Render records with ANSI colour (`-C`).
    pub colored: bool,
    /// Maximum level to record.
    pub level: LevelFilter,
    /// Write records to this file instead of stderr (report capture).
    pub capture: Option<PathBuf>,
}

/// Install the process-wide sink. May only be called once per process.
pub fn init(options: Options) -> Result<()> {
    let output = match &options.capture {
        Some(path) => Output::Capture(
            File::create(path).map_err(|err| Error::io("Failed to create log file", path, err))?,
        ),
        None => Output::Stderr,
    };
    let sink = Sink {
        colored: options.colored,
        output: Mutex::new(output),
    };
    log::set_boxed_logger(Box::new(sink))
        .map_err(|err| Error::setup(format!("Failed to install logger: {err}")))?;
    log::set_max_level(options.level);
    Ok(())
}

/// Logging handle that prefixes every record with `[hostname]`.
///
/// Installed for the duration of a host's execution window; the underlying
/// sink is shared, only the prefix is per-scope. `#[track_caller]` keeps
/// FILE:LINE pointing at the stage code, not at this wrapper.
#[derive(Clone)]
pub struct HostTag(String);

impl HostTag {
    pub fn new(name: impl Into<String>) -> Self {
        HostTag(name.into())
    }

    #[track_caller]
    pub fn info(&self, message: impl fmt::Display) {
        self.emit(Level::Info, message);
    }

    #[track_caller]
    pub fn warn(&self, message: impl fmt::Display) {
        self.emit(Level::Warn, message);
    }

    #[track_caller]
    pub fn error(&self, message: impl fmt::Display) {
        self.emit(Level::Error, message);
    }

    #[track_caller]
    fn emit(&self, level: Level, message: impl fmt::Display) {
        let location = Location::caller();
        log::logger().log(
            &Record::builder()
                .args(format_args!("[{}] {}", self.0, message))
                .level(level)
                .target(module_path!())
                .file(Some(location.file()))
                .line(Some(location.line()))
                .build(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_maps_to_white_and_error_to_red() {
        assert_eq!(level_color(Level::Info), Some("\x1b[37m"));
        assert_eq!(level_color(Level::Warn), Some("\x1b[33m"));
        assert_eq!(level_color(Level::Error), Some("\x1b[31m"));
        assert_eq!(level_color(Level::Debug), None);
    }

    #[test]
    fn timestamp_has_millisecond_precision() {
        let stamp = now_formatted();
        // 2026-08-01 12:34:56,789
        assert_eq!(stamp.len(), 23);
        assert_eq!(&stamp[4..5], "-");
        assert_eq!(&stamp[19..20], ",");
    }
}
