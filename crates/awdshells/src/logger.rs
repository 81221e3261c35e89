//! Operator-facing logger.
//!
//! Five severity sinks plus a `none` threshold. Every line is timestamped,
//! tagged, and ANSI-colored, written to stderr when it clears the display
//! threshold and unconditionally to the log file. The display threshold is
//! mutable at runtime (`log <level>` in the CLI); the file always receives
//! everything so a session transcript survives a quiet console.

use std::fmt;
use std::fs::File;
use std::io::Write as _;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::Local;

const COLOR_SUCCESS: &str = "\x1b[32m";
const COLOR_MESSAGE: &str = "\x1b[34m";
const COLOR_WARNING: &str = "\x1b[33m";
const COLOR_ERROR: &str = "\x1b[31m";
const COLOR_RESET: &str = "\x1b[0m";

/// Log severities, ordered. `Raw` passes every line; `None` silences the
/// console entirely. The file sink ignores the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Raw,
    Success,
    Message,
    Warning,
    Error,
    None,
}

impl Level {
    fn tag(self) -> &'static str {
        match self {
            Level::Raw | Level::None => "",
            Level::Success => "[SUCCESS]",
            Level::Message => "[MESSAGE]",
            Level::Warning => "[WARNING]",
            Level::Error => "[ERROR]",
        }
    }

    fn color(self) -> &'static str {
        match self {
            Level::Raw | Level::None => COLOR_RESET,
            Level::Success => COLOR_SUCCESS,
            Level::Message => COLOR_MESSAGE,
            Level::Warning => COLOR_WARNING,
            Level::Error => COLOR_ERROR,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Level::Raw => "raw",
            Level::Success => "success",
            Level::Message => "message",
            Level::Warning => "warning",
            Level::Error => "error",
            Level::None => "none",
        };
        f.write_str(name)
    }
}

impl FromStr for Level {
    type Err = InvalidLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(Level::Raw),
            "success" => Ok(Level::Success),
            "message" => Ok(Level::Message),
            "warning" => Ok(Level::Warning),
            "error" => Ok(Level::Error),
            "none" => Ok(Level::None),
            other => Err(InvalidLevel(other.to_string())),
        }
    }
}

/// Error for an unrecognized level name.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid log level '{0}': expected raw, success, message, warning, error or none")]
pub struct InvalidLevel(pub String);

struct Inner {
    file: Option<File>,
    display_level: Level,
}

/// Severity-gated sink to stderr and a log file.
pub struct Logger {
    inner: Mutex<Inner>,
}

impl Logger {
    /// Creates a logger writing to `path`. If the file cannot be created
    /// the logger degrades to stderr-only and says so once.
    pub fn new(path: impl AsRef<Path>, display_level: Level) -> Self {
        let path = path.as_ref();
        let file = match File::create(path) {
            Ok(file) => Some(file),
            Err(err) => {
                eprintln!("Failed to open log file {}: {err}", path.display());
                None
            }
        };
        Self {
            inner: Mutex::new(Inner {
                file,
                display_level,
            }),
        }
    }

    /// Whether the file sink is active.
    pub fn has_file(&self) -> bool {
        self.inner.lock().map(|g| g.file.is_some()).unwrap_or(false)
    }

    pub fn set_display_level(&self, level: Level) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.display_level = level;
        }
    }

    pub fn display_level(&self) -> Level {
        self.inner
            .lock()
            .map(|g| g.display_level)
            .unwrap_or(Level::Raw)
    }

    /// Writes one line at `level`. A trailing newline is appended; the
    /// message should not carry its own.
    pub fn log(&self, level: Level, message: impl AsRef<str>) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let line = format!(
            "{}[{timestamp}]{} {}{}\n",
            level.color(),
            level.tag(),
            message.as_ref(),
            COLOR_RESET
        );

        let Ok(mut guard) = self.inner.lock() else {
            return;
        };
        if level >= guard.display_level {
            eprint!("{line}");
        }
        if let Some(file) = guard.file.as_mut() {
            let _ = file.write_all(line.as_bytes());
        }
    }

    pub fn raw(&self, message: impl AsRef<str>) {
        self.log(Level::Raw, message);
    }

    pub fn success(&self, message: impl AsRef<str>) {
        self.log(Level::Success, message);
    }

    pub fn message(&self, message: impl AsRef<str>) {
        self.log(Level::Message, message);
    }

    pub fn warning(&self, message: impl AsRef<str>) {
        self.log(Level::Warning, message);
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.log(Level::Error, message);
    }
}

/// The conventional log file name: `awdshells-YYYYMMDDHHMMSS.log`.
pub fn default_file_name() -> String {
    format!("awdshells-{}.log", Local::now().format("%Y%m%d%H%M%S"))
}
