use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::worker::events::{ExecutionEvent, HostOutcome};

static ERROR_MARKERS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\bfatal\b|\bfailed!|\bunreachable!|^error!|\berror:|\btraceback\b)")
        .expect("valid regex")
});
static WARNING_MARKERS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\[deprecation warning\]|\[warning\]|\bdeprecated\b|^changed:)")
        .expect("valid regex")
});
static DEBUG_MARKERS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(<[^>]+>|META:|Using .+ as config file|ESTABLISH|EXEC )").expect("valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARNING"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// 0-based, gapless per job
    pub line_number: u64,
    pub content: String,
    pub level: LogLevel,
    pub timestamp: DateTime<Utc>,
}

/// Severity of a typed event. Structural events are matched exhaustively;
/// only free-form output falls back to text patterns.
pub fn classify_event(event: &ExecutionEvent, verbose: bool) -> LogLevel {
    match event {
        ExecutionEvent::Fatal { .. } => LogLevel::Error,
        ExecutionEvent::HostResult { outcome, .. } => match outcome {
            HostOutcome::Failed | HostOutcome::Unreachable => LogLevel::Error,
            HostOutcome::Changed => LogLevel::Warning,
            HostOutcome::Ok => LogLevel::Info,
        },
        ExecutionEvent::Recap { hosts } => match ExecutionEvent::recap_failures(hosts) {
            (0, 0) => LogLevel::Info,
            _ => LogLevel::Error,
        },
        ExecutionEvent::PlayStart { .. } | ExecutionEvent::TaskStart { .. } => LogLevel::Info,
        ExecutionEvent::Output { line } => classify_line(line, verbose),
    }
}

/// Pattern rules for a free-form line, first match wins:
/// error markers, then warning markers, then (verbose only) debug markers,
/// otherwise INFO.
pub fn classify_line(line: &str, verbose: bool) -> LogLevel {
    let line = line.trim();
    if ERROR_MARKERS.is_match(line) {
        LogLevel::Error
    } else if WARNING_MARKERS.is_match(line) {
        LogLevel::Warning
    } else if verbose && DEBUG_MARKERS.is_match(line) {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}
