//! Output sink for the engine process
//!
//! Every stdout/stderr line of the engine passes through a [`LogWriter`]. It
//! keeps the last line for diagnostics, forwards the line into `tracing` at the
//! engine's own level, and dumps recent output to a crash report when a line
//! looks like a crash.

use chrono::Local;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Lines kept for crash reports
const RECENT_LINES: usize = 100;

const CRASH_MARKERS: [&str; 4] = ["panic", "fatal error", "stack trace", "exception"];

/// Level tag the engine prefixes its own log lines with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineLevel {
    Debug,
    Info,
    Warning,
    Error,
}

struct WriterState {
    last_line: String,
    recent: VecDeque<String>,
}

pub struct LogWriter {
    crash_dir: PathBuf,
    state: Mutex<WriterState>,
}

impl LogWriter {
    /// Create a writer that places crash reports in `crash_dir`
    pub fn new(crash_dir: impl Into<PathBuf>) -> Self {
        Self {
            crash_dir: crash_dir.into(),
            state: Mutex::new(WriterState {
                last_line: String::new(),
                recent: VecDeque::with_capacity(RECENT_LINES),
            }),
        }
    }

    /// Record one line of engine output.
    ///
    /// Returns the crash report path when the line carried a crash marker and
    /// the report was written.
    pub fn write_line(&self, line: &str) -> Option<PathBuf> {
        let line = line.trim_end();
        if line.is_empty() {
            return None;
        }

        let snapshot = {
            let mut state = self.state.lock();
            state.last_line = line.to_string();
            if state.recent.len() == RECENT_LINES {
                state.recent.pop_front();
            }
            state.recent.push_back(line.to_string());

            is_crash_marker(line).then(|| state.recent.iter().cloned().collect::<Vec<_>>())
        };

        forward(line);

        let lines = snapshot?;
        match write_crash_report(&self.crash_dir, &lines) {
            Ok(path) => {
                error!(path = %path.display(), "Engine crash detected, report written");
                Some(path)
            }
            Err(e) => {
                error!(error = %e, "Engine crash detected, failed to write crash report");
                None
            }
        }
    }

    pub fn last_line(&self) -> String {
        self.state.lock().last_line.clone()
    }

    pub fn recent_lines(&self) -> Vec<String> {
        self.state.lock().recent.iter().cloned().collect()
    }
}

/// Case-insensitive crash marker match
pub fn is_crash_marker(line: &str) -> bool {
    let lower = line.to_lowercase();
    CRASH_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Split `2024/01/15 12:00:00.000000 [Warning] message` into level and message
pub fn parse_level(line: &str) -> Option<(EngineLevel, &str)> {
    let open = line.find('[')?;
    let close = open + line[open..].find(']')?;
    let level = match &line[open + 1..close] {
        "Debug" => EngineLevel::Debug,
        "Info" => EngineLevel::Info,
        "Warning" => EngineLevel::Warning,
        "Error" => EngineLevel::Error,
        _ => return None,
    };
    Some((level, line[close + 1..].trim()))
}

fn forward(line: &str) {
    if line.contains("tls handshake error") || line.contains("TLS handshake error") {
        debug!(target: "engine", "{}", line);
        return;
    }

    match parse_level(line) {
        Some((EngineLevel::Debug, msg)) => debug!(target: "engine", "{}", msg),
        Some((EngineLevel::Info, msg)) => info!(target: "engine", "{}", msg),
        Some((EngineLevel::Warning, msg)) => warn!(target: "engine", "{}", msg),
        Some((EngineLevel::Error, msg)) => error!(target: "engine", "{}", msg),
        None => info!(target: "engine", "{}", line),
    }
}

fn write_crash_report(dir: &Path, lines: &[String]) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let name = format!("core_crash_{}.log", Local::now().format("%Y%m%d_%H%M%S"));
    let path = dir.join(name);
    let mut body = lines.join("\n");
    body.push('\n');
    std::fs::write(&path, body)?;
    Ok(path)
}
