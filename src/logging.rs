//! JSON-line logging. Each entry is one object with `level`, `message`, an
//! optional `data` object, the merged scope `tags` and an RFC 3339 timestamp.
//! Errors go to stderr, everything else to stdout unless the logger was
//! switched to [`Logger::to_stderr`].

use std::io::{stderr, stdout, Write};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use humantime::format_rfc3339;
use serde_json::{Map, Value};

/// Environment variable holding the minimum level (`trace` .. `error`).
pub const LOG_LEVEL_ENV: &str = "ORCHESTRA_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

impl FromStr for Level {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Level::Trace),
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" | "warning" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            other => Err(anyhow!("unsupported log level: {other}")),
        }
    }
}

#[derive(Clone)]
enum Sink {
    Stdio,
    Stderr,
    Capture(Arc<Mutex<Vec<Value>>>),
}

/// Cheap to clone; clones share the sink but carry their own tags.
#[derive(Clone)]
pub struct Logger {
    threshold: Level,
    tags: Map<String, Value>,
    sink: Sink,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(Level::Info)
    }
}

impl Logger {
    pub fn new(threshold: Level) -> Self {
        Self {
            threshold,
            tags: Map::new(),
            sink: Sink::Stdio,
        }
    }

    /// Threshold from `ORCHESTRA_LOG`; unset or unreadable values mean `info`.
    pub fn from_env() -> Self {
        Self::from_env_or(Level::Info)
    }

    pub fn from_env_or(fallback: Level) -> Self {
        let threshold = std::env::var(LOG_LEVEL_ENV)
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(fallback);
        Self::new(threshold)
    }

    /// Send every entry to stderr, keeping stdout for command output.
    pub fn to_stderr(mut self) -> Self {
        if matches!(self.sink, Sink::Stdio) {
            self.sink = Sink::Stderr;
        }
        self
    }

    /// Logger that records entries in memory instead of writing them.
    pub fn capturing(threshold: Level) -> Self {
        Self {
            threshold,
            tags: Map::new(),
            sink: Sink::Capture(Arc::new(Mutex::new(Vec::new()))),
        }
    }

    pub fn captured(&self) -> Vec<Value> {
        match &self.sink {
            Sink::Capture(entries) => entries.lock().map(|e| e.clone()).unwrap_or_default(),
            Sink::Stdio | Sink::Stderr => Vec::new(),
        }
    }

    pub fn with_threshold(mut self, threshold: Level) -> Self {
        self.threshold = threshold;
        self
    }

    /// Child logger whose entries carry `key` as an extra tag.
    /// Only scalar tag values are kept.
    pub fn with_tag(&self, key: &str, value: impl Into<Value>) -> Self {
        let mut child = self.clone();
        let value = value.into();
        if matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_)) {
            child.tags.insert(key.to_string(), value);
        }
        child
    }

    pub fn enabled(&self, level: Level) -> bool {
        level >= self.threshold
    }

    pub fn log(&self, level: Level, message: &str, data: Option<Value>) {
        if !self.enabled(level) {
            return;
        }
        let mut entry = Map::new();
        entry.insert("level".to_string(), Value::String(level.as_str().to_string()));
        entry.insert("message".to_string(), Value::String(message.to_string()));
        match data {
            Some(Value::Object(map)) => {
                entry.insert("data".to_string(), Value::Object(map));
            }
            Some(Value::Null) | None => {}
            Some(other) => {
                let mut wrapped = Map::new();
                wrapped.insert("value".to_string(), other);
                entry.insert("data".to_string(), Value::Object(wrapped));
            }
        }
        if !self.tags.is_empty() {
            entry.insert("tags".to_string(), Value::Object(self.tags.clone()));
        }
        entry.insert("timestamp".to_string(), Value::String(current_timestamp()));
        self.write(level, entry);
    }

    pub fn trace(&self, message: &str, data: Option<Value>) {
        self.log(Level::Trace, message, data)
    }

    pub fn debug(&self, message: &str, data: Option<Value>) {
        self.log(Level::Debug, message, data)
    }

    pub fn info(&self, message: &str, data: Option<Value>) {
        self.log(Level::Info, message, data)
    }

    pub fn warn(&self, message: &str, data: Option<Value>) {
        self.log(Level::Warn, message, data)
    }

    pub fn error(&self, message: &str, data: Option<Value>) {
        self.log(Level::Error, message, data)
    }

    fn write(&self, level: Level, entry: Map<String, Value>) {
        match &self.sink {
            Sink::Capture(entries) => {
                if let Ok(mut entries) = entries.lock() {
                    entries.push(Value::Object(entry));
                }
            }
            Sink::Stdio | Sink::Stderr => {
                let Ok(serialized) = serde_json::to_string(&entry) else {
                    return;
                };
                if level == Level::Error || matches!(self.sink, Sink::Stderr) {
                    let _ = writeln!(stderr(), "{}", serialized);
                } else {
                    let _ = writeln!(stdout(), "{}", serialized);
                }
            }
        }
    }
}

fn current_timestamp() -> String {
    let now = std::time::SystemTime::now();
    format_rfc3339(now).to_string()
}
