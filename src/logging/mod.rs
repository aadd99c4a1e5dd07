use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde_json::Value;

pub const ALLOWED_LEVELS: &str = "error, warn, info, debug, verbose";

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Verbose = 5,
}

impl LogLevel {
    pub fn from_config_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "verbose" | "trace" => Some(Self::Verbose),
            _ => None,
        }
    }

    fn label(self, colored: bool) -> &'static str {
        match (self, colored) {
            (Self::Error, false) => "ERROR",
            (Self::Warn, false) => "WARN",
            (Self::Info, false) => "INFO",
            (Self::Debug, false) => "DEBUG",
            (Self::Verbose, false) => "VERBOSE",
            (Self::Error, true) => "\x1b[31mERROR\x1b[0m",
            (Self::Warn, true) => "\x1b[33mWARN\x1b[0m",
            (Self::Info, true) => "\x1b[32mINFO\x1b[0m",
            (Self::Debug, true) => "\x1b[36mDEBUG\x1b[0m",
            (Self::Verbose, true) => "\x1b[35mVERBOSE\x1b[0m",
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoggerConfig {
    pub min_level: LogLevel,
    pub human_friendly: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Info,
            human_friendly: false,
        }
    }
}

pub trait LogSink: Send + Sync {
    fn write_line(&self, line: &str);
}

#[derive(Default)]
pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn write_line(&self, line: &str) {
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{line}");
    }
}

/// Line-oriented structured logger shared by every broker component.
///
/// Lines look like `2026-01-01T00:00:00.000Z [INFO] [broker::worker] message payload={...}`.
pub struct Logger {
    config: LoggerConfig,
    sink: Arc<dyn LogSink>,
}

impl Logger {
    pub fn new(config: LoggerConfig) -> Self {
        Self::with_sink(config, Arc::new(StdoutSink))
    }

    pub fn with_sink(config: LoggerConfig, sink: Arc<dyn LogSink>) -> Self {
        Self { config, sink }
    }

    pub fn error(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Error, context, message, None);
    }

    pub fn warn(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Warn, context, message, None);
    }

    pub fn info(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Info, context, message, None);
    }

    pub fn debug(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Debug, context, message, None);
    }

    pub fn log(
        &self,
        level: LogLevel,
        context: Option<&str>,
        message: &str,
        payload: Option<Value>,
    ) {
        if !self.enabled(level) {
            return;
        }

        let line = self.format_line(level, context, message, payload.as_ref());
        self.sink.write_line(&line);
    }

    // Multi-line blocks (message dumps) are emitted as a header line plus indented body lines.
    pub fn block(&self, level: LogLevel, context: Option<&str>, title: &str, body: &str) {
        if !self.enabled(level) {
            return;
        }

        self.sink
            .write_line(&self.format_line(level, context, title, None));
        for line in body.lines() {
            self.sink.write_line(&format!("    {line}"));
        }
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level <= self.config.min_level
    }

    fn format_line(
        &self,
        level: LogLevel,
        context: Option<&str>,
        message: &str,
        payload: Option<&Value>,
    ) -> String {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let rendered_level = level.label(self.config.human_friendly);

        let context_part = match context {
            Some(ctx) if !ctx.is_empty() => format!(" [{ctx}]"),
            _ => String::new(),
        };

        let payload_part = match payload {
            Some(value) => format!(" payload={value}"),
            None => String::new(),
        };

        format!("{timestamp} [{rendered_level}]{context_part} {message}{payload_part}")
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("config", &self.config)
            .field("sink", &"<dyn LogSink>")
            .finish()
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::{Arc, Mutex};

    use super::{LogLevel, LogSink, Logger, LoggerConfig};

    #[derive(Default)]
    pub struct MemorySink {
        lines: Mutex<Vec<String>>,
    }

    impl MemorySink {
        pub fn lines(&self) -> Vec<String> {
            self.lines
                .lock()
                .expect("memory sink mutex poisoned")
                .clone()
        }

        pub fn contains(&self, needle: &str) -> bool {
            self.lines().iter().any(|line| line.contains(needle))
        }
    }

    impl LogSink for MemorySink {
        fn write_line(&self, line: &str) {
            self.lines
                .lock()
                .expect("memory sink mutex poisoned")
                .push(line.to_owned());
        }
    }

    pub fn memory_logger(min_level: LogLevel) -> (Arc<Logger>, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        let logger = Logger::with_sink(
            LoggerConfig {
                min_level,
                human_friendly: false,
            },
            sink.clone(),
        );
        (Arc::new(logger), sink)
    }
}
