//! Leveled logging with pluggable sinks.
//!
//! Components receive a [`Logger`] handle instead of writing to a global.
//! The sink behind the handle decides where records go (stderr, a command
//! table, a test buffer), so a composition can swap the logging concern
//! without touching component code.

use std::fmt;
use std::io::Write;
use std::sync::Arc;

use owo_colors::OwoColorize;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Severity of one log record, ordered `Trace < Debug < ... < Fatal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Level {
    /// Short lowercase tag, as printed by the console sink.
    pub fn tag(self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }

    /// Parse a tag as written in config files.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "trace" => Some(Level::Trace),
            "debug" => Some(Level::Debug),
            "info" => Some(Level::Info),
            "warn" => Some(Level::Warn),
            "error" => Some(Level::Error),
            "fatal" => Some(Level::Fatal),
            _ => None,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// One log record as handed to a sink.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: Level,
    pub message: String,
}

impl LogRecord {
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

/// Destination for log records.
pub trait LogSink: Send + Sync {
    fn submit(&self, record: LogRecord);
}

// ============================================================================
// Sinks
// ============================================================================

/// Writes colorized records to stderr.
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl LogSink for ConsoleSink {
    fn submit(&self, record: LogRecord) {
        let tag = colorize_tag(record.level);
        let mut stderr = std::io::stderr().lock();
        writeln!(stderr, "{tag} {}", record.message).ok();
    }
}

/// Apply color to a level tag.
#[inline]
fn colorize_tag(level: Level) -> String {
    let tag = format!("[{}]", level.tag());
    match level {
        Level::Trace => tag.dimmed().to_string(),
        Level::Debug => tag.magenta().to_string(),
        Level::Info => tag.green().to_string(),
        Level::Warn => tag.yellow().bold().to_string(),
        Level::Error => tag.red().bold().to_string(),
        Level::Fatal => tag.bright_red().bold().to_string(),
    }
}

/// Forwards records into an unbounded channel.
///
/// Compositions that route logging through their command table hang this
/// sink behind their handles; a pump task drains the receiver and issues
/// the `log` command once per record, preserving submission order.
pub struct QueueSink {
    tx: mpsc::UnboundedSender<LogRecord>,
}

impl QueueSink {
    /// The sink plus the receiving end for the pump.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LogRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl LogSink for QueueSink {
    fn submit(&self, record: LogRecord) {
        // A closed receiver means the composition already shut down.
        let _ = self.tx.send(record);
    }
}

/// Buffers records in memory for later inspection.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything submitted so far.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    /// True if any record at `level` contains `fragment`.
    pub fn contains(&self, level: Level, fragment: &str) -> bool {
        self.records
            .lock()
            .iter()
            .any(|r| r.level == level && r.message.contains(fragment))
    }
}

impl LogSink for MemorySink {
    fn submit(&self, record: LogRecord) {
        self.records.lock().push(record);
    }
}

// ============================================================================
// Logger
// ============================================================================

/// Handle through which components emit log records.
///
/// Cheap to clone. [`Logger::scoped`] derives a child handle whose prefix
/// extends the parent's, giving hierarchical labels like `[server][web]`.
#[derive(Clone)]
pub struct Logger {
    sink: Arc<dyn LogSink>,
    prefix: String,
    min_level: Level,
}

impl Logger {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self {
            sink,
            prefix: String::new(),
            min_level: Level::Info,
        }
    }

    /// Lowest level this handle forwards; records below it are dropped.
    pub fn with_min_level(mut self, level: Level) -> Self {
        self.min_level = level;
        self
    }

    pub fn min_level(&self) -> Level {
        self.min_level
    }

    /// Child handle with `label` appended to the prefix chain.
    pub fn scoped(&self, label: &str) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            prefix: format!("{}[{label}]", self.prefix),
            min_level: self.min_level,
        }
    }

    pub fn log(&self, level: Level, message: impl Into<String>) {
        if level < self.min_level {
            return;
        }
        let message = if self.prefix.is_empty() {
            message.into()
        } else {
            format!("{} {}", self.prefix, message.into())
        };
        self.sink.submit(LogRecord { level, message });
    }

    pub fn trace(&self, message: impl Into<String>) {
        self.log(Level::Trace, message);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(Level::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(Level::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(Level::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(Level::Error, message);
    }

    pub fn fatal(&self, message: impl Into<String>) {
        self.log(Level::Fatal, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Fatal);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!(Level::parse("info"), Some(Level::Info));
        assert_eq!(Level::parse("WARN"), Some(Level::Warn));
        assert_eq!(Level::parse("verbose"), None);
    }

    #[test]
    fn test_min_level_filters() {
        let sink = Arc::new(MemorySink::new());
        let log = Logger::new(sink.clone()).with_min_level(Level::Warn);
        log.debug("hidden");
        log.info("hidden too");
        log.warn("shown");
        log.fatal("also shown");
        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].level, Level::Warn);
        assert_eq!(records[1].level, Level::Fatal);
    }

    #[test]
    fn test_scoped_prefix_chain() {
        let sink = Arc::new(MemorySink::new());
        let log = Logger::new(sink.clone());
        let child = log.scoped("server").scoped("web");
        child.info("compiled");
        let records = sink.records();
        assert_eq!(records[0].message, "[server][web] compiled");
    }

    #[test]
    fn test_queue_sink_preserves_order() {
        let (sink, mut rx) = QueueSink::channel();
        sink.submit(LogRecord::new(Level::Info, "first"));
        sink.submit(LogRecord::new(Level::Warn, "second"));
        assert_eq!(rx.try_recv().map(|r| r.message).ok().as_deref(), Some("first"));
        assert_eq!(rx.try_recv().map(|r| r.message).ok().as_deref(), Some("second"));
    }
}
