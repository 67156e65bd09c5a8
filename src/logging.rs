//! Diagnostic sinks
//!
//! Components never write to a global logger. They receive an explicit
//! [`LogSink`] at construction so that output can be routed to the console
//! or captured in tests.

use std::sync::{Arc, Mutex};

/// Log level for console output
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Suppress all output
    Quiet,
    /// Normal output level
    #[default]
    Normal,
    /// Verbose output with additional details
    Verbose,
}

/// Destination for human-readable progress messages
pub trait LogSink: Send + Sync {
    /// Record a progress message
    fn info(&self, message: &str);

    /// Record a detail message (tensor datatypes, timings)
    fn debug(&self, _message: &str) {}
}

/// Sink printing to stdout according to a [`LogLevel`]
#[derive(Clone, Copy, Debug, Default)]
pub struct ConsoleSink {
    level: LogLevel,
}

impl ConsoleSink {
    /// Create a console sink with the given level
    pub fn new(level: LogLevel) -> Self {
        Self { level }
    }

    /// Current level
    pub fn level(&self) -> LogLevel {
        self.level
    }
}

impl LogSink for ConsoleSink {
    fn info(&self, message: &str) {
        if self.level != LogLevel::Quiet {
            println!("{message}");
        }
    }

    fn debug(&self, message: &str) {
        if self.level == LogLevel::Verbose {
            println!("{message}");
        }
    }
}

/// Sink capturing messages in memory
///
/// Clones share the same buffer, so a test can keep one handle and pass
/// another to the component under test.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
    capture_debug: bool,
}

impl MemorySink {
    /// Create an empty sink capturing info messages only
    pub fn new() -> Self {
        Self::default()
    }

    /// Also capture debug messages
    pub fn with_debug(mut self) -> Self {
        self.capture_debug = true;
        self
    }

    /// Snapshot of captured lines
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Captured lines containing `needle`
    pub fn matching(&self, needle: &str) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|l| l.contains(needle))
            .collect()
    }

    fn push(&self, message: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(message.to_string());
        }
    }
}

impl LogSink for MemorySink {
    fn info(&self, message: &str) {
        self.push(message);
    }

    fn debug(&self, message: &str) {
        if self.capture_debug {
            self.push(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_shares_buffer_between_clones() {
        let sink = MemorySink::new();
        let handle = sink.clone();
        sink.info("first");
        sink.info("second");
        assert_eq!(handle.lines(), vec!["first", "second"]);
    }

    #[test]
    fn test_memory_sink_ignores_debug_by_default() {
        let sink = MemorySink::new();
        sink.debug("detail");
        assert!(sink.lines().is_empty());

        let verbose = MemorySink::new().with_debug();
        verbose.debug("detail");
        assert_eq!(verbose.lines(), vec!["detail"]);
    }

    #[test]
    fn test_matching_filters_lines() {
        let sink = MemorySink::new();
        sink.info("Acc: 71.0 %\tSize: 0.010000 MB");
        sink.info("Initialized weights");
        assert_eq!(sink.matching("Acc:").len(), 1);
    }

    #[test]
    fn test_console_sink_default_level() {
        assert_eq!(ConsoleSink::default().level(), LogLevel::Normal);
    }
}
