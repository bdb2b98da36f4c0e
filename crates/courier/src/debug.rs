//! Debug Sink
//!
//! Level-gated operator log. A line is emitted only when the configured debug
//! level is at least the level the message requires, and is written as
//!
//! ```text
//! [ERROR] (1234) led: unknown_function(blink)
//! ```
//!
//! where the number is milliseconds since the log was created. Where the line
//! goes is decided by the installed [`DebugSink`].

use std::fmt;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

/// Message category, selecting the tag printed in front of the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Category {
    Error,
    Warning,
    Info,
    #[default]
    Debug,
}

impl Category {
    pub fn tag(self) -> &'static str {
        match self {
            Category::Error => "ERROR",
            Category::Warning => "WARNING",
            Category::Info => "INFO",
            Category::Debug => "DEBUG",
        }
    }

    fn ansi_background(self) -> &'static str {
        match self {
            Category::Error => "\x1b[41m",
            Category::Warning => "\x1b[43m",
            Category::Info => "\x1b[7m",
            Category::Debug => "\x1b[46m",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sinks
// ─────────────────────────────────────────────────────────────────────────────

/// Destination for formatted debug lines.
pub trait DebugSink: Send + Sync + 'static {
    /// Write one already formatted line. `line` has no trailing newline.
    fn write_line(&self, category: Category, line: &str);
}

/// Forwards lines to `tracing` at the level matching the category.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DebugSink for TracingSink {
    fn write_line(&self, category: Category, line: &str) {
        match category {
            Category::Error => tracing::error!(target: "courier::debug", "{}", line),
            Category::Warning => tracing::warn!(target: "courier::debug", "{}", line),
            Category::Info => tracing::info!(target: "courier::debug", "{}", line),
            Category::Debug => tracing::debug!(target: "courier::debug", "{}", line),
        }
    }
}

/// Writes lines to any `io::Write`, one per line.
pub struct WriterSink<W: Write + Send + 'static> {
    writer: Mutex<W>,
}

impl<W: Write + Send + 'static> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send + 'static> DebugSink for WriterSink<W> {
    fn write_line(&self, _category: Category, line: &str) {
        let mut writer = self.writer.lock();
        // A failing debug stream must not take the caller down with it.
        let _ = writeln!(writer, "{}", line).and_then(|_| writer.flush());
    }
}

/// Keeps lines in memory. Useful for inspecting output in tests and tools.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<(Category, String)>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().iter().map(|(_, l)| l.clone()).collect()
    }

    pub fn count(&self, category: Category) -> usize {
        self.lines.lock().iter().filter(|(c, _)| *c == category).count()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }
}

impl DebugSink for MemorySink {
    fn write_line(&self, category: Category, line: &str) {
        self.lines.lock().push((category, line.to_string()));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Debug Log
// ─────────────────────────────────────────────────────────────────────────────

/// Debug level, sink and formatting state.
pub struct DebugLog {
    level: AtomicU8,
    ansi: AtomicBool,
    sink: RwLock<Arc<dyn DebugSink>>,
    epoch: Instant,
}

impl DebugLog {
    pub fn new(level: u8, ansi: bool) -> Self {
        Self {
            level: AtomicU8::new(level),
            ansi: AtomicBool::new(ansi),
            sink: RwLock::new(Arc::new(TracingSink)),
            epoch: Instant::now(),
        }
    }

    /// Set the debug level and return the level now in effect.
    pub fn set_level(&self, level: u8) -> u8 {
        self.level.store(level, Ordering::SeqCst);
        level
    }

    pub fn level(&self) -> u8 {
        self.level.load(Ordering::SeqCst)
    }

    pub fn set_ansi(&self, ansi: bool) {
        self.ansi.store(ansi, Ordering::SeqCst);
    }

    pub fn set_sink(&self, sink: Arc<dyn DebugSink>) {
        *self.sink.write() = sink;
    }

    pub fn enabled(&self, required: u8) -> bool {
        self.level() >= required
    }

    /// Emit `message` if the debug level allows it. Returns whether it did.
    pub fn log(&self, required: u8, category: Category, message: impl fmt::Display) -> bool {
        if !self.enabled(required) {
            return false;
        }
        let line = self.format_line(category, message);
        self.write(category, &line);
        true
    }

    /// Write pre-formatted text to the sink, one sink line per text line.
    pub fn write_block(&self, category: Category, text: &str) {
        for line in text.lines() {
            self.write(category, line);
        }
    }

    pub fn format_line(&self, category: Category, message: impl fmt::Display) -> String {
        let millis = self.epoch.elapsed().as_millis();
        if self.ansi.load(Ordering::SeqCst) {
            format!(
                "{}[{}]\x1b[0m ({}) {}",
                category.ansi_background(),
                category.tag(),
                millis,
                message
            )
        } else {
            format!("[{}] ({}) {}", category.tag(), millis, message)
        }
    }

    fn write(&self, category: Category, line: &str) {
        let sink = self.sink.read().clone();
        sink.write_line(category, line);
    }
}

impl Default for DebugLog {
    fn default() -> Self {
        Self::new(0, false)
    }
}

impl fmt::Debug for DebugLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugLog")
            .field("level", &self.level())
            .field("ansi", &self.ansi.load(Ordering::SeqCst))
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_gates_output() {
        let log = DebugLog::new(0, false);
        let sink = MemorySink::new();
        log.set_sink(Arc::new(sink.clone()));

        assert!(!log.log(1, Category::Error, "hidden"));
        assert!(sink.is_empty());

        assert_eq!(log.set_level(1), 1);
        assert!(log.log(1, Category::Error, "shown"));
        assert!(!log.log(2, Category::Info, "too detailed"));
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.count(Category::Error), 1);
    }

    #[test]
    fn test_line_format() {
        let log = DebugLog::new(5, false);
        let line = log.format_line(Category::Warning, "careful");
        assert!(line.starts_with("[WARNING] ("));
        assert!(line.ends_with(") careful"));

        assert!(log.format_line(Category::default(), "x").starts_with("[DEBUG]"));
    }

    #[test]
    fn test_ansi_wraps_tag() {
        let log = DebugLog::new(5, true);
        let line = log.format_line(Category::Error, "boom");
        assert!(line.starts_with("\x1b[41m[ERROR]\x1b[0m ("));
    }

    #[test]
    fn test_writer_sink_appends_newlines() {
        let sink = WriterSink::new(Vec::new());
        sink.write_line(Category::Info, "one");
        sink.write_line(Category::Info, "two");
        assert_eq!(String::from_utf8(sink.into_inner()).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn test_write_block_splits_lines() {
        let log = DebugLog::default();
        let sink = MemorySink::new();
        log.set_sink(Arc::new(sink.clone()));

        log.write_block(Category::Info, "a\nb\n");
        assert_eq!(sink.lines(), vec!["a".to_string(), "b".to_string()]);
    }
}
