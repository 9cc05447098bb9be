//! Engine log handling.
//!
//! The engine prints one JSON object per line on stdout and stderr. Each
//! stream gets its own [`LogLineParser`], which reassembles lines split
//! across reads and decodes them. Lines that are not log records are kept in
//! a per-stream [`DiagnosticBuffer`]; they become the error message of last
//! resort when the engine dies without a structured explanation. Decoded
//! records fan out to subscribers through the [`LogBus`].

use std::collections::{HashSet, VecDeque};
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::broadcast;
use tracing::warn;

use super::protocol::{LogLevel, LogRecord};

/// Default number of records buffered per subscriber.
pub const DEFAULT_LOG_CAPACITY: usize = 256;

/// Default byte budget of one diagnostic buffer.
pub const DEFAULT_DIAGNOSTIC_BYTES: usize = 16 * 1024;

/// Longest fragment held back waiting for a newline. Anything longer is
/// flushed as text.
pub const MAX_LINE_BYTES: usize = DEFAULT_DIAGNOSTIC_BYTES * 4;

/// Unstructured lines that carry no diagnostic value.
static NOISE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^Printing to stderr for debugging",
        r"^Listening on \S+:\d+",
        r"^\s*[─━═=\-]{8,}\s*$",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Which output stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdout => f.write_str("stdout"),
            StreamKind::Stderr => f.write_str("stderr"),
        }
    }
}

/// Outcome of decoding one complete line.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    Record(LogRecord),
    /// Unstructured diagnostic text.
    Text(String),
    /// A known banner or a blank line.
    Noise,
}

/// Splits a byte stream into lines and decodes each one.
#[derive(Debug, Default)]
pub struct LogLineParser {
    partial: Vec<u8>,
}

impl LogLineParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes; returns every line completed by it.
    ///
    /// A trailing fragment without a newline is held until a later chunk
    /// (or [`finish`](Self::finish)) completes it, up to [`MAX_LINE_BYTES`].
    /// Past that the fragment is emitted as [`ParsedLine::Text`] in
    /// `MAX_LINE_BYTES` pieces.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ParsedLine> {
        let mut lines = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.partial.is_empty() {
                lines.push(Self::parse_bytes(head));
            } else {
                self.partial.extend_from_slice(head);
                let line = std::mem::take(&mut self.partial);
                lines.push(Self::parse_bytes(&line));
            }
        }

        self.partial.extend_from_slice(rest);
        while self.partial.len() >= MAX_LINE_BYTES {
            let overflow: Vec<u8> = self.partial.drain(..MAX_LINE_BYTES).collect();
            lines.push(ParsedLine::Text(String::from_utf8_lossy(&overflow).into_owned()));
        }
        lines
    }

    /// Flush a final line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<ParsedLine> {
        if self.partial.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.partial);
        Some(Self::parse_bytes(&line))
    }

    /// Bytes held back waiting for a newline.
    pub fn pending_len(&self) -> usize {
        self.partial.len()
    }

    fn parse_bytes(bytes: &[u8]) -> ParsedLine {
        Self::parse_line(&String::from_utf8_lossy(bytes))
    }

    /// Decode a single complete line.
    pub fn parse_line(line: &str) -> ParsedLine {
        let line = line.trim_end_matches('\r');
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return ParsedLine::Noise;
        }

        if trimmed.starts_with('{') {
            if let Ok(record) = serde_json::from_str::<LogRecord>(trimmed) {
                return ParsedLine::Record(record);
            }
        }

        if NOISE_PATTERNS.iter().any(|p| p.is_match(trimmed)) {
            return ParsedLine::Noise;
        }

        ParsedLine::Text(line.to_string())
    }
}

// ============================================================================
// Diagnostic Buffers
// ============================================================================

/// Rolling tail of unstructured output from one stream.
#[derive(Debug)]
pub struct DiagnosticBuffer {
    lines: VecDeque<String>,
    bytes: usize,
    limit: usize,
}

impl Default for DiagnosticBuffer {
    fn default() -> Self {
        Self::with_limit(DEFAULT_DIAGNOSTIC_BYTES)
    }
}

impl DiagnosticBuffer {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            limit,
        }
    }

    /// Append a line, evicting the oldest lines once over budget.
    ///
    /// The newest line is always kept, even if it alone exceeds the budget.
    pub fn push(&mut self, line: &str) {
        self.bytes += line.len();
        self.lines.push_back(line.to_string());

        while self.bytes > self.limit && self.lines.len() > 1 {
            if let Some(old) = self.lines.pop_front() {
                self.bytes -= old.len();
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Buffered lines joined by newlines.
    pub fn contents(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

/// The stdout and stderr buffers of one engine incarnation.
#[derive(Debug, Default)]
pub struct Diagnostics {
    pub stdout: DiagnosticBuffer,
    pub stderr: DiagnosticBuffer,
}

impl Diagnostics {
    pub fn push(&mut self, stream: StreamKind, line: &str) {
        match stream {
            StreamKind::Stdout => self.stdout.push(line),
            StreamKind::Stderr => self.stderr.push(line),
        }
    }

    /// Everything captured, stderr first.
    pub fn text(&self) -> String {
        [&self.stderr, &self.stdout]
            .iter()
            .filter(|b| !b.is_empty())
            .map(|b| b.contents())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ============================================================================
// Log Subscription
// ============================================================================

/// Broadcast channel carrying engine log records to subscribers.
#[derive(Debug, Clone)]
pub struct LogBus {
    sender: broadcast::Sender<LogRecord>,
}

impl Default for LogBus {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl LogBus {
    /// Create a bus buffering up to `capacity` records per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish a record; returns the number of subscribers reached.
    pub fn publish(&self, record: LogRecord) -> usize {
        self.sender.send(record).unwrap_or(0)
    }

    /// Subscribe to records of the given levels.
    pub fn subscribe(&self, levels: impl IntoIterator<Item = LogLevel>) -> LogSubscription {
        LogSubscription {
            receiver: self.sender.subscribe(),
            levels: levels.into_iter().collect(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// A filtered stream of engine log records.
#[derive(Debug)]
pub struct LogSubscription {
    receiver: broadcast::Receiver<LogRecord>,
    levels: HashSet<LogLevel>,
}

impl LogSubscription {
    /// Wait for the next record matching the subscription's levels.
    ///
    /// Returns `None` once the bus is gone. Records dropped because this
    /// subscriber fell behind are skipped.
    pub async fn recv(&mut self) -> Option<LogRecord> {
        loop {
            match self.receiver.recv().await {
                Ok(record) if self.levels.contains(&record.level) => return Some(record),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "log subscriber fell behind, records dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn levels(&self) -> &HashSet<LogLevel> {
        &self.levels
    }
}
