//! Wire types exchanged with the engine process.
//!
//! Two channels carry data out of the engine: the HTTP batch endpoint and the
//! structured log lines the engine prints on stdout/stderr. Both are modelled
//! here; neither interprets the queries themselves.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

// ============================================================================
// Batch Envelope
// ============================================================================

/// Request body posted to the engine.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRequest {
    /// Queries in caller order.
    pub batch: Vec<QueryEnvelope>,
}

/// One query of a batch.
#[derive(Debug, Clone, Serialize)]
pub struct QueryEnvelope {
    /// Opaque query text.
    pub query: String,
    /// Query variables (always empty; queries arrive pre-encoded).
    pub variables: Map<String, Value>,
}

impl BatchRequest {
    /// Wrap queries into a batch, preserving their order.
    pub fn from_queries<S: AsRef<str>>(queries: &[S]) -> Self {
        Self {
            batch: queries
                .iter()
                .map(|q| QueryEnvelope {
                    query: q.as_ref().to_string(),
                    variables: Map::new(),
                })
                .collect(),
        }
    }

    /// Number of queries in the batch.
    pub fn len(&self) -> usize {
        self.batch.len()
    }

    /// Whether the batch carries no queries.
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }
}

/// Response body returned by the engine.
///
/// Engines answer either with a bare array or wrap it under `batchResult`.
/// A top-level `errors` object means the whole batch was rejected.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BatchResponse {
    Items(Vec<ItemEnvelope>),
    Wrapped {
        #[serde(rename = "batchResult")]
        batch_result: Vec<ItemEnvelope>,
    },
    Rejected {
        errors: Vec<ItemErrorPayload>,
    },
}

/// One element of a batch response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemEnvelope {
    /// Result payload (present on success).
    #[serde(default)]
    pub data: Option<Value>,
    /// Errors reported for this item (non-empty on failure).
    #[serde(default)]
    pub errors: Vec<ItemErrorPayload>,
}

/// Error object reported by the engine for one item.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ItemErrorPayload {
    /// Stable error code, when the engine recognised the failure.
    #[serde(default, alias = "errorCode")]
    pub error_code: Option<String>,
    /// Human-readable message.
    #[serde(default, alias = "error")]
    pub message: String,
    /// Structured details attached to the error.
    #[serde(default)]
    pub meta: Option<Value>,
}

// ============================================================================
// Log Records
// ============================================================================

/// Severity of an engine log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[serde(alias = "DEBUG", alias = "trace", alias = "TRACE")]
    Debug,
    #[serde(alias = "INFO")]
    Info,
    #[serde(alias = "WARN", alias = "warning", alias = "WARNING")]
    Warn,
    #[serde(alias = "ERROR")]
    Error,
}

impl LogLevel {
    /// All levels, lowest severity first.
    pub const ALL: [LogLevel; 4] = [
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warn,
        LogLevel::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured line of engine output.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LogRecord {
    /// Engine-side timestamp, passed through verbatim.
    #[serde(default)]
    pub timestamp: Option<String>,
    pub level: LogLevel,
    /// Engine component that emitted the record.
    #[serde(default)]
    pub target: String,
    /// Structured fields; `message` is expected but not guaranteed.
    pub fields: Map<String, Value>,
}

/// Message carried by the record that announces an engine panic.
pub const PANIC_MESSAGE: &str = "PANIC";

impl LogRecord {
    /// The record's `message` field, if it is a string.
    pub fn message(&self) -> Option<&str> {
        self.field_str("message")
    }

    /// A string field by name.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Whether this is the engine's panic sentinel.
    pub fn is_panic(&self) -> bool {
        self.message() == Some(PANIC_MESSAGE)
    }

    /// Describe a panic record: reason plus source location when present.
    pub fn panic_summary(&self) -> String {
        let reason = self.field_str("reason").unwrap_or("engine panicked");
        let location = match (self.field_str("file"), self.fields.get("line")) {
            (Some(file), Some(line)) => match self.fields.get("column") {
                Some(column) => Some(format!("{file}:{line}:{column}")),
                None => Some(format!("{file}:{line}")),
            },
            (Some(file), None) => Some(file.to_string()),
            _ => None,
        };

        match location {
            Some(location) => format!("{reason} in {location}"),
            None => reason.to_string(),
        }
    }
}
