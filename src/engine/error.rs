//! Engine error taxonomy.

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Result of one query within a batch.
pub type ItemResult = Result<serde_json::Value, DomainError>;

/// Stable codes attached to [`InitializationError`].
pub mod codes {
    pub const BINARY_NOT_FOUND: &str = "BINARY_NOT_FOUND";
    pub const BINARY_NOT_EXECUTABLE: &str = "BINARY_NOT_EXECUTABLE";
    pub const UNSUPPORTED_PLATFORM: &str = "UNSUPPORTED_PLATFORM";
    pub const INVALID_CONFIG: &str = "INVALID_CONFIG";
    pub const PORT_UNAVAILABLE: &str = "PORT_UNAVAILABLE";
    pub const SPAWN_FAILED: &str = "SPAWN_FAILED";
    pub const ENGINE_PANICKED: &str = "ENGINE_PANICKED";
    pub const ENGINE_FATAL: &str = "ENGINE_FATAL";
    pub const ENGINE_EXITED: &str = "ENGINE_EXITED";
    pub const ENGINE_STOPPED: &str = "ENGINE_STOPPED";
    pub const ENGINE_NOT_READY: &str = "ENGINE_NOT_READY";
}

/// The last fatal condition observed for one engine incarnation.
///
/// Set from a panic record, a fatal log record, an abnormal exit or a spawn
/// failure. Read when a failed request needs attributing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineFailure {
    pub is_panic: bool,
    pub message: String,
    pub backtrace: Option<String>,
}

impl EngineFailure {
    pub fn panic(message: impl Into<String>, backtrace: Option<String>) -> Self {
        Self {
            is_panic: true,
            message: message.into(),
            backtrace,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            is_panic: false,
            message: message.into(),
            backtrace: None,
        }
    }
}

/// The engine could not be brought to a usable state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct InitializationError {
    pub message: String,
    pub error_code: Option<String>,
}

impl InitializationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_code: None,
        }
    }

    pub fn with_code(code: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_code: Some(code.to_string()),
        }
    }

    /// The stable code, if one applies.
    pub fn code(&self) -> Option<&str> {
        self.error_code.as_deref()
    }
}

/// The engine crashed; the current incarnation is gone.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("engine panicked: {message}")]
pub struct RustPanicError {
    pub message: String,
    pub backtrace: Option<String>,
}

/// A structured, coded error reported by the engine.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message} (code: {code})")]
pub struct KnownRequestError {
    pub code: String,
    pub message: String,
    pub meta: Option<serde_json::Value>,
}

/// Any failure without a stable code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct UnknownRequestError {
    pub message: String,
}

impl UnknownRequestError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Per-item failure inside a batch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    #[error(transparent)]
    Known(#[from] KnownRequestError),

    #[error(transparent)]
    Unknown(#[from] UnknownRequestError),
}

impl DomainError {
    pub fn message(&self) -> &str {
        match self {
            DomainError::Known(e) => &e.message,
            DomainError::Unknown(e) => &e.message,
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        match self {
            DomainError::Known(e) => Some(&e.code),
            DomainError::Unknown(_) => None,
        }
    }
}

/// Failures of the HTTP hop to the engine.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Nothing listens on the engine port.
    #[error("connection to engine refused: {0}")]
    ConnectionRefused(String),

    /// The engine dropped the connection mid-request.
    #[error("connection to engine reset: {0}")]
    ConnectionReset(String),

    /// The round-trip exceeded the configured request timeout.
    #[error("request to engine timed out after {0:?}")]
    Timeout(Duration),

    /// The engine answered with a non-success HTTP status.
    #[error("engine responded with HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("transport error: {0}")]
    Other(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl TransportError {
    /// Whether the connection itself was lost, as happens when the engine dies.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionRefused(_) | TransportError::ConnectionReset(_)
        )
    }
}

/// Errors surfaced to callers of the supervisor and dispatcher.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine initialization failed: {0}")]
    Initialization(#[from] InitializationError),

    #[error(transparent)]
    RustPanic(#[from] RustPanicError),

    #[error(transparent)]
    KnownRequest(#[from] KnownRequestError),

    #[error(transparent)]
    UnknownRequest(#[from] UnknownRequestError),

    /// Raw transport failure, propagated unchanged.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Canceled by its caller with no engine fault recorded.
    #[error("request {0} was canceled")]
    Canceled(Uuid),

    #[error("failed to serialize request: {0}")]
    Serialize(#[source] serde_json::Error),
}

impl From<DomainError> for EngineError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Known(e) => Self::KnownRequest(e),
            DomainError::Unknown(e) => Self::UnknownRequest(e),
        }
    }
}

impl EngineError {
    /// Check if the engine crashed.
    pub fn is_panic(&self) -> bool {
        matches!(self, Self::RustPanic(_))
    }

    /// Check if the engine reported a coded error.
    pub fn is_known(&self) -> bool {
        matches!(self, Self::KnownRequest(_))
    }

    /// Stable code for coded request errors and initialization failures.
    pub fn error_code(&self) -> Option<&str> {
        match self {
            Self::KnownRequest(e) => Some(&e.code),
            Self::Initialization(e) => e.code(),
            _ => None,
        }
    }

    /// Check if the supervisor must start a new incarnation before retrying.
    pub fn requires_restart(&self) -> bool {
        match self {
            Self::RustPanic(_) => true,
            Self::Transport(e) => e.is_connection_lost(),
            _ => false,
        }
    }
}
