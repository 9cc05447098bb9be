//! Mapping failures onto the error taxonomy.
//!
//! Everything here is a pure function of its inputs. The supervisor and the
//! dispatcher gather the facts (the recorded [`EngineFailure`], captured
//! diagnostics, the transport outcome) and ask this module what the caller
//! should see.

use std::io;
use std::path::Path;

use uuid::Uuid;

use super::error::{
    codes, DomainError, EngineError, EngineFailure, InitializationError, KnownRequestError,
    RustPanicError, TransportError, UnknownRequestError,
};
use super::protocol::ItemErrorPayload;
use super::resolver::{ResolveError, BINARY_ENV_VAR};

const REMEDIATION: &str =
    "set `binary_path` in the engine configuration or point ENGINE_HOST_BINARY at the engine executable";

/// Binary resolution failed.
pub fn resolve_failure(err: &ResolveError) -> InitializationError {
    match err {
        ResolveError::NotFound { .. } => InitializationError::with_code(
            codes::BINARY_NOT_FOUND,
            format!("{err}; {REMEDIATION}"),
        ),
        ResolveError::NotExecutable(path) => InitializationError::with_code(
            codes::BINARY_NOT_EXECUTABLE,
            format!(
                "{err}; make it executable (e.g. `chmod +x {}`) or set {BINARY_ENV_VAR} to a working binary",
                path.display()
            ),
        ),
        ResolveError::UnsupportedPlatform(_) => InitializationError::with_code(
            codes::UNSUPPORTED_PLATFORM,
            format!("{err}; {REMEDIATION}"),
        ),
        ResolveError::Config(inner) => {
            InitializationError::with_code(codes::INVALID_CONFIG, inner.to_string())
        }
    }
}

/// The OS refused to start the process.
pub fn spawn_failure(path: &Path, err: &io::Error) -> InitializationError {
    let code = match err.kind() {
        io::ErrorKind::NotFound => codes::BINARY_NOT_FOUND,
        io::ErrorKind::PermissionDenied => codes::BINARY_NOT_EXECUTABLE,
        _ => codes::SPAWN_FAILED,
    };
    InitializationError::with_code(
        code,
        format!("failed to spawn engine at {}: {err}", path.display()),
    )
}

/// A start attempt ended before readiness.
///
/// The recorded failure wins over captured diagnostics; with neither the
/// headline stands alone.
pub fn startup_failure(
    code: &str,
    headline: &str,
    failure: Option<&EngineFailure>,
    diagnostics: &str,
) -> InitializationError {
    let detail = match failure {
        Some(f) => Some(f.message.as_str()),
        None if !diagnostics.trim().is_empty() => Some(diagnostics.trim()),
        None => None,
    };

    match detail {
        Some(detail) => InitializationError::with_code(code, format!("{headline}: {detail}")),
        None => InitializationError::with_code(code, headline),
    }
}

/// Request-level error for a recorded engine failure.
pub fn fault(failure: &EngineFailure) -> EngineError {
    if failure.is_panic {
        EngineError::RustPanic(RustPanicError {
            message: failure.message.clone(),
            backtrace: failure.backtrace.clone(),
        })
    } else {
        EngineError::UnknownRequest(UnknownRequestError::new(failure.message.clone()))
    }
}

/// A request was canceled before its response arrived.
pub fn cancellation(id: Uuid, failure: Option<&EngineFailure>) -> EngineError {
    match failure {
        Some(f) => fault(f),
        None => EngineError::Canceled(id),
    }
}

/// The HTTP round-trip failed.
pub fn transport_failure(
    canceled: bool,
    failure: Option<&EngineFailure>,
    diagnostics: &str,
    err: TransportError,
) -> EngineError {
    if canceled {
        if let Some(f) = failure {
            return fault(f);
        }
    }

    match err {
        TransportError::Status { status, body } => EngineError::UnknownRequest(
            UnknownRequestError::new(format!("engine responded with HTTP {status}: {body}")),
        ),
        err if err.is_connection_lost() => match failure {
            Some(f) => fault(f),
            None if !diagnostics.trim().is_empty() => {
                EngineError::UnknownRequest(UnknownRequestError::new(diagnostics.trim()))
            }
            None => EngineError::Transport(err),
        },
        err => EngineError::Transport(err),
    }
}

/// Error objects attached to one batch item.
///
/// The first error decides the kind, code and metadata. Messages of all
/// errors are kept.
pub fn item_error(errors: &[ItemErrorPayload]) -> DomainError {
    let Some(first) = errors.first() else {
        return DomainError::Unknown(UnknownRequestError::new(
            "engine reported an error without details",
        ));
    };

    let message = if errors.len() == 1 {
        first.message.clone()
    } else {
        errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    };

    match &first.error_code {
        Some(code) => DomainError::Known(KnownRequestError {
            code: code.clone(),
            message,
            meta: first.meta.clone(),
        }),
        None => DomainError::Unknown(UnknownRequestError::new(message)),
    }
}
