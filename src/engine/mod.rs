//! Engine process supervision and request dispatch.
//!
//! The query engine is an external binary that serves batches of queries over
//! HTTP on a loopback port and reports its state through structured log lines.
//! This module starts it, watches it, and turns its answers and failures into
//! typed results.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Host Process (Tokio)                       │
//! │  ┌──────────────────────┐        ┌───────────────────────────┐  │
//! │  │  RequestDispatcher   │───────▶│     EngineSupervisor      │  │
//! │  │  - batch envelopes   │acquire │  - one shared start       │  │
//! │  │  - per-request       │        │  - readiness gate         │  │
//! │  │    cancellation      │        │  - exit / panic handling  │  │
//! │  └──────────┬───────────┘        └─────────────┬─────────────┘  │
//! │             │ HTTP POST (batch)                │ stdout/stderr  │
//! │             │                                  │ (JSON lines)   │
//! └─────────────┼──────────────────────────────────┼────────────────┘
//!               ▼                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │          Query Engine (child process, 127.0.0.1:<port>)         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use engine_host::engine::{EngineSupervisor, RequestDispatcher};
//! use engine_host::config::EngineConfig;
//!
//! let supervisor = EngineSupervisor::new(EngineConfig::load()?)?;
//! let dispatcher = RequestDispatcher::new(supervisor.clone());
//!
//! let results = dispatcher.send(["{ findManyUser { id } }"]).await?;
//! for result in results {
//!     match result {
//!         Ok(data) => println!("{data}"),
//!         Err(err) => eprintln!("query failed: {err}"),
//!     }
//! }
//!
//! supervisor.stop().await;
//! ```

pub mod classify;
mod dispatcher;
pub mod env;
mod error;
mod log;
pub mod port;
pub mod protocol;
mod readiness;
pub mod resolver;
mod supervisor;
mod transport;

pub use dispatcher::{PendingRequest, RequestDispatcher, RequestTicket};
pub use error::{
    codes, DomainError, EngineError, EngineFailure, EngineResult, InitializationError, ItemResult,
    KnownRequestError, RustPanicError, TransportError, UnknownRequestError,
};
pub use log::{
    DiagnosticBuffer, Diagnostics, LogBus, LogLineParser, LogSubscription, ParsedLine, StreamKind,
    DEFAULT_LOG_CAPACITY,
};
pub use protocol::{LogLevel, LogRecord};
pub use readiness::{poll_until_ready, GateState, ReadinessGate, ReadinessSentinel, ReadinessStrategy};
pub use resolver::{BinaryResolver, FixedPathResolver, Platform, ResolveError, SearchPathResolver};
pub use supervisor::{
    EnginePhase, EngineSupervisor, EngineSupervisorBuilder, Incarnation, ENGINE_LOG_TARGET,
};
pub use transport::{EngineTransport, HttpTransport, STATUS_PATH};
