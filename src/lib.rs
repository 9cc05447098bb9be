//! # Engine Host
//!
//! Runs an external query engine as a supervised child process and exposes
//! it as typed async calls.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  EngineConfig (TOML)                     │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [supervisor]
//! ┌─────────────────────────────────────────────────────────┐
//! │   spawn ─▶ parse logs ─▶ readiness gate ─▶ ready         │
//! │             │                                             │
//! │             └─▶ panic / exit ─▶ failure slot             │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [dispatcher]
//! ┌─────────────────────────────────────────────────────────┐
//! │   batch ─▶ HTTP ─▶ per-item results / classified error   │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod engine;

pub use config::{EngineConfig, SettingsError};
pub use engine::{
    EngineError, EnginePhase, EngineResult, EngineSupervisor, InitializationError, LogLevel,
    LogRecord, RequestDispatcher,
};
