//! Configuration module for the engine host.
//!
//! Handles the engine configuration file, environment variable expansion
//! and duration parsing.

mod settings;

pub use settings::{
    expand_env_vars, parse_duration, DatasourceOverride, EngineConfig, LogVerbosity,
    ReadinessSettings, SchemaSource, SentinelSettings, SettingsError, CONFIG_ENV_VAR,
};
