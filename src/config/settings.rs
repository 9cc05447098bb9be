//! TOML-based configuration for the engine host.
//!
//! Supports a config file (engine-host.toml) with environment variable expansion.
//!
//! Example configuration:
//! ```toml
//! cwd = "./app"
//! binary_path = "${ENGINE_HOME}/query-engine"
//! log_level = "info"
//! log_queries = false
//! color = false
//! shutdown_grace = "5s"
//! request_timeout = "30s"
//!
//! [schema]
//! path = "./schema.model"
//!
//! [[datasources]]
//! name = "db"
//! url = "${DATABASE_URL}"
//!
//! [env]
//! TZ = "UTC"
//!
//! [readiness]
//! strategy = "polling"
//! interval = "100ms"
//! max_attempts = 50
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable pointing at an explicit config file.
pub const CONFIG_ENV_VAR: &str = "ENGINE_HOST_CONFIG";

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid duration format: {0}")]
    InvalidDuration(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Immutable configuration handed to the supervisor at construction.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Working directory of the engine process.
    pub cwd: PathBuf,

    /// Explicit engine binary path (supports ${ENV_VAR} expansion).
    pub binary_path: Option<String>,

    /// Schema handed to the engine, inline or by path.
    pub schema: Option<SchemaSource>,

    /// Datasource URL overrides.
    pub datasources: Vec<DatasourceOverride>,

    /// Engine log verbosity.
    pub log_level: LogVerbosity,

    /// Ask the engine to log every query it runs.
    pub log_queries: bool,

    /// User-provided environment variables, merged beneath engine variables.
    pub env: BTreeMap<String, String>,

    /// Force colored engine output.
    pub color: bool,

    /// Extra command-line arguments for the engine.
    pub args: Vec<String>,

    /// How the supervisor decides the engine is ready.
    pub readiness: ReadinessSettings,

    /// Structured log entry announcing that the engine listens.
    pub sentinel: SentinelSettings,

    /// How long `stop()` waits for in-flight requests (e.g. "5s").
    pub shutdown_grace: String,

    /// Upper bound for one HTTP round-trip (e.g. "30s"); unbounded if unset.
    pub request_timeout: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cwd: PathBuf::from("."),
            binary_path: None,
            schema: None,
            datasources: Vec::new(),
            log_level: LogVerbosity::Info,
            log_queries: false,
            env: BTreeMap::new(),
            color: false,
            args: Vec::new(),
            readiness: ReadinessSettings::default(),
            sentinel: SentinelSettings::default(),
            shutdown_grace: "5s".to_string(),
            request_timeout: None,
        }
    }
}

/// Where the engine reads its schema from.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaSource {
    /// Schema text passed through the environment.
    Inline(String),
    /// Path to a schema file (supports ${ENV_VAR} expansion).
    Path(String),
}

/// A datasource whose URL replaces the one declared in the schema.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DatasourceOverride {
    /// Datasource name as declared in the schema.
    pub name: String,
    /// Replacement URL (supports ${ENV_VAR} expansion).
    pub url: String,
}

/// Log verbosity requested from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogVerbosity {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogVerbosity {
    /// Value passed to the engine through `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogVerbosity::Debug => "debug",
            LogVerbosity::Info => "info",
            LogVerbosity::Warn => "warn",
            LogVerbosity::Error => "error",
        }
    }
}

impl fmt::Display for LogVerbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Readiness detection settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ReadinessSettings {
    /// Wait for the readiness sentinel on the engine's log stream.
    #[default]
    LogSentinel,
    /// Probe the engine's status endpoint on a fixed interval.
    Polling {
        /// Delay between probes (e.g., "100ms").
        #[serde(default = "default_poll_interval")]
        interval: String,
        /// Probes attempted before giving up.
        #[serde(default = "default_poll_attempts")]
        max_attempts: u32,
    },
}

fn default_poll_interval() -> String {
    "100ms".to_string()
}

fn default_poll_attempts() -> u32 {
    50
}

/// The log entry that marks the engine's listener as accepting connections.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SentinelSettings {
    /// Log target of the engine's HTTP server component.
    pub target: String,
    /// Prefix of the message logged once the listener is bound.
    pub message_prefix: String,
}

impl Default for SentinelSettings {
    fn default() -> Self {
        Self {
            target: "query_engine::server".to_string(),
            message_prefix: "Started query engine http server".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate settings from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `ENGINE_HOST_CONFIG`
    /// 2. `./engine-host.toml`
    /// 3. `~/.config/engine-host/config.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var(CONFIG_ENV_VAR) {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("engine-host.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("engine-host").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        Ok(EngineConfig::default())
    }

    /// Reject configurations the supervisor cannot act on.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if let Some(SchemaSource::Inline(text)) = &self.schema {
            if text.trim().is_empty() {
                return Err(SettingsError::InvalidConfig(
                    "inline schema is empty".to_string(),
                ));
            }
        }

        let mut seen = HashSet::new();
        for ds in &self.datasources {
            if !seen.insert(ds.name.as_str()) {
                return Err(SettingsError::InvalidConfig(format!(
                    "datasource '{}' is overridden more than once",
                    ds.name
                )));
            }
        }

        if let ReadinessSettings::Polling { interval, max_attempts } = &self.readiness {
            if *max_attempts == 0 {
                return Err(SettingsError::InvalidConfig(
                    "polling readiness needs at least one attempt".to_string(),
                ));
            }
            parse_duration(interval)?;
        }

        parse_duration(&self.shutdown_grace)?;
        if let Some(timeout) = &self.request_timeout {
            parse_duration(timeout)?;
        }

        Ok(())
    }

    /// Get the configured binary path with environment variables expanded.
    pub fn resolved_binary_path(&self) -> Result<Option<PathBuf>, SettingsError> {
        self.binary_path
            .as_deref()
            .map(|p| expand_env_vars(p).map(PathBuf::from))
            .transpose()
    }

    /// Get the schema source with environment variables expanded in paths.
    pub fn resolved_schema(&self) -> Result<Option<SchemaSource>, SettingsError> {
        match &self.schema {
            Some(SchemaSource::Path(path)) => Ok(Some(SchemaSource::Path(expand_env_vars(path)?))),
            other => Ok(other.clone()),
        }
    }

    /// Get the datasource overrides with environment variables expanded.
    pub fn resolved_datasources(&self) -> Result<Vec<DatasourceOverride>, SettingsError> {
        self.datasources
            .iter()
            .map(|ds| {
                Ok(DatasourceOverride {
                    name: ds.name.clone(),
                    url: expand_env_vars(&ds.url)?,
                })
            })
            .collect()
    }

    /// Get the user environment with variables expanded in values.
    pub fn resolved_env(&self) -> Result<BTreeMap<String, String>, SettingsError> {
        self.env
            .iter()
            .map(|(k, v)| Ok((k.clone(), expand_env_vars(v)?)))
            .collect()
    }

    /// Grace period granted to in-flight requests on shutdown.
    pub fn shutdown_grace(&self) -> Result<Duration, SettingsError> {
        parse_duration(&self.shutdown_grace)
    }

    /// Per-request timeout, if configured.
    pub fn request_timeout(&self) -> Result<Option<Duration>, SettingsError> {
        self.request_timeout.as_deref().map(parse_duration).transpose()
    }
}

/// Parse a duration such as "250ms", "5s", "1m" or "2h".
///
/// A bare number is read as milliseconds.
pub fn parse_duration(s: &str) -> Result<Duration, SettingsError> {
    let s = s.trim();
    let invalid = || SettingsError::InvalidDuration(s.to_string());

    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    if digits.is_empty() {
        return Err(invalid());
    }
    let value: u64 = digits.parse().map_err(|_| invalid())?;

    match unit.trim() {
        "" | "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(invalid()),
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }

        let mut var_name = String::new();
        if chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            for ch in chars.by_ref() {
                if ch == '}' {
                    break;
                }
                var_name.push(ch);
            }
        } else {
            // $VAR ends at non-alphanumeric/underscore
            while let Some(ch) = chars.next_if(|ch| ch.is_alphanumeric() || *ch == '_') {
                var_name.push(ch);
            }
            if var_name.is_empty() {
                // Just a lone $, keep it
                result.push('$');
                continue;
            }
        }

        let value =
            env::var(&var_name).map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
        result.push_str(&value);
    }

    Ok(result)
}
