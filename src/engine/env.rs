//! Environment handed to the engine process.
//!
//! Three layers, later ones winning: the host's inherited environment, the
//! user's `env` table, and the variables the supervisor sets itself.

use std::collections::BTreeMap;
use std::env;

use crate::config::{EngineConfig, SchemaSource, SettingsError};

pub const RUST_BACKTRACE: &str = "RUST_BACKTRACE";
pub const RUST_LOG: &str = "RUST_LOG";
pub const ENGINE_PORT: &str = "ENGINE_PORT";
pub const ENGINE_DATAMODEL: &str = "ENGINE_DATAMODEL";
pub const ENGINE_DATAMODEL_PATH: &str = "ENGINE_DATAMODEL_PATH";
pub const OVERWRITE_DATASOURCES: &str = "OVERWRITE_DATASOURCES";
pub const LOG_QUERIES: &str = "LOG_QUERIES";
pub const CLICOLOR_FORCE: &str = "CLICOLOR_FORCE";

/// Variables the supervisor sets for one incarnation listening on `port`.
pub fn engine_vars(config: &EngineConfig, port: u16) -> Result<BTreeMap<String, String>, SettingsError> {
    let mut vars = BTreeMap::new();
    vars.insert(RUST_BACKTRACE.to_string(), "1".to_string());
    vars.insert(RUST_LOG.to_string(), config.log_level.as_str().to_string());
    vars.insert(ENGINE_PORT.to_string(), port.to_string());

    match config.resolved_schema()? {
        Some(SchemaSource::Inline(text)) => {
            vars.insert(ENGINE_DATAMODEL.to_string(), text);
        }
        Some(SchemaSource::Path(path)) => {
            vars.insert(ENGINE_DATAMODEL_PATH.to_string(), path);
        }
        None => {}
    }

    let datasources = config.resolved_datasources()?;
    if !datasources.is_empty() {
        let payload = serde_json::to_string(&datasources).map_err(|e| {
            SettingsError::InvalidConfig(format!("cannot encode datasource overrides: {e}"))
        })?;
        vars.insert(OVERWRITE_DATASOURCES.to_string(), payload);
    }

    if config.log_queries {
        vars.insert(LOG_QUERIES.to_string(), "true".to_string());
    }
    if config.color {
        vars.insert(CLICOLOR_FORCE.to_string(), "1".to_string());
    }

    Ok(vars)
}

/// Merge the three layers. Engine variables override user variables, which
/// override inherited ones.
pub fn merge_env<I>(
    inherited: I,
    user: &BTreeMap<String, String>,
    engine: &BTreeMap<String, String>,
) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut merged: BTreeMap<String, String> = inherited.into_iter().collect();
    merged.extend(user.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged.extend(engine.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Full environment for an engine process listening on `port`.
pub fn build_environment(config: &EngineConfig, port: u16) -> Result<BTreeMap<String, String>, SettingsError> {
    let user = config.resolved_env()?;
    let engine = engine_vars(config, port)?;
    Ok(merge_env(env::vars(), &user, &engine))
}
