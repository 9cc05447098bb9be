//! Locating the engine binary.
//!
//! Which file to run is decided by a [`BinaryResolver`] passed to the
//! supervisor at construction. [`SearchPathResolver`] covers the usual
//! lookup order; [`FixedPathResolver`] pins one path.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::{EngineConfig, SettingsError};

/// Environment variable overriding the engine binary location.
pub const BINARY_ENV_VAR: &str = "ENGINE_HOST_BINARY";

/// Default file name of the engine binary (without platform suffix).
pub const DEFAULT_BINARY_NAME: &str = "query-engine";

const SUPPORTED_OS: &[&str] = &["linux", "macos", "windows", "freebsd"];
const SUPPORTED_ARCH: &[&str] = &["x86_64", "aarch64", "arm"];

/// Operating system and CPU architecture the engine must be built for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    /// The platform this process runs on.
    pub fn current() -> Self {
        Self::new(env::consts::OS, env::consts::ARCH)
    }

    /// Identifier such as `linux-x86_64`.
    pub fn id(&self) -> String {
        format!("{}-{}", self.os, self.arch)
    }

    pub fn is_supported(&self) -> bool {
        SUPPORTED_OS.contains(&self.os.as_str()) && SUPPORTED_ARCH.contains(&self.arch.as_str())
    }

    /// File name of an executable called `stem` on this platform.
    pub fn executable_name(&self, stem: &str) -> String {
        if self.os == "windows" {
            format!("{stem}.exe")
        } else {
            stem.to_string()
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os, self.arch)
    }
}

/// Reasons the engine binary could not be produced.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("no engine binary for {platform} (searched: {})", display_paths(.searched))]
    NotFound {
        platform: String,
        searched: Vec<PathBuf>,
    },

    #[error("engine binary at {} is not executable", .0.display())]
    NotExecutable(PathBuf),

    #[error("platform {0} is not supported")]
    UnsupportedPlatform(String),

    #[error(transparent)]
    Config(#[from] SettingsError),
}

fn display_paths(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "nothing".to_string();
    }
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Produces the path of the engine binary for a platform.
pub trait BinaryResolver: Send + Sync {
    fn resolve(&self, platform: &Platform) -> Result<PathBuf, ResolveError>;
}

/// Always resolves to one path.
#[derive(Debug, Clone)]
pub struct FixedPathResolver {
    path: PathBuf,
}

impl FixedPathResolver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl BinaryResolver for FixedPathResolver {
    fn resolve(&self, platform: &Platform) -> Result<PathBuf, ResolveError> {
        if self.path.is_file() {
            Ok(self.path.clone())
        } else {
            Err(ResolveError::NotFound {
                platform: platform.id(),
                searched: vec![self.path.clone()],
            })
        }
    }
}

/// Looks for the engine binary in the usual places.
///
/// Order:
/// 1. `ENGINE_HOST_BINARY`
/// 2. the configured `binary_path`
/// 3. `<cwd>/<name>`, `<cwd>/engine/<name>`, `<cwd>/engine/<platform>/<name>`
/// 4. every directory on `PATH`
#[derive(Debug, Clone)]
pub struct SearchPathResolver {
    explicit: Option<PathBuf>,
    cwd: PathBuf,
    binary_name: String,
}

impl SearchPathResolver {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            explicit: None,
            cwd: cwd.into(),
            binary_name: DEFAULT_BINARY_NAME.to_string(),
        }
    }

    /// Build from an engine configuration.
    pub fn from_config(config: &EngineConfig) -> Result<Self, SettingsError> {
        let mut resolver = Self::new(&config.cwd);
        resolver.explicit = config.resolved_binary_path()?;
        Ok(resolver)
    }

    pub fn with_binary_name(mut self, name: impl Into<String>) -> Self {
        self.binary_name = name.into();
        self
    }

    pub fn with_explicit_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.explicit = Some(path.into());
        self
    }

    fn candidates(&self, platform: &Platform) -> Vec<PathBuf> {
        let name = platform.executable_name(&self.binary_name);
        let mut candidates = Vec::new();

        if let Some(path) = env::var_os(BINARY_ENV_VAR) {
            candidates.push(PathBuf::from(path));
        }
        if let Some(path) = &self.explicit {
            candidates.push(path.clone());
        }

        candidates.push(self.cwd.join(&name));
        candidates.push(self.cwd.join("engine").join(&name));
        candidates.push(self.cwd.join("engine").join(platform.id()).join(&name));

        if let Some(path_var) = env::var_os("PATH") {
            candidates.extend(env::split_paths(&path_var).map(|dir| dir.join(&name)));
        }

        candidates
    }
}

impl BinaryResolver for SearchPathResolver {
    fn resolve(&self, platform: &Platform) -> Result<PathBuf, ResolveError> {
        if !platform.is_supported() {
            return Err(ResolveError::UnsupportedPlatform(platform.id()));
        }

        let candidates = self.candidates(platform);
        match candidates.iter().find(|p| p.is_file()) {
            Some(found) => Ok(found.clone()),
            None => Err(ResolveError::NotFound {
                platform: platform.id(),
                searched: candidates,
            }),
        }
    }
}

/// Check that `path` is a file the OS will execute.
pub fn ensure_executable(path: &Path) -> Result<(), ResolveError> {
    let metadata = fs::metadata(path).map_err(|_| ResolveError::NotFound {
        platform: Platform::current().id(),
        searched: vec![path.to_path_buf()],
    })?;

    if !metadata.is_file() {
        return Err(ResolveError::NotExecutable(path.to_path_buf()));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(ResolveError::NotExecutable(path.to_path_buf()));
        }
    }

    Ok(())
}
