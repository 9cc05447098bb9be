//! Fixtures shared by the engine integration tests: shell scripts standing in
//! for the engine binary, and a transport whose replies are scripted.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use engine_host::config::EngineConfig;
use engine_host::engine::{
    EnginePhase, EngineSupervisor, EngineTransport, FixedPathResolver, TransportError,
};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tempfile::TempDir;

pub const READY_LINE: &str = r#"{"timestamp":"2024-01-01T00:00:00Z","level":"INFO","target":"query_engine::server","fields":{"message":"Started query engine http server"}}"#;

pub const PANIC_LINE: &str = r#"{"timestamp":"2024-01-01T00:00:01Z","level":"ERROR","target":"query_engine::core","fields":{"message":"PANIC","reason":"index out of bounds","file":"src/exec.rs","line":42,"column":9}}"#;

pub const FATAL_LINE: &str = r#"{"timestamp":"2024-01-01T00:00:01Z","level":"ERROR","target":"query_engine::server","fields":{"message":"Can't reach database server at localhost:5432"}}"#;

/// Spawning while another thread writes a script can fail with ETXTBSY, so
/// process tests run one at a time.
static SERIAL: Lazy<tokio::sync::Mutex<()>> = Lazy::new(|| tokio::sync::Mutex::new(()));

pub async fn serial() -> tokio::sync::MutexGuard<'static, ()> {
    SERIAL.lock().await
}

pub fn info_line(message: &str) -> String {
    format!(
        r#"{{"level":"INFO","target":"query_engine::core","fields":{{"message":"{message}"}}}}"#
    )
}

/// A shell script posing as the engine, in its own temp directory.
///
/// The script runs with the temp directory as working directory.
pub struct FakeEngine {
    pub dir: TempDir,
    pub binary: PathBuf,
}

impl FakeEngine {
    pub fn new(body: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("query-engine");
        fs::write(&binary, format!("#!/bin/sh\necho spawn >> spawns\n{body}\n")).unwrap();
        fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();
        Self { dir, binary }
    }

    /// Prints the readiness sentinel, then idles.
    pub fn ready() -> Self {
        Self::new(&format!("echo '{READY_LINE}'\nexec sleep 30"))
    }

    pub fn config(&self) -> EngineConfig {
        EngineConfig {
            cwd: self.dir.path().to_path_buf(),
            shutdown_grace: "1s".to_string(),
            ..EngineConfig::default()
        }
    }

    pub fn spawn_count(&self) -> usize {
        fs::read_to_string(self.dir.path().join("spawns"))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    pub fn read(&self, name: &str) -> String {
        fs::read_to_string(self.dir.path().join(name)).unwrap_or_default()
    }

    pub fn supervisor(&self) -> EngineSupervisor {
        self.supervisor_with(self.config(), FakeTransport::body("[]"))
    }

    pub fn supervisor_with(&self, config: EngineConfig, transport: FakeTransport) -> EngineSupervisor {
        EngineSupervisor::builder(config)
            .resolver(FixedPathResolver::new(&self.binary))
            .transport(transport)
            .build()
            .unwrap()
    }
}

/// What the fake transport does with a batch.
pub enum Reply {
    Body(String),
    Fail(TransportError),
    /// Never answer.
    Hang,
}

struct FakeState {
    reply: Box<dyn Fn() -> Reply + Send + Sync>,
    bodies: Mutex<Vec<String>>,
    probes: AtomicUsize,
    ready_after: usize,
}

/// In-memory [`EngineTransport`] with scripted replies.
#[derive(Clone)]
pub struct FakeTransport {
    state: Arc<FakeState>,
}

impl FakeTransport {
    pub fn new(reply: impl Fn() -> Reply + Send + Sync + 'static) -> Self {
        Self::with_probe(reply, 1)
    }

    /// Status probes succeed from the `ready_after`-th call on.
    pub fn with_probe(reply: impl Fn() -> Reply + Send + Sync + 'static, ready_after: usize) -> Self {
        Self {
            state: Arc::new(FakeState {
                reply: Box::new(reply),
                bodies: Mutex::new(Vec::new()),
                probes: AtomicUsize::new(0),
                ready_after,
            }),
        }
    }

    pub fn body(body: &'static str) -> Self {
        Self::new(move || Reply::Body(body.to_string()))
    }

    pub fn hang() -> Self {
        Self::new(|| Reply::Hang)
    }

    /// Request bodies received so far.
    pub fn bodies(&self) -> Vec<String> {
        self.state.bodies.lock().clone()
    }

    pub fn probes(&self) -> usize {
        self.state.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineTransport for FakeTransport {
    async fn post_batch(&self, _base_url: &str, body: String) -> Result<String, TransportError> {
        self.state.bodies.lock().push(body);
        let reply = (self.state.reply)();
        match reply {
            Reply::Body(text) => Ok(text),
            Reply::Fail(err) => Err(err),
            Reply::Hang => std::future::pending().await,
        }
    }

    async fn probe(&self, _base_url: &str) -> Result<(), TransportError> {
        let n = self.state.probes.fetch_add(1, Ordering::SeqCst) + 1;
        if n >= self.state.ready_after {
            Ok(())
        } else {
            Err(TransportError::ConnectionRefused("not listening yet".to_string()))
        }
    }
}

/// Poll until the supervisor reaches `phase`, failing after five seconds.
pub async fn wait_for_phase(supervisor: &EngineSupervisor, phase: EnginePhase) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while supervisor.phase() != phase {
        assert!(
            tokio::time::Instant::now() < deadline,
            "supervisor stuck in {} waiting for {}",
            supervisor.phase(),
            phase
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Whether a process with `pid` still exists.
pub fn process_alive(pid: u32) -> bool {
    std::process::Command::new("sh")
        .arg("-c")
        .arg(format!("kill -0 {pid} 2>/dev/null"))
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
