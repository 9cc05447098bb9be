//! Engine process supervision.
//!
//! [`EngineSupervisor`] owns at most one live engine process at a time. Each
//! spawn-to-exit lifetime is an [`Incarnation`] with its own port, readiness
//! gate, failure slot and diagnostics. A crashed or stopped incarnation is
//! never reused: the next [`ensure_started`](EngineSupervisor::ensure_started)
//! begins a fresh one.
//!
//! Three tasks run per incarnation: one reader per output stream, and a
//! monitor that waits for the process to exit (or kills it on request),
//! drains the readers and records how the process ended.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::classify;
use super::env::build_environment;
use super::error::{codes, EngineFailure, InitializationError};
use super::log::{Diagnostics, LogBus, LogLineParser, LogSubscription, ParsedLine, StreamKind};
use super::port::{base_url, probe_free_port};
use super::protocol::{LogLevel, LogRecord};
use super::readiness::{poll_until_ready, GateState, ReadinessGate, ReadinessSentinel, ReadinessStrategy};
use super::resolver::{ensure_executable, BinaryResolver, Platform, SearchPathResolver};
use super::transport::{EngineTransport, HttpTransport};
use crate::config::{EngineConfig, SettingsError};

/// Tracing target under which engine log records are re-emitted.
pub const ENGINE_LOG_TARGET: &str = "engine_host::engine";

/// Bytes read from an output stream per call.
const READ_CHUNK: usize = 8 * 1024;

/// How long exit handling waits for the stream readers to reach EOF.
const READER_DRAIN: Duration = Duration::from_millis(500);

type StartFuture = Shared<BoxFuture<'static, Result<Arc<Incarnation>, InitializationError>>>;
type StopFuture = Shared<BoxFuture<'static, ()>>;

/// Lifecycle phase of the supervised engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnginePhase {
    NotStarted,
    Starting,
    Ready,
    Stopping,
    Stopped,
    /// Ended before it became ready.
    Failed,
    /// Ended unexpectedly after it became ready.
    Crashed,
}

impl EnginePhase {
    /// Whether the incarnation in this phase is over.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed | Self::Crashed)
    }
}

impl fmt::Display for EnginePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "not started",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Incarnation
// ============================================================================

#[derive(Debug)]
struct PendingEntry {
    cancel: CancellationToken,
    done: CancellationToken,
}

/// One spawn-to-exit lifetime of the engine process.
#[derive(Debug)]
pub struct Incarnation {
    generation: u64,
    port: u16,
    base_url: String,
    pid: Option<u32>,
    gate: ReadinessGate,
    phase: Mutex<EnginePhase>,
    failure: Mutex<Option<EngineFailure>>,
    diagnostics: Mutex<Diagnostics>,
    pending: Mutex<HashMap<Uuid, PendingEntry>>,
    /// Set when the supervisor is shutting the process down on purpose.
    exiting: AtomicBool,
    /// Set when the supervisor killed the process because of a fault.
    forced: AtomicBool,
    kill: CancellationToken,
    terminated: CancellationToken,
}

impl Incarnation {
    fn new(generation: u64, port: u16, pid: Option<u32>) -> Self {
        Self {
            generation,
            port,
            base_url: base_url(port),
            pid,
            gate: ReadinessGate::new(),
            phase: Mutex::new(EnginePhase::Starting),
            failure: Mutex::new(None),
            diagnostics: Mutex::new(Diagnostics::default()),
            pending: Mutex::new(HashMap::new()),
            exiting: AtomicBool::new(false),
            forced: AtomicBool::new(false),
            kill: CancellationToken::new(),
            terminated: CancellationToken::new(),
        }
    }

    /// Sequence number of this incarnation, starting at 1.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// OS process id assigned at spawn.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn phase(&self) -> EnginePhase {
        *self.phase.lock()
    }

    /// Where the readiness gate stands. It is settled from inside the crate only.
    pub fn gate_state(&self) -> GateState {
        self.gate.state()
    }

    /// The last fatal condition observed for this incarnation.
    pub fn last_failure(&self) -> Option<EngineFailure> {
        self.failure.lock().clone()
    }

    /// Unstructured output captured so far, stderr first.
    pub fn diagnostics(&self) -> String {
        self.diagnostics.lock().text()
    }

    /// Number of requests currently in flight.
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.is_cancelled()
    }

    /// Whether the process has been told to die but has not exited yet.
    pub fn is_dying(&self) -> bool {
        self.kill.is_cancelled() && !self.is_terminated()
    }

    /// Wait until the process has exited and its exit has been recorded.
    pub async fn wait_terminated(&self) {
        self.terminated.cancelled().await
    }

    /// Like [`wait_terminated`](Self::wait_terminated), bounded by `limit`.
    pub(crate) async fn settle(&self, limit: Duration) {
        let _ = tokio::time::timeout(limit, self.terminated.cancelled()).await;
    }

    /// Track a request so that a panic or shutdown can reach it.
    pub(crate) fn track(self: &Arc<Self>, id: Uuid, cancel: CancellationToken) -> PendingGuard {
        let done = CancellationToken::new();
        self.pending.lock().insert(
            id,
            PendingEntry {
                cancel: cancel.clone(),
                done: done.clone(),
            },
        );
        if self.kill.is_cancelled() {
            cancel.cancel();
        }
        PendingGuard {
            incarnation: Arc::clone(self),
            id,
            done,
        }
    }

    fn cancel_pending(&self) {
        for entry in self.pending.lock().values() {
            entry.cancel.cancel();
        }
    }

    fn pending_done(&self) -> Vec<CancellationToken> {
        self.pending.lock().values().map(|e| e.done.clone()).collect()
    }

    /// Store a failure. A panic is never replaced by a lesser failure.
    fn record_failure(&self, failure: EngineFailure) {
        let mut slot = self.failure.lock();
        match slot.as_ref() {
            Some(existing) if existing.is_panic && !failure.is_panic => {}
            _ => *slot = Some(failure),
        }
    }

    fn record_failure_if_absent(&self, failure: EngineFailure) {
        let mut slot = self.failure.lock();
        if slot.is_none() {
            *slot = Some(failure);
        }
    }

    /// Kill the process because of a fault.
    fn force_kill(&self) {
        self.forced.store(true, Ordering::SeqCst);
        self.kill.cancel();
    }

    /// Kill the process as part of an intentional shutdown.
    fn shut_down(&self) {
        self.exiting.store(true, Ordering::SeqCst);
        self.kill.cancel();
    }

    /// Move from Starting to Ready. Returns whether the incarnation is Ready.
    fn promote(&self) -> bool {
        let mut phase = self.phase.lock();
        if *phase == EnginePhase::Starting && self.gate.is_fulfilled() {
            *phase = EnginePhase::Ready;
        }
        *phase == EnginePhase::Ready
    }

    fn mark_ready(&self) -> bool {
        self.gate.fulfill() && self.promote()
    }

    fn begin_stopping(&self) {
        let mut phase = self.phase.lock();
        if matches!(*phase, EnginePhase::Starting | EnginePhase::Ready) {
            *phase = EnginePhase::Stopping;
        }
    }

    fn on_exit(&self, status: io::Result<ExitStatus>) {
        let intentional = self.exiting.load(Ordering::SeqCst);
        let forced = self.forced.load(Ordering::SeqCst);
        let exit = describe_exit(&status);
        let diagnostics = self.diagnostics();
        let prior = self.last_failure();

        let abnormal = status.as_ref().map_or(true, |s| !s.success());
        if abnormal && !intentional && !forced {
            let message = match diagnostics.trim() {
                "" => format!("engine exited with {exit}"),
                text => format!("engine exited with {exit}: {text}"),
            };
            self.record_failure_if_absent(EngineFailure::fatal(message));
        }

        if intentional {
            self.gate.reject(InitializationError::with_code(
                codes::ENGINE_STOPPED,
                "engine was stopped before it became ready",
            ));
        } else {
            self.gate.reject(classify::startup_failure(
                codes::ENGINE_EXITED,
                &format!("engine exited with {exit} before it became ready"),
                prior.as_ref(),
                &diagnostics,
            ));
        }

        let next = if intentional {
            EnginePhase::Stopped
        } else if self.gate.is_fulfilled() {
            EnginePhase::Crashed
        } else {
            EnginePhase::Failed
        };
        *self.phase.lock() = next;

        match next {
            EnginePhase::Stopped => info!(generation = self.generation, %exit, "engine stopped"),
            EnginePhase::Crashed if !forced => {
                error!(generation = self.generation, %exit, "engine exited unexpectedly")
            }
            _ => warn!(generation = self.generation, %exit, phase = %next, "engine process ended"),
        }
    }
}

/// Removes a request from its incarnation's in-flight set when dropped.
#[derive(Debug)]
pub(crate) struct PendingGuard {
    incarnation: Arc<Incarnation>,
    id: Uuid,
    done: CancellationToken,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.incarnation.pending.lock().remove(&self.id);
        self.done.cancel();
    }
}

fn describe_exit(status: &io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => {
            if let Some(code) = status.code() {
                return format!("exit code {code}");
            }
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                if let Some(signal) = status.signal() {
                    return format!("signal {signal}");
                }
            }
            "unknown status".to_string()
        }
        Err(e) => format!("unknown status ({e})"),
    }
}

// ============================================================================
// Log Routing
// ============================================================================

/// Dispatches parsed output lines of one incarnation.
#[derive(Debug, Clone)]
struct LogRouter {
    sentinel: ReadinessSentinel,
    sentinel_readiness: bool,
    logs: LogBus,
}

impl LogRouter {
    fn route(&self, incarnation: &Incarnation, stream: StreamKind, line: ParsedLine) {
        match line {
            ParsedLine::Noise => {}
            ParsedLine::Text(text) => {
                debug!(target: ENGINE_LOG_TARGET, %stream, "{text}");
                incarnation.diagnostics.lock().push(stream, &text);
            }
            ParsedLine::Record(record) => self.handle_record(incarnation, record),
        }
    }

    fn handle_record(&self, incarnation: &Incarnation, record: LogRecord) {
        emit(&record);

        if record.is_panic() {
            let summary = record.panic_summary();
            let backtrace = record.field_str("backtrace").map(str::to_string);
            error!(generation = incarnation.generation, panic = %summary, "engine panicked");

            let failure = EngineFailure::panic(summary, backtrace);
            incarnation.gate.reject(classify::startup_failure(
                codes::ENGINE_PANICKED,
                "engine panicked during startup",
                Some(&failure),
                "",
            ));
            incarnation.record_failure(failure);
            incarnation.force_kill();
            incarnation.cancel_pending();
        } else if self.sentinel.is_fatal(&record) {
            let message = record
                .message()
                .unwrap_or("engine reported a fatal error")
                .to_string();
            let failure = EngineFailure::fatal(message);
            if !incarnation.gate.is_settled() {
                incarnation.gate.reject(classify::startup_failure(
                    codes::ENGINE_FATAL,
                    "engine reported a fatal error during startup",
                    Some(&failure),
                    "",
                ));
            }
            incarnation.record_failure(failure);
        } else if self.sentinel_readiness && self.sentinel.matches(&record) && incarnation.mark_ready() {
            info!(
                generation = incarnation.generation,
                pid = incarnation.pid,
                url = %incarnation.base_url,
                "engine ready"
            );
        }

        self.logs.publish(record);
    }
}

/// Re-emit an engine record through tracing at its own level.
fn emit(record: &LogRecord) {
    let message = record.message().unwrap_or_default();
    let engine_target = record.target.as_str();
    match record.level {
        LogLevel::Debug => debug!(target: ENGINE_LOG_TARGET, engine_target, "{message}"),
        LogLevel::Info => info!(target: ENGINE_LOG_TARGET, engine_target, "{message}"),
        LogLevel::Warn => warn!(target: ENGINE_LOG_TARGET, engine_target, "{message}"),
        LogLevel::Error => error!(target: ENGINE_LOG_TARGET, engine_target, "{message}"),
    }
}

async fn read_stream<R>(router: LogRouter, incarnation: Arc<Incarnation>, mut stream: R, kind: StreamKind)
where
    R: AsyncRead + Unpin,
{
    let mut parser = LogLineParser::new();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for line in parser.push(&buf[..n]) {
                    router.route(&incarnation, kind, line);
                }
            }
            Err(e) => {
                debug!(stream = %kind, error = %e, "engine output stream failed");
                break;
            }
        }
    }

    if let Some(line) = parser.finish() {
        router.route(&incarnation, kind, line);
    }
}

async fn monitor(incarnation: Arc<Incarnation>, mut child: Child, readers: Vec<JoinHandle<()>>) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = incarnation.kill.cancelled() => None,
    };

    let status = match exited {
        Some(status) => status,
        None => {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "kill signal not delivered");
            }
            child.wait().await
        }
    };

    let drained = futures::future::join_all(readers);
    if tokio::time::timeout(READER_DRAIN, drained).await.is_err() {
        debug!(generation = incarnation.generation, "engine output still open after exit");
    }

    incarnation.on_exit(status);
    incarnation.terminated.cancel();
}

// ============================================================================
// Supervisor
// ============================================================================

struct StartHandle {
    generation: u64,
    abort: CancellationToken,
    future: StartFuture,
}

#[derive(Default)]
struct SupervisorState {
    current: Option<Arc<Incarnation>>,
    starting: Option<StartHandle>,
    stopping: Option<StopFuture>,
}

/// What [`EngineSupervisor::acquire`] has to wait for next.
enum Step {
    Stopping(StopFuture),
    Dying(Arc<Incarnation>),
    Start(StartFuture),
}

struct SupervisorInner {
    config: EngineConfig,
    resolver: Arc<dyn BinaryResolver>,
    transport: Arc<dyn EngineTransport>,
    platform: Platform,
    strategy: ReadinessStrategy,
    router: LogRouter,
    shutdown_grace: Duration,
    state: Mutex<SupervisorState>,
    generation: AtomicU64,
}

impl SupervisorInner {
    async fn launch(
        self: Arc<Self>,
        generation: u64,
        abort: CancellationToken,
    ) -> Result<Arc<Incarnation>, InitializationError> {
        let stopped = || {
            InitializationError::with_code(
                codes::ENGINE_STOPPED,
                "engine was stopped before it became ready",
            )
        };

        if !self.platform.is_supported() {
            return Err(InitializationError::with_code(
                codes::UNSUPPORTED_PLATFORM,
                format!("platform {} is not supported", self.platform),
            ));
        }
        if !self.config.cwd.is_dir() {
            return Err(InitializationError::with_code(
                codes::INVALID_CONFIG,
                format!("working directory {} does not exist", self.config.cwd.display()),
            ));
        }

        let binary = self
            .resolver
            .resolve(&self.platform)
            .map_err(|e| classify::resolve_failure(&e))?;
        ensure_executable(&binary).map_err(|e| classify::resolve_failure(&e))?;

        let port = probe_free_port().await.map_err(|e| {
            InitializationError::with_code(
                codes::PORT_UNAVAILABLE,
                format!("failed to reserve a local port: {e}"),
            )
        })?;
        let environment = build_environment(&self.config, port)
            .map_err(|e| InitializationError::with_code(codes::INVALID_CONFIG, e.to_string()))?;

        if abort.is_cancelled() {
            return Err(stopped());
        }

        let mut child = Command::new(&binary)
            .arg("--port")
            .arg(port.to_string())
            .args(&self.config.args)
            .current_dir(&self.config.cwd)
            .env_clear()
            .envs(&environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| classify::spawn_failure(&binary, &e))?;

        let incarnation = Arc::new(Incarnation::new(generation, port, child.id()));
        info!(
            generation,
            pid = incarnation.pid,
            port,
            binary = %binary.display(),
            "engine process spawned"
        );
        self.state.lock().current = Some(Arc::clone(&incarnation));

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(read_stream(
                self.router.clone(),
                Arc::clone(&incarnation),
                stdout,
                StreamKind::Stdout,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(read_stream(
                self.router.clone(),
                Arc::clone(&incarnation),
                stderr,
                StreamKind::Stderr,
            )));
        }
        tokio::spawn(monitor(Arc::clone(&incarnation), child, readers));

        let ready = async {
            match &self.strategy {
                ReadinessStrategy::LogSentinel => incarnation.gate.wait().await,
                ReadinessStrategy::Polling {
                    interval,
                    max_attempts,
                } => {
                    poll_until_ready(
                        self.transport.as_ref(),
                        &incarnation.base_url,
                        &incarnation.gate,
                        *interval,
                        *max_attempts,
                    )
                    .await
                }
            }
        };

        let outcome = tokio::select! {
            outcome = ready => outcome,
            _ = abort.cancelled() => {
                incarnation.gate.reject(stopped());
                incarnation.shut_down();
                Err(stopped())
            }
        };

        match outcome {
            Ok(()) if incarnation.promote() => {
                debug!(generation, "engine start complete");
                Ok(incarnation)
            }
            Ok(()) => {
                incarnation.wait_terminated().await;
                Err(classify::startup_failure(
                    codes::ENGINE_EXITED,
                    "engine exited right after it became ready",
                    incarnation.last_failure().as_ref(),
                    &incarnation.diagnostics(),
                ))
            }
            Err(err) => {
                warn!(generation, error = %err, "engine failed to start");
                incarnation.force_kill();
                incarnation.wait_terminated().await;
                Err(err)
            }
        }
    }

    /// Register a new start attempt. The caller holds the state lock.
    fn begin_start(self: &Arc<Self>, state: &mut SupervisorState) -> StartFuture {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let abort = CancellationToken::new();
        let inner = Arc::clone(self);
        let task_abort = abort.clone();

        let task = tokio::spawn(async move {
            let outcome = Arc::clone(&inner).launch(generation, task_abort).await;
            inner.finish_start(generation);
            outcome
        });
        let future = task
            .map(|joined| {
                joined.unwrap_or_else(|e| {
                    Err(InitializationError::with_code(
                        codes::SPAWN_FAILED,
                        format!("engine start task failed: {e}"),
                    ))
                })
            })
            .boxed()
            .shared();

        state.starting = Some(StartHandle {
            generation,
            abort,
            future: future.clone(),
        });
        future
    }

    /// Shut down whatever is running or starting.
    async fn halt(&self) {
        let start = {
            let state = self.state.lock();
            state.starting.as_ref().map(|handle| {
                handle.abort.cancel();
                handle.future.clone()
            })
        };
        if let Some(start) = start {
            let _ = start.await;
        }

        let Some(incarnation) = self.state.lock().current.clone() else {
            return;
        };
        if incarnation.is_terminated() {
            return;
        }

        incarnation.begin_stopping();

        let pending = incarnation.pending_done();
        if !pending.is_empty() {
            debug!(count = pending.len(), "waiting for in-flight requests");
            let drained = futures::future::join_all(pending.iter().map(|t| t.cancelled()));
            if tokio::time::timeout(self.shutdown_grace, drained).await.is_err() {
                warn!(
                    grace = ?self.shutdown_grace,
                    "in-flight requests still running, stopping engine anyway"
                );
            }
        }

        incarnation.shut_down();
        incarnation.cancel_pending();
        incarnation.wait_terminated().await;
    }

    fn finish_start(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.starting.as_ref().is_some_and(|s| s.generation == generation) {
            state.starting = None;
        }
    }
}

impl Drop for SupervisorInner {
    fn drop(&mut self) {
        if let Some(incarnation) = self.state.get_mut().current.take() {
            if !incarnation.is_terminated() {
                incarnation.shut_down();
            }
        }
    }
}

/// Supervises the engine process and hands out ready incarnations.
///
/// Cloning is cheap; clones share the same process.
///
/// # Example
///
/// ```ignore
/// use engine_host::{EngineConfig, EngineSupervisor};
///
/// let supervisor = EngineSupervisor::new(EngineConfig::load()?)?;
/// supervisor.ensure_started().await?;
/// println!("engine listening on {:?}", supervisor.base_url());
/// supervisor.stop().await;
/// ```
#[derive(Clone)]
pub struct EngineSupervisor {
    inner: Arc<SupervisorInner>,
}

impl fmt::Debug for EngineSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineSupervisor")
            .field("platform", &self.inner.platform)
            .field("strategy", &self.inner.strategy)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl EngineSupervisor {
    /// Create a supervisor that searches for the binary and talks HTTP.
    pub fn new(config: EngineConfig) -> Result<Self, SettingsError> {
        Self::builder(config).build()
    }

    pub fn builder(config: EngineConfig) -> EngineSupervisorBuilder {
        EngineSupervisorBuilder {
            config,
            resolver: None,
            transport: None,
            platform: None,
            log_capacity: super::log::DEFAULT_LOG_CAPACITY,
        }
    }

    /// Start the engine unless it already runs, and wait until it is ready.
    ///
    /// Concurrent callers share one start attempt and observe the same
    /// outcome. Once ready, further calls return immediately.
    pub async fn ensure_started(&self) -> Result<(), InitializationError> {
        self.acquire().await.map(|_| ())
    }

    /// The ready incarnation, starting one if needed.
    ///
    /// A start never overlaps a stop or a dying process: it waits until the
    /// previous incarnation has terminated before spawning.
    pub(crate) async fn acquire(&self) -> Result<Arc<Incarnation>, InitializationError> {
        loop {
            let step = {
                let mut state = self.inner.state.lock();
                if let Some(stopping) = &state.stopping {
                    Step::Stopping(stopping.clone())
                } else if let Some(handle) = &state.starting {
                    Step::Start(handle.future.clone())
                } else {
                    match state.current.clone() {
                        Some(current) if current.phase() == EnginePhase::Ready && !current.is_dying() => {
                            return Ok(current);
                        }
                        Some(current) if current.is_dying() => Step::Dying(current),
                        _ => Step::Start(self.inner.begin_start(&mut state)),
                    }
                }
            };

            match step {
                Step::Stopping(stopping) => stopping.await,
                Step::Dying(incarnation) => incarnation.wait_terminated().await,
                Step::Start(start) => return start.await,
            }
        }
    }

    /// Stop the engine.
    ///
    /// Aborts a start in progress, gives in-flight requests up to the
    /// configured grace period, then kills the process and waits for it to
    /// exit. Concurrent calls share one shutdown, and starts requested in
    /// the meantime wait for it to finish. Safe to call any number of times.
    pub async fn stop(&self) {
        let stopping = {
            let mut state = self.inner.state.lock();
            match &state.stopping {
                Some(stopping) => stopping.clone(),
                None => {
                    let inner = Arc::clone(&self.inner);
                    let task = tokio::spawn(async move {
                        inner.halt().await;
                        inner.state.lock().stopping = None;
                    });
                    let stopping = task
                        .map(|joined| {
                            if let Err(e) = joined {
                                error!(error = %e, "engine stop task failed");
                            }
                        })
                        .boxed()
                        .shared();
                    state.stopping = Some(stopping.clone());
                    stopping
                }
            }
        };
        stopping.await
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> EnginePhase {
        let state = self.inner.state.lock();
        match (&state.current, &state.starting) {
            (Some(current), _) if !current.phase().is_terminal() => current.phase(),
            (_, Some(_)) => EnginePhase::Starting,
            (Some(current), None) => current.phase(),
            (None, None) => EnginePhase::NotStarted,
        }
    }

    /// Base URL of the engine, available only while it is ready.
    pub fn base_url(&self) -> Option<String> {
        self.incarnation()
            .filter(|i| i.phase() == EnginePhase::Ready)
            .map(|i| i.base_url.clone())
    }

    /// OS process id while the process runs.
    pub fn pid(&self) -> Option<u32> {
        self.incarnation()
            .filter(|i| !i.is_terminated())
            .and_then(|i| i.pid)
    }

    /// Most recent failure of the current incarnation.
    pub fn last_failure(&self) -> Option<EngineFailure> {
        self.incarnation().and_then(|i| i.last_failure())
    }

    /// Unstructured output of the current incarnation.
    pub fn diagnostics(&self) -> String {
        self.incarnation()
            .map(|i| i.diagnostics())
            .unwrap_or_default()
    }

    /// The latest incarnation, live or not.
    pub fn incarnation(&self) -> Option<Arc<Incarnation>> {
        self.inner.state.lock().current.clone()
    }

    /// Subscribe to engine log records of the given levels.
    ///
    /// Subscriptions survive restarts.
    pub fn subscribe_logs(&self, levels: impl IntoIterator<Item = LogLevel>) -> LogSubscription {
        self.inner.router.logs.subscribe(levels)
    }

    pub fn subscribe_all_logs(&self) -> LogSubscription {
        self.subscribe_logs(LogLevel::ALL)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn platform(&self) -> &Platform {
        &self.inner.platform
    }

    pub fn transport(&self) -> Arc<dyn EngineTransport> {
        Arc::clone(&self.inner.transport)
    }
}

/// Builder for [`EngineSupervisor`].
pub struct EngineSupervisorBuilder {
    config: EngineConfig,
    resolver: Option<Arc<dyn BinaryResolver>>,
    transport: Option<Arc<dyn EngineTransport>>,
    platform: Option<Platform>,
    log_capacity: usize,
}

impl EngineSupervisorBuilder {
    /// Use `resolver` to locate the engine binary.
    pub fn resolver(mut self, resolver: impl BinaryResolver + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// Use `transport` for batches and status probes.
    pub fn transport(mut self, transport: impl EngineTransport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Override the detected platform.
    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Records buffered per log subscriber.
    pub fn log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<EngineSupervisor, SettingsError> {
        self.config.validate()?;
        let strategy = ReadinessStrategy::from_settings(&self.config.readiness)?;
        let shutdown_grace = self.config.shutdown_grace()?;

        let resolver = match self.resolver {
            Some(resolver) => resolver,
            None => Arc::new(SearchPathResolver::from_config(&self.config)?),
        };
        let transport = match self.transport {
            Some(transport) => transport,
            None => {
                let client = HttpTransport::new(self.config.request_timeout()?).map_err(|e| {
                    SettingsError::InvalidConfig(format!("cannot build HTTP client: {e}"))
                })?;
                Arc::new(client)
            }
        };

        let router = LogRouter {
            sentinel: ReadinessSentinel::from(&self.config.sentinel),
            sentinel_readiness: strategy == ReadinessStrategy::LogSentinel,
            logs: LogBus::new(self.log_capacity),
        };

        Ok(EngineSupervisor {
            inner: Arc::new(SupervisorInner {
                config: self.config,
                resolver,
                transport,
                platform: self.platform.unwrap_or_else(Platform::current),
                strategy,
                router,
                shutdown_grace,
                state: Mutex::new(SupervisorState::default()),
                generation: AtomicU64::new(0),
            }),
        })
    }
}
