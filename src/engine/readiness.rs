//! Startup readiness detection.
//!
//! Every engine incarnation owns one [`ReadinessGate`]. It settles exactly
//! once: fulfilled when the engine is known to accept connections, or
//! rejected when it exits, panics or gives up first. How fulfilment is
//! detected is the [`ReadinessStrategy`]: either the sentinel log record, or
//! repeated probes of the engine's status endpoint.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use super::error::{codes, InitializationError};
use super::protocol::LogRecord;
use super::transport::EngineTransport;
use crate::config::{parse_duration, ReadinessSettings, SentinelSettings, SettingsError};

/// Settlement state of a [`ReadinessGate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateState {
    Pending,
    Fulfilled,
    Rejected(InitializationError),
}

/// One-shot completion signal shared by everything waiting on a start.
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    state: Arc<watch::Sender<GateState>>,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    pub fn new() -> Self {
        let (state, _) = watch::channel(GateState::Pending);
        Self {
            state: Arc::new(state),
        }
    }

    /// Settle successfully. Returns `false` if the gate had already settled.
    pub(crate) fn fulfill(&self) -> bool {
        self.settle(GateState::Fulfilled)
    }

    /// Settle with a failure. Returns `false` if the gate had already settled.
    pub(crate) fn reject(&self, error: InitializationError) -> bool {
        self.settle(GateState::Rejected(error))
    }

    fn settle(&self, outcome: GateState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == GateState::Pending {
                *state = outcome;
                true
            } else {
                false
            }
        })
    }

    pub fn state(&self) -> GateState {
        self.state.borrow().clone()
    }

    pub fn is_settled(&self) -> bool {
        *self.state.borrow() != GateState::Pending
    }

    pub fn is_fulfilled(&self) -> bool {
        *self.state.borrow() == GateState::Fulfilled
    }

    /// Wait until the gate settles and return its outcome.
    pub async fn wait(&self) -> Result<(), InitializationError> {
        let mut receiver = self.state.subscribe();
        let settled = match receiver.wait_for(|s| *s != GateState::Pending).await {
            Ok(state) => state.clone(),
            Err(_) => GateState::Pending,
        };

        match settled {
            GateState::Fulfilled => Ok(()),
            GateState::Rejected(error) => Err(error),
            GateState::Pending => Err(InitializationError::new(
                "readiness gate closed before settling",
            )),
        }
    }
}

/// Identifies the log record announcing that the engine listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessSentinel {
    pub target: String,
    pub message_prefix: String,
}

impl ReadinessSentinel {
    /// Whether `record` is the readiness sentinel.
    pub fn matches(&self, record: &LogRecord) -> bool {
        record.target == self.target
            && record
                .message()
                .is_some_and(|m| m.starts_with(&self.message_prefix))
    }

    /// Whether `record` is a fatal report from the engine's server component.
    pub fn is_fatal(&self, record: &LogRecord) -> bool {
        record.level == super::protocol::LogLevel::Error && record.target == self.target
    }
}

impl From<&SentinelSettings> for ReadinessSentinel {
    fn from(settings: &SentinelSettings) -> Self {
        Self {
            target: settings.target.clone(),
            message_prefix: settings.message_prefix.clone(),
        }
    }
}

/// How the supervisor learns that a fresh engine is ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessStrategy {
    /// Wait for the sentinel record on the log stream; no timeout.
    LogSentinel,
    /// Probe the status endpoint every `interval`, at most `max_attempts` times.
    Polling { interval: Duration, max_attempts: u32 },
}

impl ReadinessStrategy {
    pub fn from_settings(settings: &ReadinessSettings) -> Result<Self, SettingsError> {
        match settings {
            ReadinessSettings::LogSentinel => Ok(Self::LogSentinel),
            ReadinessSettings::Polling {
                interval,
                max_attempts,
            } => Ok(Self::Polling {
                interval: parse_duration(interval)?,
                max_attempts: *max_attempts,
            }),
        }
    }
}

/// Probe `base_url` until it answers, the gate settles, or attempts run out.
///
/// A successful probe fulfils the gate; exhausting the attempts rejects it.
/// Either way the gate's final outcome is returned, so an exit that raced the
/// last probe still wins.
pub async fn poll_until_ready(
    transport: &dyn EngineTransport,
    base_url: &str,
    gate: &ReadinessGate,
    interval: Duration,
    max_attempts: u32,
) -> Result<(), InitializationError> {
    for attempt in 1..=max_attempts {
        if gate.is_settled() {
            break;
        }

        match transport.probe(base_url).await {
            Ok(()) => {
                gate.fulfill();
                break;
            }
            Err(error) => debug!(attempt, %error, "engine not ready yet"),
        }

        if attempt < max_attempts {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = gate.wait() => break,
            }
        }
    }

    gate.reject(InitializationError::with_code(
        codes::ENGINE_NOT_READY,
        format!("engine process did not become ready after {max_attempts} status probes"),
    ));
    gate.wait().await
}
