//! The connection facade: owns at most one active backend, picks it, and
//! funnels every command through it.
//!
//! State machine: `Idle -> Connecting -> Connected -> {Idle, Failed}`, and
//! `Failed -> Connecting` only through an explicit `connect`/`reconnect`.
//! Nothing here retries on its own; `connect_with_retry` is an opt-in
//! wrapper around whole connect attempts.

use std::fmt;
use std::time::{Duration, Instant};

use cadlink_protocol::{Command, Params, Response, PROBE_COMMAND};
use parking_lot::Mutex;

use crate::backend::{
    check_response_id, Backend, BackendKind, CliPerCallBackend, DirectImportBackend, ScriptLaunchBackend,
    SimulationBackend, SocketBackend,
};
use crate::config::{ConnectionConfig, ConnectionMethod};
use crate::error::{Error, ErrorKind, Result};
use crate::retry::RetryPolicy;

/// How far past its deadline a backend may return before the manager
/// discards the result as a timeout.
const OVERRUN_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        })
    }
}

/// What happened to one candidate during the last connect pass.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Unavailable,
    /// Skipped because simulation fallback is disabled.
    Disabled,
    Failed(String),
    Connected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attempt {
    pub kind: BackendKind,
    pub outcome: AttemptOutcome,
}

/// Snapshot returned by [`ConnectionManager::status`].
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub state: ConnectionState,
    pub active_backend: Option<BackendKind>,
    pub last_error: Option<String>,
    pub last_error_kind: Option<ErrorKind>,
    pub attempts: Vec<Attempt>,
}

impl Status {
    fn idle() -> Self {
        Self {
            state: ConnectionState::Idle,
            active_backend: None,
            last_error: None,
            last_error_kind: None,
            attempts: Vec::new(),
        }
    }
}

/// Backends plus the per-connection command counter. Guarded by one lock so
/// commands on the active transport never interleave.
struct Channel {
    backends: Vec<Box<dyn Backend>>,
    active: Option<usize>,
    next_id: u64,
    last_request: Option<BackendKind>,
}

/// Caller-owned connection to the engine.
///
/// Safe to share across threads; calls are serialized internally, so a
/// long `execute` blocks other `execute`/`connect` callers but never
/// `status()`.
pub struct ConnectionManager {
    config: ConnectionConfig,
    channel: Mutex<Channel>,
    status: Mutex<Status>,
}

impl ConnectionManager {
    /// Manager with the five real backends, configured from `config`.
    pub fn new(config: ConnectionConfig) -> Self {
        let backends: Vec<Box<dyn Backend>> = vec![
            Box::new(ScriptLaunchBackend::new(config.clone())),
            Box::new(DirectImportBackend::new(config.clone())),
            Box::new(SocketBackend::new(&config)),
            Box::new(CliPerCallBackend::new(config.clone())),
            Box::new(SimulationBackend::new()),
        ];
        Self::with_backends(config, backends)
    }

    /// Manager over an explicit candidate set. The first backend of each
    /// kind is the one used for that kind.
    pub fn with_backends(config: ConnectionConfig, backends: Vec<Box<dyn Backend>>) -> Self {
        Self {
            config,
            channel: Mutex::new(Channel {
                backends,
                active: None,
                next_id: 1,
                last_request: None,
            }),
            status: Mutex::new(Status::idle()),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn status(&self) -> Status {
        self.status.lock().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.lock().state
    }

    pub fn active_backend(&self) -> Option<BackendKind> {
        self.status.lock().active_backend
    }

    /// Connect using `preferred`, or the configured method when `None`.
    ///
    /// Only valid from `Idle` or `Failed`.
    pub fn connect(&self, preferred: Option<BackendKind>) -> Result<BackendKind> {
        let mut channel = self.channel.lock();
        self.connect_locked(&mut channel, preferred)
    }

    /// Tear down whatever is active and connect again with the last
    /// requested method.
    pub fn reconnect(&self) -> Result<BackendKind> {
        let mut channel = self.channel.lock();
        self.disconnect_locked(&mut channel);
        let preferred = channel.last_request;
        self.connect_locked(&mut channel, preferred)
    }

    /// `connect` wrapped in the configured [`RetryPolicy`]. Every failed
    /// attempt is visible through `status()` before the next one starts.
    pub fn connect_with_retry(&self, preferred: Option<BackendKind>) -> Result<BackendKind> {
        let policy = if self.config.reconnect_on_failure {
            self.config.retry_policy()
        } else {
            RetryPolicy::none()
        };
        policy.run(
            |e| e.is_transport() || matches!(e, Error::NoBackendAvailable { .. }),
            |_| self.connect(preferred),
        )
    }

    /// Send one command through the active backend.
    ///
    /// `Err(Error::Command)` leaves the connection usable; any transport
    /// error releases the backend and leaves the manager `Failed`.
    pub fn execute(&self, name: &str, params: Params, timeout: Duration) -> Result<Response> {
        let mut channel = self.channel.lock();

        let state = self.state();
        let idx = match (state, channel.active) {
            (ConnectionState::Connected, Some(idx)) => idx,
            _ => return Err(Error::NotConnected { state }),
        };

        let command = Command::new(channel.next_id, name, params);
        channel.next_id += 1;

        let backend = &mut channel.backends[idx];
        let kind = backend.kind();
        tracing::debug!(backend = %kind, id = command.id, command = %command.command, "execute");

        let started = Instant::now();
        let outcome = backend.execute(&command, timeout);
        let elapsed = started.elapsed();

        let outcome = match outcome {
            Ok(_) if elapsed > timeout + OVERRUN_GRACE => Err(Error::Timeout(timeout)),
            Ok(response) => check_response_id(&command, &response).map(|()| response),
            other => other,
        };

        match outcome {
            Ok(response) if response.success => Ok(response),
            Ok(response) => {
                let message = response.error.unwrap_or_default();
                tracing::debug!(backend = %kind, id = command.id, "command rejected: {}", message);
                Err(Error::Command {
                    id: command.id,
                    message,
                })
            }
            Err(e) if e.is_transport() => {
                tracing::warn!(backend = %kind, id = command.id, "transport failure: {}", e);
                backend.abort();
                channel.active = None;
                self.fail(&e, None);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// `execute` with the configured default timeout.
    pub fn execute_default(&self, name: &str, params: Params) -> Result<Response> {
        self.execute(name, params, self.config.command_timeout())
    }

    /// Send the liveness probe as a regular command.
    pub fn ping(&self, timeout: Duration) -> Result<Response> {
        self.execute(PROBE_COMMAND, Params::new(), timeout)
    }

    /// Release the active backend and return to `Idle`. Idempotent.
    pub fn disconnect(&self) {
        let mut channel = self.channel.lock();
        self.disconnect_locked(&mut channel);
    }

    fn disconnect_locked(&self, channel: &mut Channel) {
        if let Some(idx) = channel.active.take() {
            let backend = &mut channel.backends[idx];
            backend.disconnect();
            tracing::info!(backend = %backend.kind(), "disconnected");
        }
        let mut status = self.status.lock();
        status.state = ConnectionState::Idle;
        status.active_backend = None;
    }

    fn connect_locked(
        &self,
        channel: &mut Channel,
        preferred: Option<BackendKind>,
    ) -> Result<BackendKind> {
        {
            let mut status = self.status.lock();
            match status.state {
                ConnectionState::Idle | ConnectionState::Failed => {}
                state => {
                    return Err(Error::InvalidState {
                        operation: "connect",
                        state,
                    })
                }
            }
            status.state = ConnectionState::Connecting;
            status.active_backend = None;
            status.attempts.clear();
        }
        channel.last_request = preferred;

        let method = match preferred {
            Some(kind) => ConnectionMethod::Only(kind),
            None => self.config.effective_method(),
        };
        let mut attempts = Vec::new();
        let result = match method {
            ConnectionMethod::Only(kind) => self.connect_single(channel, kind, &mut attempts),
            ConnectionMethod::Auto => self.connect_auto(channel, &mut attempts),
        };

        match result {
            Ok(idx) => {
                let kind = channel.backends[idx].kind();
                channel.active = Some(idx);
                channel.next_id = 1;
                let mut status = self.status.lock();
                status.state = ConnectionState::Connected;
                status.active_backend = Some(kind);
                status.last_error = None;
                status.last_error_kind = None;
                status.attempts = attempts;
                tracing::info!(backend = %kind, "connected");
                Ok(kind)
            }
            Err(e) => {
                tracing::warn!("connect failed: {}", e);
                self.fail(&e, Some(attempts));
                Err(e)
            }
        }
    }

    fn connect_single(
        &self,
        channel: &mut Channel,
        kind: BackendKind,
        attempts: &mut Vec<Attempt>,
    ) -> Result<usize> {
        let idx = find_backend(channel, kind).ok_or_else(|| {
            Error::Config(format!("no {kind} backend registered with this manager"))
        })?;
        match self.try_backend(channel, idx) {
            Ok(()) => {
                attempts.push(Attempt {
                    kind,
                    outcome: AttemptOutcome::Connected,
                });
                Ok(idx)
            }
            Err(e) => {
                attempts.push(Attempt {
                    kind,
                    outcome: AttemptOutcome::Failed(e.to_string()),
                });
                Err(e)
            }
        }
    }

    /// Walk the auto order, stopping at the first backend that connects and
    /// answers the probe. Candidate failures are collected, not surfaced.
    fn connect_auto(&self, channel: &mut Channel, attempts: &mut Vec<Attempt>) -> Result<usize> {
        let mut order = self.config.auto_order.clone();
        if self.config.allow_simulation_fallback && !order.contains(&BackendKind::Simulation) {
            order.push(BackendKind::Simulation);
        }

        let mut failures = Vec::new();
        let mut tried = Vec::new();
        for kind in order {
            if tried.contains(&kind) {
                continue;
            }
            tried.push(kind);

            let Some(idx) = find_backend(channel, kind) else {
                continue;
            };
            if kind == BackendKind::Simulation && !self.config.allow_simulation_fallback {
                attempts.push(Attempt {
                    kind,
                    outcome: AttemptOutcome::Disabled,
                });
                failures.push((kind, "simulation fallback disabled".to_string()));
                continue;
            }
            if !channel.backends[idx].is_available() {
                tracing::debug!(backend = %kind, "not available, skipping");
                attempts.push(Attempt {
                    kind,
                    outcome: AttemptOutcome::Unavailable,
                });
                failures.push((kind, "not available".to_string()));
                continue;
            }

            tracing::info!(backend = %kind, "trying backend");
            match self.try_backend(channel, idx) {
                Ok(()) => {
                    attempts.push(Attempt {
                        kind,
                        outcome: AttemptOutcome::Connected,
                    });
                    return Ok(idx);
                }
                Err(e) => {
                    tracing::info!(backend = %kind, "candidate failed: {}", e);
                    attempts.push(Attempt {
                        kind,
                        outcome: AttemptOutcome::Failed(e.to_string()),
                    });
                    failures.push((kind, e.to_string()));
                }
            }
        }

        Err(Error::NoBackendAvailable { attempts: failures })
    }

    /// Connect one backend and confirm it answers the probe. On failure the
    /// backend's resources are released before returning.
    fn try_backend(&self, channel: &mut Channel, idx: usize) -> Result<()> {
        let backend = &mut channel.backends[idx];
        let kind = backend.kind();

        if let Err(e) = backend.connect() {
            backend.abort();
            return Err(as_connection_error(kind, e));
        }

        let probe_timeout = self.probe_timeout(kind);
        let probe = backend.execute(&Command::probe(), probe_timeout);
        match probe {
            Ok(response) if response.success => Ok(()),
            Ok(response) => {
                backend.abort();
                Err(Error::connection(
                    kind,
                    format!(
                        "liveness probe rejected: {}",
                        response.error.unwrap_or_default()
                    ),
                ))
            }
            Err(e) => {
                backend.abort();
                Err(Error::connection(kind, format!("liveness probe failed: {e}")))
            }
        }
    }

    fn probe_timeout(&self, kind: BackendKind) -> Duration {
        if kind.spawns_process() {
            self.config.startup_timeout()
        } else {
            self.config.probe_timeout()
        }
    }

    fn fail(&self, error: &Error, attempts: Option<Vec<Attempt>>) {
        let mut status = self.status.lock();
        status.state = ConnectionState::Failed;
        status.active_backend = None;
        status.last_error = Some(error.to_string());
        status.last_error_kind = Some(error.kind());
        if let Some(attempts) = attempts {
            status.attempts = attempts;
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let channel = self.channel.get_mut();
        if let Some(idx) = channel.active.take() {
            channel.backends[idx].disconnect();
        }
    }
}

fn find_backend(channel: &Channel, kind: BackendKind) -> Option<usize> {
    channel.backends.iter().position(|b| b.kind() == kind)
}

fn as_connection_error(kind: BackendKind, e: Error) -> Error {
    match e {
        Error::Connection { .. } => e,
        other => Error::connection(kind, other.to_string()),
    }
}
