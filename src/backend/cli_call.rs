use std::path::{Path, PathBuf};
use std::time::Duration;

use cadlink_protocol::{last_response_in, Command, Response};
use tempfile::TempDir;

use super::process::{EngineProcess, LaunchSpec};
use super::{check_response_id, resolve_executable, scripts, Backend, BackendDescriptor, BackendKind, BRIDGE};
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};

/// Runs the engine's command-line executable once per command.
///
/// Nothing persists between calls, so every `execute()` pays the full
/// engine startup cost. Timeouts passed to `execute()` must cover startup,
/// not just the command itself.
pub struct CliPerCallBackend {
    config: ConnectionConfig,
    executable: Option<PathBuf>,
    scratch: Option<TempDir>,
    last_pid: Option<u32>,
}

impl CliPerCallBackend {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            executable: None,
            scratch: None,
            last_pid: None,
        }
    }

    /// Pid of the most recent per-call process (already exited by the time
    /// `execute()` returns).
    pub fn last_pid(&self) -> Option<u32> {
        self.last_pid
    }

    fn write_script(&self, command: &Command) -> Result<PathBuf> {
        let dir = self
            .scratch
            .as_ref()
            .ok_or_else(|| Error::connection(BackendKind::Bridge, "not connected"))?;
        let path = dir.path().join(format!("command-{}.py", command.id));
        std::fs::write(&path, scripts::per_call_script(command)).map_err(|e| {
            Error::connection(BackendKind::Bridge, format!("cannot write command script: {e}"))
        })?;
        Ok(path)
    }

    fn run(&mut self, exe: PathBuf, script: &Path, command: &Command, timeout: Duration) -> Result<Response> {
        let spec = LaunchSpec::new(exe)
            .arg(script)
            .envs(&self.config.child_env);
        let mut process = EngineProcess::spawn(BackendKind::Bridge, &spec).map_err(|e| {
            Error::connection(
                BackendKind::Bridge,
                format!("failed to start {}: {e}", spec.program.display()),
            )
        })?;
        self.last_pid = Some(process.pid());

        let (output, status) = match process.collect_output(timeout) {
            Ok(done) => done,
            Err(e) => {
                process.kill();
                return Err(e);
            }
        };

        match last_response_in(&output) {
            Some(response) => {
                check_response_id(command, &response)?;
                Ok(response)
            }
            None if !status.success() => {
                Err(process.crash_error("engine exited without printing a response"))
            }
            None => Err(Error::Protocol(
                "engine exited cleanly but printed no response record".into(),
            )),
        }
    }
}

impl Backend for CliPerCallBackend {
    fn descriptor(&self) -> &'static BackendDescriptor {
        &BRIDGE
    }

    fn is_available(&self) -> bool {
        self.config
            .path
            .as_ref()
            .is_some_and(|p| resolve_executable(p).is_some())
    }

    fn connect(&mut self) -> Result<()> {
        self.disconnect();

        let configured = self
            .config
            .path
            .clone()
            .ok_or_else(|| Error::connection(BackendKind::Bridge, "no engine executable configured"))?;
        let exe = resolve_executable(&configured).ok_or_else(|| {
            Error::connection(
                BackendKind::Bridge,
                format!("engine executable not found: {}", configured.display()),
            )
        })?;
        let scratch = tempfile::Builder::new()
            .prefix("cadlink-bridge-")
            .tempdir()
            .map_err(|e| Error::connection(BackendKind::Bridge, format!("cannot create scratch dir: {e}")))?;

        tracing::info!(backend = %BackendKind::Bridge, exe = %exe.display(), "using per-call engine executable");
        self.executable = Some(exe);
        self.scratch = Some(scratch);
        Ok(())
    }

    fn execute(&mut self, command: &Command, timeout: Duration) -> Result<Response> {
        let exe = self
            .executable
            .clone()
            .ok_or_else(|| Error::connection(BackendKind::Bridge, "not connected"))?;
        let script = self.write_script(command)?;
        let result = self.run(exe, &script, command, timeout);
        let _ = std::fs::remove_file(&script);
        result
    }

    fn disconnect(&mut self) {
        self.executable = None;
        self.scratch = None;
    }

    fn is_connected(&self) -> bool {
        self.executable.is_some()
    }
}
