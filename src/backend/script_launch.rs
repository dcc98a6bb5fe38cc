use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use cadlink_protocol::{Command, Response};
use tempfile::TempPath;

use super::process::{EngineProcess, LaunchSpec};
use super::{resolve_executable, scripts, Backend, BackendDescriptor, BackendKind, LAUNCHER};
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};

/// Starts the engine through its launcher (optionally from an extracted
/// application bundle) running the companion script, and talks to it over
/// the child's stdin/stdout.
pub struct ScriptLaunchBackend {
    config: ConnectionConfig,
    process: Option<EngineProcess>,
    /// Built-in companion written out when no `script_path` is configured.
    companion: Option<TempPath>,
}

impl ScriptLaunchBackend {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            process: None,
            companion: None,
        }
    }

    /// Executable that gets spawned: the bundle's AppRun or the launcher.
    fn program(&self) -> Option<&PathBuf> {
        if self.config.use_apprun {
            self.config.apprun_path.as_ref()
        } else {
            self.config.launcher_path.as_ref()
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(EngineProcess::pid)
    }

    fn companion_path(&mut self) -> Result<PathBuf> {
        if let Some(path) = &self.config.script_path {
            return Ok(path.clone());
        }
        let mut file = tempfile::Builder::new()
            .prefix("cadlink-companion-")
            .suffix(".py")
            .tempfile()
            .map_err(|e| Error::connection(BackendKind::Launcher, format!("cannot write companion script: {e}")))?;
        file.write_all(scripts::companion_script().as_bytes())
            .map_err(|e| Error::connection(BackendKind::Launcher, format!("cannot write companion script: {e}")))?;
        let path = file.into_temp_path();
        let owned = path.to_path_buf();
        self.companion = Some(path);
        Ok(owned)
    }

    fn launch_spec(&mut self, program: PathBuf) -> Result<LaunchSpec> {
        let script = self.companion_path()?;
        let mut spec = LaunchSpec::new(program)
            .args(self.config.launcher_args.iter())
            .arg(script)
            .envs(&self.config.child_env);

        if self.config.use_apprun {
            // AppRun expects APPDIR to point at the extracted bundle root.
            if let Some(root) = self.config.apprun_path.as_ref().and_then(|p| p.parent()) {
                spec = spec.env("APPDIR", root.to_string_lossy());
                spec.cwd = Some(root.to_path_buf());
            }
        }
        Ok(spec)
    }
}

impl Backend for ScriptLaunchBackend {
    fn descriptor(&self) -> &'static BackendDescriptor {
        &LAUNCHER
    }

    fn is_available(&self) -> bool {
        let program_ok = self
            .program()
            .is_some_and(|p| resolve_executable(p).is_some());
        let script_ok = self.config.script_path.as_ref().map_or(true, |p| p.is_file());
        program_ok && script_ok
    }

    fn connect(&mut self) -> Result<()> {
        self.disconnect();

        let configured = self
            .program()
            .cloned()
            .ok_or_else(|| Error::connection(BackendKind::Launcher, "no launcher configured"))?;
        let program = resolve_executable(&configured).ok_or_else(|| {
            Error::connection(
                BackendKind::Launcher,
                format!("launcher not found: {}", configured.display()),
            )
        })?;
        if let Some(script) = &self.config.script_path {
            if !script.is_file() {
                return Err(Error::connection(
                    BackendKind::Launcher,
                    format!("companion script not found: {}", script.display()),
                ));
            }
        }

        let spec = self.launch_spec(program)?;
        let process = EngineProcess::spawn(BackendKind::Launcher, &spec).map_err(|e| {
            Error::connection(
                BackendKind::Launcher,
                format!("failed to start {}: {e}", spec.program.display()),
            )
        })?;
        self.process = Some(process);
        Ok(())
    }

    fn execute(&mut self, command: &Command, timeout: Duration) -> Result<Response> {
        let process = self
            .process
            .as_mut()
            .ok_or_else(|| Error::connection(BackendKind::Launcher, "engine process not started"))?;
        process.exchange(command, timeout)
    }

    fn disconnect(&mut self) {
        if let Some(process) = self.process.take() {
            process.shutdown(self.config.shutdown_grace());
        }
        self.companion = None;
    }

    fn abort(&mut self) {
        if let Some(process) = self.process.take() {
            process.kill();
        }
        self.companion = None;
    }

    fn is_connected(&self) -> bool {
        self.process.is_some()
    }
}
