use std::path::PathBuf;
use std::time::Duration;

use cadlink_protocol::{Command, Response, PROBE_ID};

use super::process::{EngineProcess, LaunchSpec, ReadMode};
use super::{resolve_executable, scripts, Backend, BackendDescriptor, BackendKind, WRAPPER};
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};

/// Spawns a fresh interpreter that imports the engine's native modules
/// directly, for environments where the launcher is unavailable.
///
/// The child reports the import outcome as a startup record (id 0) before
/// reading commands. A failed import, or an exit before that record, is a
/// connection failure rather than a crash.
pub struct DirectImportBackend {
    config: ConnectionConfig,
    process: Option<EngineProcess>,
}

impl DirectImportBackend {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            process: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(EngineProcess::pid)
    }

    fn launch_spec(&self, interpreter: PathBuf) -> LaunchSpec {
        let module_path = self
            .config
            .module_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());
        let bootstrap =
            scripts::direct_import_bootstrap(&self.config.engine_module, module_path.as_deref());

        let mut spec = LaunchSpec::new(interpreter)
            .args(["-u", "-c"])
            .arg(bootstrap)
            .envs(&self.config.child_env);
        // Native engine libraries usually sit next to the Python modules.
        if let Some(dir) = &module_path {
            spec = spec.env("LD_LIBRARY_PATH", join_search_path(dir, "LD_LIBRARY_PATH"));
        }
        spec
    }

    fn await_startup(&self, process: &mut EngineProcess) -> Result<()> {
        let timeout = self.config.startup_timeout();
        match process.recv(timeout, ReadMode::Handshake) {
            Ok(record) if record.id == PROBE_ID && record.success => {
                process.mark_answered();
                tracing::info!(
                    backend = %BackendKind::Wrapper,
                    pid = process.pid(),
                    "engine modules imported"
                );
                Ok(())
            }
            Ok(record) if record.id == PROBE_ID => Err(Error::connection(
                BackendKind::Wrapper,
                record.error.unwrap_or_else(|| "engine import failed".to_string()),
            )),
            Ok(record) => Err(Error::connection(
                BackendKind::Wrapper,
                format!("unexpected startup record with id {}", record.id),
            )),
            Err(Error::ProcessCrash { exit_code, detail }) => Err(Error::connection(
                BackendKind::Wrapper,
                format!(
                    "interpreter exited during import (exit code {}): {detail}",
                    exit_code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
                ),
            )),
            Err(Error::Timeout(t)) => Err(Error::connection(
                BackendKind::Wrapper,
                format!("no startup record within {t:?}"),
            )),
            Err(e) => Err(Error::connection(BackendKind::Wrapper, e.to_string())),
        }
    }
}

impl Backend for DirectImportBackend {
    fn descriptor(&self) -> &'static BackendDescriptor {
        &WRAPPER
    }

    fn is_available(&self) -> bool {
        self.config
            .python_path
            .as_ref()
            .is_some_and(|p| resolve_executable(p).is_some())
            && self.config.module_path.as_ref().map_or(true, |p| p.is_dir())
    }

    fn connect(&mut self) -> Result<()> {
        self.disconnect();

        let configured = self
            .config
            .python_path
            .clone()
            .ok_or_else(|| Error::connection(BackendKind::Wrapper, "no python_path configured"))?;
        let interpreter = resolve_executable(&configured).ok_or_else(|| {
            Error::connection(
                BackendKind::Wrapper,
                format!("interpreter not found: {}", configured.display()),
            )
        })?;

        let spec = self.launch_spec(interpreter);
        let mut process = EngineProcess::spawn(BackendKind::Wrapper, &spec).map_err(|e| {
            Error::connection(
                BackendKind::Wrapper,
                format!("failed to start {}: {e}", spec.program.display()),
            )
        })?;

        match self.await_startup(&mut process) {
            Ok(()) => {
                self.process = Some(process);
                Ok(())
            }
            Err(e) => {
                process.kill();
                Err(e)
            }
        }
    }

    fn execute(&mut self, command: &Command, timeout: Duration) -> Result<Response> {
        let process = self
            .process
            .as_mut()
            .ok_or_else(|| Error::connection(BackendKind::Wrapper, "interpreter not started"))?;
        process.exchange(command, timeout)
    }

    fn disconnect(&mut self) {
        if let Some(process) = self.process.take() {
            process.shutdown(self.config.shutdown_grace());
        }
    }

    fn abort(&mut self) {
        if let Some(process) = self.process.take() {
            process.kill();
        }
    }

    fn is_connected(&self) -> bool {
        self.process.is_some()
    }
}

fn join_search_path(dir: &str, var: &str) -> String {
    match std::env::var(var) {
        Ok(existing) if !existing.is_empty() => format!("{dir}:{existing}"),
        _ => dir.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_without_interpreter() {
        assert!(!DirectImportBackend::new(ConnectionConfig::default()).is_available());
    }

    #[test]
    fn unavailable_when_module_dir_missing() {
        let python = tempfile::NamedTempFile::new().unwrap();
        let config = ConnectionConfig {
            python_path: Some(python.path().to_path_buf()),
            module_path: Some("/nonexistent/freecad/lib".into()),
            ..ConnectionConfig::default()
        };
        assert!(!DirectImportBackend::new(config).is_available());
    }

    #[test]
    fn spec_runs_bootstrap_unbuffered() {
        let config = ConnectionConfig {
            module_path: Some("/opt/freecad/lib".into()),
            ..ConnectionConfig::default()
        };
        let backend = DirectImportBackend::new(config);
        let spec = backend.launch_spec("/usr/bin/python3".into());

        assert_eq!(spec.args[0], "-u");
        assert_eq!(spec.args[1], "-c");
        assert!(spec.args[2].to_string_lossy().contains("/opt/freecad/lib"));
        assert!(spec
            .env
            .iter()
            .any(|(k, v)| k == "LD_LIBRARY_PATH" && v.starts_with("/opt/freecad/lib")));
    }

    #[test]
    fn connect_without_interpreter_is_connection_error() {
        let mut backend = DirectImportBackend::new(ConnectionConfig::default());
        assert!(matches!(
            backend.connect(),
            Err(Error::Connection { backend: BackendKind::Wrapper, .. })
        ));
    }
}
