//! Transport strategies for reaching the engine.
//!
//! Every backend speaks the same line protocol (`cadlink_protocol`) so the
//! manager can treat them uniformly:
//! - `ScriptLaunchBackend`: launcher runs the companion script inside the engine
//! - `DirectImportBackend`: plain interpreter imports the engine modules
//! - `SocketBackend`: TCP client to a server already running in the engine
//! - `CliPerCallBackend`: one engine process per command
//! - `SimulationBackend`: canned responses, no engine

mod cli_call;
mod direct_import;
pub(crate) mod process;
pub mod scripts;
mod script_launch;
mod simulation;
mod socket;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use cadlink_protocol::{Command, Response};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use cli_call::CliPerCallBackend;
pub use direct_import::DirectImportBackend;
pub use script_launch::ScriptLaunchBackend;
pub use simulation::SimulationBackend;
pub use socket::SocketBackend;

/// The closed set of transport strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// In-process script launch through the engine's launcher.
    #[serde(alias = "script_launch")]
    Launcher,
    /// Subprocess importing the engine modules directly.
    #[serde(alias = "direct_import")]
    Wrapper,
    /// TCP socket to a server running inside a live engine.
    #[serde(alias = "socket")]
    Server,
    /// Engine command-line executable, one invocation per command.
    #[serde(alias = "cli")]
    Bridge,
    #[serde(alias = "mock")]
    Simulation,
}

impl BackendKind {
    pub const ALL: [BackendKind; 5] = [
        BackendKind::Launcher,
        BackendKind::Wrapper,
        BackendKind::Server,
        BackendKind::Bridge,
        BackendKind::Simulation,
    ];

    pub fn descriptor(self) -> &'static BackendDescriptor {
        match self {
            BackendKind::Launcher => &LAUNCHER,
            BackendKind::Wrapper => &WRAPPER,
            BackendKind::Server => &SERVER,
            BackendKind::Bridge => &BRIDGE,
            BackendKind::Simulation => &SIMULATION,
        }
    }

    pub fn name(self) -> &'static str {
        self.descriptor().name
    }

    /// Whether this backend owns a child process while connected.
    pub fn spawns_process(self) -> bool {
        matches!(
            self,
            BackendKind::Launcher | BackendKind::Wrapper | BackendKind::Bridge
        )
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "launcher" | "script_launch" => Ok(BackendKind::Launcher),
            "wrapper" | "direct_import" => Ok(BackendKind::Wrapper),
            "server" | "socket" => Ok(BackendKind::Server),
            "bridge" | "cli" => Ok(BackendKind::Bridge),
            "simulation" | "mock" => Ok(BackendKind::Simulation),
            other => Err(format!("unknown backend kind: {other}")),
        }
    }
}

/// Static metadata for a backend kind.
#[derive(Debug, PartialEq, Eq)]
pub struct BackendDescriptor {
    pub kind: BackendKind,
    pub name: &'static str,
    /// Default position in auto mode; lower is tried first.
    pub priority: u8,
}

pub const LAUNCHER: BackendDescriptor = BackendDescriptor {
    kind: BackendKind::Launcher,
    name: "launcher",
    priority: 0,
};
pub const WRAPPER: BackendDescriptor = BackendDescriptor {
    kind: BackendKind::Wrapper,
    name: "wrapper",
    priority: 1,
};
pub const SERVER: BackendDescriptor = BackendDescriptor {
    kind: BackendKind::Server,
    name: "server",
    priority: 2,
};
pub const BRIDGE: BackendDescriptor = BackendDescriptor {
    kind: BackendKind::Bridge,
    name: "bridge",
    priority: 3,
};
pub const SIMULATION: BackendDescriptor = BackendDescriptor {
    kind: BackendKind::Simulation,
    name: "simulation",
    priority: 4,
};

/// One transport strategy. Implementations own their OS resources
/// exclusively and release them in `disconnect`/`abort`.
///
/// Calls are strictly request/response: `execute` writes one command and
/// returns the next record read, so callers must not interleave commands.
pub trait Backend: Send {
    fn descriptor(&self) -> &'static BackendDescriptor;

    fn kind(&self) -> BackendKind {
        self.descriptor().kind
    }

    /// Cheap precondition check. Must not spawn processes or open sockets.
    fn is_available(&self) -> bool;

    /// Establish the transport. The manager sends the liveness probe
    /// through `execute` afterwards.
    fn connect(&mut self) -> Result<()>;

    /// Send one command and wait at most `timeout` for its response.
    fn execute(&mut self, command: &Command, timeout: Duration) -> Result<Response>;

    /// Release resources gracefully. Idempotent.
    fn disconnect(&mut self);

    /// Release resources immediately, used after timeouts and crashes.
    fn abort(&mut self) {
        self.disconnect();
    }

    fn is_connected(&self) -> bool;
}

/// Resolve a configured executable. Paths with a directory component must
/// exist; bare names are looked up on `PATH`.
pub(crate) fn resolve_executable(configured: &Path) -> Option<PathBuf> {
    if configured.as_os_str().is_empty() {
        return None;
    }
    if configured.components().count() > 1 || configured.is_absolute() {
        return configured.is_file().then(|| configured.to_path_buf());
    }
    if configured.is_file() {
        return Some(configured.to_path_buf());
    }
    which::which(configured).ok()
}

/// Check that a response answers the command that was sent.
pub(crate) fn check_response_id(command: &Command, response: &Response) -> Result<()> {
    if response.id != command.id {
        return Err(crate::error::Error::Protocol(format!(
            "response id {} does not match outstanding command {}",
            response.id, command.id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kind_names_and_aliases() {
        assert_eq!("launcher".parse(), Ok(BackendKind::Launcher));
        assert_eq!("direct_import".parse(), Ok(BackendKind::Wrapper));
        assert_eq!("Server".parse(), Ok(BackendKind::Server));
        assert_eq!("cli".parse(), Ok(BackendKind::Bridge));
        assert_eq!("mock".parse(), Ok(BackendKind::Simulation));
        assert!("telepathy".parse::<BackendKind>().is_err());
    }

    #[test]
    fn kind_displays_descriptor_name() {
        assert_eq!(BackendKind::Simulation.to_string(), "simulation");
        assert_eq!(BackendKind::Bridge.to_string(), "bridge");
    }

    #[test]
    fn default_priorities_follow_declaration_order() {
        let priorities: Vec<u8> = BackendKind::ALL
            .iter()
            .map(|k| k.descriptor().priority)
            .collect();
        assert_eq!(priorities, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn serde_accepts_mock_alias() {
        #[derive(Deserialize)]
        struct Wrapper {
            kind: BackendKind,
        }
        let w: Wrapper = toml::from_str("kind = \"mock\"").unwrap();
        assert_eq!(w.kind, BackendKind::Simulation);
    }

    #[test]
    fn missing_executable_does_not_resolve() {
        assert!(resolve_executable(Path::new("/nonexistent/dir/freecad")).is_none());
        assert!(resolve_executable(Path::new("")).is_none());
    }

    #[test]
    fn existing_file_resolves() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(
            resolve_executable(file.path()),
            Some(file.path().to_path_buf())
        );
    }

    #[test]
    fn mismatched_id_is_protocol_error() {
        let cmd = Command::new(4, "ping", Default::default());
        let resp = Response::ok(5, serde_json::Value::Null);
        assert!(matches!(
            check_response_id(&cmd, &resp),
            Err(crate::error::Error::Protocol(_))
        ));
    }
}
