//! The Python sources shipped to real engines, run under a plain `python3`.
//!
//! The other integration tests swap the engine for the stub binary, so
//! these are the only tests that execute the companion loop, the
//! direct-import bootstrap and the per-call script. `json` stands in for
//! the engine module. Skipped when no `python3` is on PATH.

use std::path::PathBuf;
use std::time::Duration;

use cadlink::{BackendKind, ConnectionConfig, ConnectionManager, ConnectionState, Error, Params};
use serde_json::json;

const TIMEOUT: Duration = Duration::from_secs(20);

fn python3() -> Option<PathBuf> {
    match which::which("python3") {
        Ok(path) => Some(path),
        Err(_) => {
            eprintln!("python3 not found on PATH, skipping");
            None
        }
    }
}

fn python_config(python: PathBuf) -> ConnectionConfig {
    ConnectionConfig {
        launcher_path: Some(python.clone()),
        python_path: Some(python.clone()),
        path: Some(python),
        engine_module: "json".to_string(),
        startup_timeout_secs: 20.0,
        shutdown_grace_secs: 1.0,
        ..ConnectionConfig::default()
    }
}

fn check_backend(kind: BackendKind) {
    let Some(python) = python3() else { return };
    let manager = ConnectionManager::new(python_config(python));
    assert_eq!(
        manager
            .connect(Some(kind))
            .unwrap_or_else(|e| panic!("{kind} failed to connect: {e}")),
        kind
    );

    let pong = manager.ping(TIMEOUT).unwrap();
    assert_eq!(pong.id, 1);
    assert_eq!(pong.result, Some(json!({"pong": true})));

    let err = manager.execute("nosuch", Params::new(), TIMEOUT).unwrap_err();
    match err {
        Error::Command { id, message } => {
            assert_eq!(id, 2);
            assert_eq!(message, "ValueError: unknown command: nosuch");
        }
        other => panic!("expected a command error from {kind}, got {other:?}"),
    }
    assert_eq!(manager.state(), ConnectionState::Connected);

    manager.disconnect();
}

#[test]
fn companion_script_serves_commands() {
    check_backend(BackendKind::Launcher);
}

#[test]
fn direct_import_bootstrap_serves_commands() {
    check_backend(BackendKind::Wrapper);
}

#[test]
fn per_call_script_answers_one_command() {
    check_backend(BackendKind::Bridge);
}

#[test]
fn direct_import_of_missing_module_fails_to_connect() {
    let Some(python) = python3() else { return };
    let config = ConnectionConfig {
        engine_module: "cadlink_no_such_engine".to_string(),
        ..python_config(python)
    };
    let manager = ConnectionManager::new(config);

    let err = manager.connect(Some(BackendKind::Wrapper)).unwrap_err();

    match err {
        Error::Connection { backend, message } => {
            assert_eq!(backend, BackendKind::Wrapper);
            assert!(message.contains("cadlink_no_such_engine"), "message: {message}");
        }
        other => panic!("expected a connection error, got {other:?}"),
    }
}
