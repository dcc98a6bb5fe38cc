//! End-to-end behavior of the manager as an application sees it: auto
//! selection across real backends, the simulation backend, and the
//! `cadlink` relay binary.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Command as ProcessCommand, Stdio};
use std::time::Duration;

use cadlink::{
    AttemptOutcome, BackendKind, ConnectionConfig, ConnectionManager, ConnectionState, Error,
    Params, Response,
};
use serde_json::json;

fn stub_engine() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_cadlink-stub-engine"))
}

fn refused_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Every real backend pointed at something that is not there.
fn nothing_installed() -> ConnectionConfig {
    ConnectionConfig {
        launcher_path: Some("/nonexistent/freecad".into()),
        python_path: Some("/nonexistent/python3".into()),
        path: Some("/nonexistent/freecadcmd".into()),
        host: "127.0.0.1".to_string(),
        port: refused_port(),
        connect_timeout_secs: 1.0,
        retry_delay: 0.0,
        ..ConnectionConfig::default()
    }
}

#[test]
fn mock_create_document_returns_exact_record() {
    let config = ConnectionConfig {
        use_mock: true,
        ..ConnectionConfig::default()
    };
    let manager = ConnectionManager::new(config);
    assert_eq!(manager.connect(None).unwrap(), BackendKind::Simulation);

    let mut params = Params::new();
    params.insert("name".into(), json!("Test"));
    let response = manager
        .execute("create_document", params, Duration::from_secs(1))
        .unwrap();

    assert_eq!(
        serde_json::to_value(&response).unwrap(),
        json!({"id": 1, "success": true, "result": {"name": "Test"}})
    );
}

#[test]
fn auto_falls_through_to_simulation() {
    let manager = ConnectionManager::new(nothing_installed());

    assert_eq!(manager.connect(None).unwrap(), BackendKind::Simulation);

    let status = manager.status();
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.active_backend, Some(BackendKind::Simulation));
    let outcomes: Vec<_> = status
        .attempts
        .iter()
        .map(|a| (a.kind, matches!(a.outcome, AttemptOutcome::Failed(_))))
        .collect();
    assert_eq!(
        outcomes,
        vec![
            (BackendKind::Launcher, false),
            (BackendKind::Wrapper, false),
            (BackendKind::Server, true),
            (BackendKind::Bridge, false),
            (BackendKind::Simulation, false),
        ]
    );
    assert_eq!(status.attempts[4].outcome, AttemptOutcome::Connected);
}

#[test]
fn auto_without_fallback_reports_every_candidate() {
    let config = ConnectionConfig {
        allow_simulation_fallback: false,
        ..nothing_installed()
    };
    let manager = ConnectionManager::new(config);

    let err = manager.connect(None).unwrap_err();

    match err {
        Error::NoBackendAvailable { attempts } => assert_eq!(attempts.len(), 5),
        other => panic!("expected NoBackendAvailable, got {other:?}"),
    }
    assert_eq!(manager.state(), ConnectionState::Failed);
}

#[test]
fn auto_prefers_the_first_working_backend() {
    let config = ConnectionConfig {
        python_path: Some(stub_engine()),
        path: Some(stub_engine()),
        startup_timeout_secs: 10.0,
        ..nothing_installed()
    };
    let manager = ConnectionManager::new(config);

    assert_eq!(manager.connect(None).unwrap(), BackendKind::Wrapper);
    manager.disconnect();
}

#[test]
fn custom_auto_order_is_respected() {
    let mut child_env = BTreeMap::new();
    child_env.insert("CADLINK_STUB_MODE".to_string(), "serve".to_string());
    let config = ConnectionConfig {
        auto_order: vec![BackendKind::Bridge, BackendKind::Launcher],
        launcher_path: Some(stub_engine()),
        path: Some(stub_engine()),
        child_env,
        startup_timeout_secs: 10.0,
        ..nothing_installed()
    };
    let manager = ConnectionManager::new(config);

    assert_eq!(manager.connect(None).unwrap(), BackendKind::Bridge);
}

#[test]
fn relay_forwards_records_and_restores_caller_ids() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("cadlink.toml");
    std::fs::write(&config_path, "use_mock = true\n").unwrap();

    let mut relay = ProcessCommand::new(env!("CARGO_BIN_EXE_cadlink"))
        .env("CADLINK_CONFIG", &config_path)
        .env("RUST_LOG", "off")
        .current_dir(dir.path())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    {
        let mut stdin = relay.stdin.take().unwrap();
        writeln!(stdin, r#"{{"id": 42, "command": "create_document", "params": {{"name": "Test"}}}}"#).unwrap();
        writeln!(stdin).unwrap();
        writeln!(stdin, "not json").unwrap();
        writeln!(stdin, r#"{{"id": 43, "command": "get_volume", "params": {{"object": "Box001"}}}}"#).unwrap();
    }

    let stdout = BufReader::new(relay.stdout.take().unwrap());
    let replies: Vec<Response> = stdout
        .lines()
        .map(|line| serde_json::from_str(&line.unwrap()).unwrap())
        .collect();
    assert!(relay.wait().unwrap().success());

    assert_eq!(replies.len(), 3);
    assert_eq!(replies[0], Response::ok(42, json!({"name": "Test"})));
    assert!(!replies[1].success);
    assert_eq!(replies[1].id, 0);
    assert_eq!(replies[2].id, 43);
}
