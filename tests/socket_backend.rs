//! SocketBackend against an in-test engine server on an ephemeral port.

use std::io::BufReader;
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use cadlink::{
    BackendKind, Command, ConnectionConfig, ConnectionManager, ConnectionMethod, ConnectionState,
    Error, ErrorKind, Params, Response,
};
use cadlink_protocol::{read_record, write_record};
use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Fixture: a one-connection engine server
// ---------------------------------------------------------------------------

/// How the fake server treats user commands. The probe is always answered.
#[derive(Clone, Copy)]
enum Behavior {
    Answer,
    CloseOnCommand,
    Silent,
}

fn spawn_server(behavior: Behavior) -> (u16, thread::JoinHandle<Vec<Command>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        serve(stream, behavior)
    });
    (port, handle)
}

fn serve(stream: TcpStream, behavior: Behavior) -> Vec<Command> {
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);
    let mut seen = Vec::new();

    while let Ok(Some(command)) = read_record::<_, Command>(&mut reader) {
        seen.push(command.clone());
        if command.is_probe() {
            write_record(&mut writer, &Response::ok(command.id, json!({"pong": true}))).unwrap();
            continue;
        }
        match behavior {
            Behavior::Answer => {
                let reply = match command.command.as_str() {
                    "fail" => Response::failure(command.id, "Object 'Box' not found"),
                    _ => Response::ok(command.id, Value::Object(command.params.clone())),
                };
                write_record(&mut writer, &reply).unwrap();
            }
            Behavior::CloseOnCommand => break,
            Behavior::Silent => thread::sleep(Duration::from_secs(2)),
        }
    }
    seen
}

fn server_config(port: u16) -> ConnectionConfig {
    ConnectionConfig {
        host: "127.0.0.1".to_string(),
        port,
        connect_timeout_secs: 2.0,
        retry_delay: 0.0,
        ..ConnectionConfig::default()
    }
}

fn refused_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn commands_round_trip_over_tcp() {
    let (port, server) = spawn_server(Behavior::Answer);
    let manager = ConnectionManager::new(server_config(port));
    assert_eq!(manager.connect(Some(BackendKind::Server)).unwrap(), BackendKind::Server);

    let mut params = Params::new();
    params.insert("length".into(), json!(10));
    let response = manager
        .execute("create_box", params, Duration::from_secs(5))
        .unwrap();
    assert_eq!(response.id, 1);
    assert_eq!(response.result, Some(json!({"length": 10})));

    let err = manager
        .execute("fail", Params::new(), Duration::from_secs(5))
        .unwrap_err();
    assert!(matches!(err, Error::Command { id: 2, .. }), "got {err:?}");
    assert_eq!(manager.state(), ConnectionState::Connected);

    manager.disconnect();
    let seen: Vec<_> = server
        .join()
        .unwrap()
        .into_iter()
        .map(|c| (c.id, c.command))
        .collect();
    assert_eq!(
        seen,
        vec![
            (0, "ping".to_string()),
            (1, "create_box".to_string()),
            (2, "fail".to_string()),
        ]
    );
}

#[test]
fn refused_connection_fails_promptly() {
    let config = ConnectionConfig {
        connection_method: ConnectionMethod::Only(BackendKind::Server),
        ..server_config(refused_port())
    };
    let manager = ConnectionManager::new(config);

    let started = Instant::now();
    let err = manager.connect(None).unwrap_err();

    assert!(
        matches!(err, Error::Connection { backend: BackendKind::Server, .. }),
        "got {err:?}"
    );
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(manager.state(), ConnectionState::Failed);
}

#[test]
fn server_closing_mid_command_fails_the_connection() {
    let (port, server) = spawn_server(Behavior::CloseOnCommand);
    let manager = ConnectionManager::new(server_config(port));
    manager.connect(Some(BackendKind::Server)).unwrap();

    let err = manager
        .execute("create_box", Params::new(), Duration::from_secs(5))
        .unwrap_err();

    assert!(
        matches!(err, Error::Connection { backend: BackendKind::Server, .. }),
        "got {err:?}"
    );
    assert_eq!(manager.status().last_error_kind, Some(ErrorKind::Connection));
    assert_eq!(manager.state(), ConnectionState::Failed);
    server.join().unwrap();
}

#[test]
fn silent_server_times_out() {
    let (port, _server) = spawn_server(Behavior::Silent);
    let manager = ConnectionManager::new(server_config(port));
    manager.connect(Some(BackendKind::Server)).unwrap();

    let timeout = Duration::from_millis(300);
    let started = Instant::now();
    let err = manager.execute("create_box", Params::new(), timeout).unwrap_err();

    assert!(matches!(err, Error::Timeout(_)), "got {err:?}");
    assert!(started.elapsed() < timeout + Duration::from_secs(1));
    assert_eq!(manager.state(), ConnectionState::Failed);
}
