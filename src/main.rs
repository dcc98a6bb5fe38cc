//! `cadlink`: relay Command records from stdin to the engine and write
//! the Response records to stdout. Diagnostics go to stderr.

use std::io::{self, BufReader};
use std::process::ExitCode;

use cadlink::{logging, Command, ConnectionConfig, ConnectionManager, Error, Response};
use cadlink_protocol::{read_record, write_record};

fn main() -> ExitCode {
    logging::init();

    tracing::info!(
        "=== cadlink starting === version={} pid={}",
        env!("CARGO_PKG_VERSION"),
        std::process::id()
    );

    let config = match ConnectionConfig::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let reconnect_on_failure = config.reconnect_on_failure;
    let manager = ConnectionManager::new(config);

    match manager.connect_with_retry(None) {
        Ok(kind) => tracing::info!(backend = %kind, "engine connection ready"),
        Err(e) => {
            tracing::error!("could not connect to the engine: {}", e);
            return ExitCode::FAILURE;
        }
    }

    let mut reader = BufReader::new(io::stdin().lock());
    let mut stdout = io::stdout().lock();

    loop {
        let request: Command = match read_record(&mut reader) {
            Ok(Some(request)) => request,
            Ok(None) => {
                tracing::info!("stdin closed, shutting down");
                break;
            }
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                tracing::warn!("unreadable command record: {}", e);
                let reply = Response::failure(0, format!("malformed command: {e}"));
                if write_record(&mut stdout, &reply).is_err() {
                    break;
                }
                continue;
            }
            Err(e) => {
                tracing::error!("stdin read failed: {}", e);
                break;
            }
        };

        let reply = relay(&manager, request, reconnect_on_failure);
        if let Err(e) = write_record(&mut stdout, &reply) {
            tracing::error!("stdout write failed: {}", e);
            break;
        }
    }

    manager.disconnect();
    ExitCode::SUCCESS
}

/// Forward one request. The manager numbers commands itself; the caller's
/// id is restored on the way back.
fn relay(manager: &ConnectionManager, request: Command, reconnect_on_failure: bool) -> Response {
    let Command {
        id,
        command,
        params,
    } = request;

    match manager.execute_default(&command, params) {
        Ok(response) => Response { id, ..response },
        Err(Error::Command { message, .. }) => Response::failure(id, message),
        Err(e) => {
            tracing::warn!(command = %command, "request failed: {}", e);
            if e.is_transport() && reconnect_on_failure {
                match manager.reconnect() {
                    Ok(kind) => tracing::info!(backend = %kind, "reconnected after failure"),
                    Err(re) => tracing::error!("reconnect failed: {}", re),
                }
            }
            Response::failure(id, e.to_string())
        }
    }
}
