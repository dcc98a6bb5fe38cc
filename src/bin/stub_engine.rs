//! Deterministic stand-in for the CAD engine, used by the integration
//! tests. It speaks the record protocol in each launch style:
//!
//! - `stub -c <program>`: direct import, emits a startup record first
//! - `stub <script>` where the script embeds a command: one-shot CLI call
//! - anything else: line loop on stdin/stdout, like the companion script
//!
//! `CADLINK_STUB_MODE` selects misbehaviour: `serve` (default), `banner`,
//! `crash`, `crash-on-start`, `hang`, `deaf` (stops reading stdin after the
//! first answer), `import-fail`, `cli-crash`.

use std::io::{self, Write};
use std::process;
use std::thread;
use std::time::Duration;

use cadlink::backend::scripts::embedded_command;
use cadlink_protocol::{read_record, write_record, Command, Response};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Serve,
    Banner,
    Crash,
    CrashOnStart,
    Hang,
    Deaf,
    ImportFail,
    CliCrash,
}

impl Mode {
    fn from_env() -> Self {
        match std::env::var("CADLINK_STUB_MODE").as_deref() {
            Ok("banner") => Mode::Banner,
            Ok("crash") => Mode::Crash,
            Ok("crash-on-start") => Mode::CrashOnStart,
            Ok("hang") => Mode::Hang,
            Ok("deaf") => Mode::Deaf,
            Ok("import-fail") => Mode::ImportFail,
            Ok("cli-crash") => Mode::CliCrash,
            _ => Mode::Serve,
        }
    }
}

/// A banner line in Latin-1, as some engine builds print it.
const LATIN1_BANNER: &[u8] = b"Stub engine \xe9dition sp\xe9ciale\n";

fn main() {
    let mode = Mode::from_env();
    if mode == Mode::CrashOnStart {
        eprintln!("stub: refusing to start");
        process::exit(2);
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "-c") {
        direct_import(mode);
        return;
    }
    let embedded = args
        .iter()
        .filter_map(|a| std::fs::read_to_string(a).ok())
        .find_map(|script| embedded_command(&script));
    match embedded {
        Some(command) => run_once(mode, command),
        None => serve(mode),
    }
}

fn direct_import(mode: Mode) {
    let mut out = io::stdout().lock();
    if mode == Mode::ImportFail {
        let _ = write_record(
            &mut out,
            &Response::failure(0, "import of FreeCAD failed: No module named 'FreeCAD'"),
        );
        process::exit(3);
    }
    let _ = write_record(&mut out, &Response::ok(0, json!({"ready": true, "engine": "stub"})));
    drop(out);
    serve(mode);
}

fn run_once(mode: Mode, command: Command) {
    let mut out = io::stdout().lock();
    let _ = writeln!(out, "Stub engine 1.0, starting up");
    let _ = out.write_all(LATIN1_BANNER);
    let _ = writeln!(out, "{{not a record");
    if mode == Mode::CliCrash {
        let _ = out.flush();
        eprintln!("stub: segmentation fault while running {}", command.command);
        process::exit(1);
    }
    if let Some(response) = handle(mode, &command, &mut out) {
        let _ = write_record(&mut out, &response);
    }
    let _ = writeln!(out, "Stub engine exiting");
}

fn serve(mode: Mode) {
    let mut out = io::stdout().lock();
    if mode == Mode::Banner {
        let _ = writeln!(out, "Stub engine 1.0, Libs: 1.0R1");
        let _ = out.write_all(LATIN1_BANNER);
        let _ = writeln!(out, "(c) cadlink test suite");
        let _ = out.flush();
    }

    let mut input = io::stdin().lock();
    loop {
        let command: Command = match read_record(&mut input) {
            Ok(Some(command)) => command,
            Ok(None) => return,
            Err(e) => {
                eprintln!("stub: unreadable command: {e}");
                continue;
            }
        };
        if let Some(response) = handle(mode, &command, &mut out) {
            if write_record(&mut out, &response).is_err() {
                return;
            }
        }
        if mode == Mode::Deaf {
            loop {
                thread::sleep(Duration::from_secs(3600));
            }
        }
    }
}

fn handle(mode: Mode, command: &Command, out: &mut impl Write) -> Option<Response> {
    if !command.is_probe() {
        if mode == Mode::Crash || command.command == "crash" {
            eprintln!("stub: simulated crash while handling {}", command.command);
            process::exit(1);
        }
        if mode == Mode::Hang || command.command == "hang" {
            loop {
                thread::sleep(Duration::from_secs(3600));
            }
        }
    }

    let params = &command.params;
    let id = command.id;
    let response = match command.command.as_str() {
        "ping" => Response::ok(id, json!({"pong": true})),
        "echo" => Response::ok(id, Value::Object(params.clone())),
        "create_document" => {
            let name = params.get("name").cloned().unwrap_or_else(|| json!("Unnamed"));
            Response::ok(id, json!({"name": name}))
        }
        "fail" => {
            let message = params
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("requested failure");
            Response::failure(id, message)
        }
        "garbage" => {
            let _ = writeln!(out, "this is not a record");
            let _ = out.flush();
            return None;
        }
        "wrong_id" => Response::ok(id + 100, Value::Null),
        other => Response::failure(id, format!("unknown command: {other}")),
    };
    Some(response)
}
