//! Python sources executed inside the engine's interpreter.
//!
//! The engine's own operations live in an external `cadlink_handlers`
//! module; these sources only carry records between stdio and that module.

use cadlink_protocol::Command;

/// Marker the per-call script uses to embed its command.
pub const COMMAND_MARKER: &str = "_COMMAND = json.loads(";

/// Shared dispatch loop. Engine prints are redirected to stderr so stdout
/// carries nothing but records.
const COMPANION: &str = r#"
import json
import sys

_OUT = sys.stdout
sys.stdout = sys.stderr


def _load_handlers():
    try:
        import cadlink_handlers
        return cadlink_handlers
    except ImportError:
        return None


_HANDLERS = _load_handlers()


def _dispatch(name, params):
    if name == "ping":
        return {"pong": True}
    handler = getattr(_HANDLERS, name, None) if _HANDLERS is not None else None
    if handler is None:
        raise ValueError("unknown command: %s" % name)
    return handler(**params)


def _reply(record):
    _OUT.write(json.dumps(record, default=str) + "\n")
    _OUT.flush()


def _run_once(cmd):
    cid = cmd.get("id", 0)
    try:
        result = _dispatch(cmd.get("command"), cmd.get("params") or {})
        _reply({"id": cid, "success": True, "result": result})
    except Exception as exc:
        _reply({"id": cid, "success": False, "error": "%s: %s" % (type(exc).__name__, exc)})


def _serve():
    for line in sys.stdin:
        line = line.strip()
        if not line:
            continue
        try:
            cmd = json.loads(line)
        except ValueError as exc:
            sys.stderr.write("cadlink: unreadable command: %s\n" % exc)
            continue
        _run_once(cmd)
"#;

/// Companion script run by the launcher: serve commands until stdin closes.
pub(crate) fn companion_script() -> String {
    format!("{COMPANION}\n_serve()\n")
}

/// Program for `python -c`: import the engine, report the outcome as the
/// startup record (id 0), then serve commands.
pub(crate) fn direct_import_bootstrap(engine_module: &str, module_path: Option<&str>) -> String {
    let module_path = module_path
        .map(python_str)
        .unwrap_or_else(|| "None".to_string());
    let engine = python_str(engine_module);
    format!(
        r#"import importlib
import json
import sys

_MODULE_PATH = {module_path}
if _MODULE_PATH:
    sys.path.insert(0, _MODULE_PATH)
try:
    importlib.import_module({engine})
except Exception as exc:
    sys.stdout.write(json.dumps({{"id": 0, "success": False, "error": "import of %s failed: %s" % ({engine}, exc)}}) + "\n")
    sys.stdout.flush()
    sys.exit(3)
sys.stdout.write(json.dumps({{"id": 0, "success": True, "result": {{"ready": True, "engine": {engine}}}}}) + "\n")
sys.stdout.flush()
{COMPANION}
_serve()
"#
    )
}

/// One-shot script for the engine's command-line executable.
pub(crate) fn per_call_script(command: &Command) -> String {
    let json = serde_json::to_string(command).unwrap_or_else(|_| "{}".to_string());
    format!(
        "import json\n{COMMAND_MARKER}{})\n{COMPANION}\n_run_once(_COMMAND)\n",
        python_str(&json)
    )
}

/// Extract the command embedded by [`per_call_script`].
pub fn embedded_command(script: &str) -> Option<Command> {
    let line = script
        .lines()
        .find_map(|l| l.strip_prefix(COMMAND_MARKER))?;
    let literal = line.strip_suffix(')')?;
    let json: String = serde_json::from_str(literal).ok()?;
    serde_json::from_str(&json).ok()
}

/// A JSON string literal is also a valid Python string literal.
fn python_str(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}
