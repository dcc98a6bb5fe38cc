//! Child process ownership shared by the process-backed transports.
//!
//! stdout is a structured channel: a reader thread forwards complete lines
//! over an mpsc channel so reads can be bounded by a deadline. stdin is
//! owned by a writer thread for the same reason, since a child that stops
//! reading would otherwise block the caller inside `write`. stderr is
//! drained on its own thread into the log and a short tail kept for crash
//! reports.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command as ProcessCommand, ExitStatus, Stdio};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use cadlink_protocol::{decode_record, encode_record, Command, Response, MAX_RECORD_LEN};
use parking_lot::Mutex;

use super::{check_response_id, BackendKind};
use crate::error::{Error, Result};

/// Environment every engine child needs to run without a display.
pub(crate) const HEADLESS_ENV: [(&str, &str); 3] = [
    ("QT_QPA_PLATFORM", "offscreen"),
    ("DISPLAY", ":99"),
    ("PYTHONUNBUFFERED", "1"),
];

const STDERR_TAIL_LINES: usize = 32;
const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// How long to keep draining stdout after the child is seen to have exited.
const EXIT_DRAIN: Duration = Duration::from_millis(250);

/// Everything needed to start one engine child.
#[derive(Debug, Clone)]
pub(crate) struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn envs<'a>(mut self, vars: impl IntoIterator<Item = (&'a String, &'a String)>) -> Self {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }
}

/// How strictly stdout lines are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadMode {
    /// Before the engine has answered anything: lines that are not JSON
    /// objects are engine banners and get skipped.
    Handshake,
    /// Every non-blank line must be a valid record.
    Strict,
}

enum StdoutEvent {
    /// Raw bytes up to and including the newline. Engines are free to
    /// print banners in any encoding.
    Line(Vec<u8>),
    Eof,
    Failed(io::Error),
}

/// A running engine child with piped stdio.
pub(crate) struct EngineProcess {
    kind: BackendKind,
    child: Child,
    pid: u32,
    /// Feeds the stdin writer thread. Dropping it closes the child's stdin.
    stdin: Option<mpsc::Sender<Vec<u8>>>,
    written: mpsc::Receiver<io::Result<()>>,
    stdout: mpsc::Receiver<StdoutEvent>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    exit_status: Option<ExitStatus>,
    answered: bool,
}

impl EngineProcess {
    pub fn spawn(kind: BackendKind, spec: &LaunchSpec) -> io::Result<Self> {
        let mut cmd = ProcessCommand::new(&spec.program);
        cmd.args(&spec.args);
        for (key, value) in HEADLESS_ENV {
            cmd.env(key, value);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group so launcher wrappers and their children are
        // signalled together.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn()?;
        let pid = child.id();
        let pumps = match Pumps::start(kind, pid, &mut child) {
            Ok(pumps) => pumps,
            Err(e) => return Err(abandon(&mut child, e)),
        };

        tracing::info!(
            backend = %kind,
            pid,
            program = %spec.program.display(),
            "spawned engine process"
        );

        Ok(Self {
            kind,
            child,
            pid,
            stdin: Some(pumps.stdin),
            written: pumps.written,
            stdout: pumps.stdout,
            stderr_tail: pumps.stderr_tail,
            exit_status: None,
            answered: false,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Non-blocking exit check. Caches the status once observed.
    pub fn poll_exit(&mut self) -> Option<ExitStatus> {
        if self.exit_status.is_none() {
            if let Ok(Some(status)) = self.child.try_wait() {
                self.exit_status = Some(status);
            }
        }
        self.exit_status
    }

    pub fn is_running(&mut self) -> bool {
        self.poll_exit().is_none()
    }

    /// One request/response round trip. Until the engine has produced its
    /// first record, stray banner lines on stdout are tolerated.
    pub fn exchange(&mut self, command: &Command, timeout: Duration) -> Result<Response> {
        let deadline = Instant::now() + timeout;
        self.send(command, timeout)?;
        let mode = if self.answered {
            ReadMode::Strict
        } else {
            ReadMode::Handshake
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        let response = self.recv(remaining, mode).map_err(|e| match e {
            Error::Timeout(_) => Error::Timeout(timeout),
            other => other,
        })?;
        check_response_id(command, &response)?;
        self.answered = true;
        Ok(response)
    }

    /// Record that the engine has already spoken (e.g. a startup record).
    pub fn mark_answered(&mut self) {
        self.answered = true;
    }

    /// Hand one command record to the stdin writer and wait at most
    /// `timeout` for it to be written. A child that has stopped reading
    /// stdin shows up as a timeout rather than a blocked caller.
    pub fn send(&mut self, command: &Command, timeout: Duration) -> Result<()> {
        if self.poll_exit().is_some() {
            return Err(self.crash_error("process exited before the command was sent"));
        }
        let line = encode_record(command)
            .map_err(|e| Error::Protocol(format!("cannot encode command: {e}")))?;
        let Some(stdin) = self.stdin.as_ref() else {
            return Err(self.crash_error("stdin already closed"));
        };
        if stdin.send(line.into_bytes()).is_err() {
            self.wait_timeout(EXIT_DRAIN);
            return Err(self.crash_error("stdin writer has stopped"));
        }
        match self.written.recv_timeout(timeout) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.wait_timeout(EXIT_DRAIN);
                Err(self.crash_error(&format!("write failed: {e}")))
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!(backend = %self.kind, pid = self.pid, "engine is not reading its input");
                Err(Error::Timeout(timeout))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                self.wait_timeout(EXIT_DRAIN);
                Err(self.crash_error("stdin writer has stopped"))
            }
        }
    }

    /// Wait for the next response record until `timeout` elapses.
    pub fn recv(&mut self, timeout: Duration, mode: ReadMode) -> Result<Response> {
        let deadline = Instant::now() + timeout;
        let mut exited_at: Option<Instant> = None;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(timeout));
            }
            let slice = (deadline - now).min(Duration::from_millis(100));

            match self.stdout.recv_timeout(slice) {
                Ok(StdoutEvent::Line(bytes)) => {
                    let trimmed = match std::str::from_utf8(&bytes) {
                        Ok(line) => line.trim(),
                        Err(_) if mode == ReadMode::Handshake => {
                            tracing::debug!(
                                backend = %self.kind,
                                "skipping non-UTF-8 engine output: {}",
                                String::from_utf8_lossy(&bytes).trim()
                            );
                            continue;
                        }
                        Err(e) => {
                            return Err(Error::Protocol(format!(
                                "non-UTF-8 output from {}: {e}",
                                self.kind
                            )))
                        }
                    };
                    if trimmed.is_empty() {
                        continue;
                    }
                    if mode == ReadMode::Handshake && !trimmed.starts_with('{') {
                        tracing::debug!(backend = %self.kind, "skipping engine output: {}", trimmed);
                        continue;
                    }
                    return decode_record::<Response>(trimmed)
                        .map_err(|e| Error::Protocol(format!("malformed record from {}: {e}", self.kind)));
                }
                Ok(StdoutEvent::Failed(e)) if e.kind() == io::ErrorKind::InvalidData => {
                    return Err(Error::Protocol(format!("unreadable output from {}: {e}", self.kind)));
                }
                Ok(StdoutEvent::Failed(e)) => {
                    self.wait_timeout(EXIT_DRAIN);
                    return Err(self.crash_error(&format!("stdout read failed: {e}")));
                }
                Ok(StdoutEvent::Eof) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                    self.wait_timeout(EXIT_DRAIN);
                    return Err(self.crash_error("stdout closed before a response arrived"));
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    // Exited but something else still holds stdout open.
                    if self.poll_exit().is_some() {
                        let since = *exited_at.get_or_insert_with(Instant::now);
                        if since.elapsed() >= EXIT_DRAIN {
                            return Err(self.crash_error("process exited before responding"));
                        }
                    }
                }
            }
        }
    }

    /// Collect everything the child prints on stdout until it closes it,
    /// then wait for the exit status. Used for one-shot invocations.
    pub fn collect_output(&mut self, timeout: Duration) -> Result<(String, ExitStatus)> {
        let deadline = Instant::now() + timeout;
        self.stdin.take();
        let mut output = String::new();

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(timeout));
            }
            match self.stdout.recv_timeout(deadline - now) {
                // Only the response record has to be valid UTF-8.
                Ok(StdoutEvent::Line(bytes)) => output.push_str(&String::from_utf8_lossy(&bytes)),
                Ok(StdoutEvent::Failed(e)) => {
                    tracing::warn!(backend = %self.kind, "stdout read failed: {}", e);
                    break;
                }
                Ok(StdoutEvent::Eof) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => return Err(Error::Timeout(timeout)),
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.wait_timeout(remaining) {
            Some(status) => Ok((output, status)),
            None => Err(Error::Timeout(timeout)),
        }
    }

    /// Build a crash error from the current exit status and stderr tail.
    pub fn crash_error(&mut self, context: &str) -> Error {
        let exit_code = self.poll_exit().and_then(|s| s.code());
        let mut detail = context.to_string();
        let tail = self.stderr_tail();
        if !tail.is_empty() {
            detail.push_str("; stderr: ");
            detail.push_str(&tail.join(" | "));
        }
        Error::ProcessCrash { exit_code, detail }
    }

    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail.lock().iter().cloned().collect()
    }

    /// Close stdin, give the child `grace` to exit on its own, then
    /// terminate, then kill.
    pub fn shutdown(mut self, grace: Duration) {
        self.stdin.take();
        let half = grace / 2;

        if self.wait_timeout(half).is_none() {
            tracing::debug!(backend = %self.kind, pid = self.pid, "engine still running, sending terminate");
            self.terminate();
            if self.wait_timeout(half).is_none() {
                tracing::warn!(backend = %self.kind, pid = self.pid, "engine ignored terminate, killing");
                self.kill_now();
            }
        }
        tracing::info!(backend = %self.kind, pid = self.pid, status = ?self.exit_status, "engine process stopped");
    }

    /// Kill without a grace period.
    pub fn kill(mut self) {
        self.stdin.take();
        self.kill_now();
        tracing::info!(backend = %self.kind, pid = self.pid, "engine process killed");
    }

    fn kill_now(&mut self) {
        if self.poll_exit().is_some() {
            return;
        }
        #[cfg(unix)]
        self.signal(libc::SIGKILL);
        let _ = self.child.kill();
        if let Ok(status) = self.child.wait() {
            self.exit_status = Some(status);
        }
    }

    fn terminate(&mut self) {
        #[cfg(unix)]
        self.signal(libc::SIGTERM);
        #[cfg(not(unix))]
        {
            let _ = self.child.kill();
        }
    }

    #[cfg(unix)]
    fn signal(&self, signal: i32) {
        // Negative pid addresses the whole process group.
        let result = unsafe { libc::kill(-(self.pid as i32), signal) };
        if result != 0 {
            let err = io::Error::last_os_error();
            tracing::debug!(backend = %self.kind, pid = self.pid, "signal {} failed: {}", signal, err);
        }
    }

    fn wait_timeout(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.poll_exit() {
                return Some(status);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        if self.poll_exit().is_none() {
            self.stdin.take();
            self.kill_now();
        }
    }
}

/// Channels to the I/O threads of one child.
struct Pumps {
    stdin: mpsc::Sender<Vec<u8>>,
    written: mpsc::Receiver<io::Result<()>>,
    stdout: mpsc::Receiver<StdoutEvent>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl Pumps {
    fn start(kind: BackendKind, pid: u32, child: &mut Child) -> io::Result<Self> {
        let stdin = child.stdin.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "child stdin was not captured")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "child stdout was not captured")
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "child stderr was not captured")
        })?;

        let (out_tx, out_rx) = mpsc::channel();
        thread::Builder::new()
            .name(format!("cadlink-{kind}-stdout"))
            .spawn(move || pump_stdout(stdout, out_tx))?;

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let tail = stderr_tail.clone();
        thread::Builder::new()
            .name(format!("cadlink-{kind}-stderr"))
            .spawn(move || drain_stderr(kind, pid, stderr, tail))?;

        let (line_tx, line_rx) = mpsc::channel();
        let (written_tx, written_rx) = mpsc::channel();
        thread::Builder::new()
            .name(format!("cadlink-{kind}-stdin"))
            .spawn(move || pump_stdin(stdin, line_rx, written_tx))?;

        Ok(Self {
            stdin: line_tx,
            written: written_rx,
            stdout: out_rx,
            stderr_tail,
        })
    }
}

/// Kill and reap a child whose I/O threads could not be started.
fn abandon(child: &mut Child, err: io::Error) -> io::Error {
    let _ = child.kill();
    let _ = child.wait();
    err
}

fn pump_stdin(
    mut stdin: ChildStdin,
    lines: mpsc::Receiver<Vec<u8>>,
    written: mpsc::Sender<io::Result<()>>,
) {
    for line in lines {
        let result = stdin.write_all(&line).and_then(|()| stdin.flush());
        let failed = result.is_err();
        if written.send(result).is_err() || failed {
            return;
        }
    }
}

fn pump_stdout(stdout: impl Read, tx: mpsc::Sender<StdoutEvent>) {
    let mut reader = BufReader::new(stdout);
    loop {
        let mut line = Vec::new();
        let limit = (MAX_RECORD_LEN + 1) as u64;
        let event = match reader.by_ref().take(limit).read_until(b'\n', &mut line) {
            Ok(0) => StdoutEvent::Eof,
            Ok(_) if line.len() > MAX_RECORD_LEN => StdoutEvent::Failed(io::Error::new(
                io::ErrorKind::InvalidData,
                "record exceeds maximum length",
            )),
            Ok(_) => StdoutEvent::Line(line),
            Err(e) => StdoutEvent::Failed(e),
        };
        let done = !matches!(event, StdoutEvent::Line(_));
        if tx.send(event).is_err() || done {
            return;
        }
    }
}

fn drain_stderr(
    kind: BackendKind,
    pid: u32,
    stderr: impl Read,
    tail: Arc<Mutex<VecDeque<String>>>,
) {
    let reader = BufReader::new(stderr);
    for line in reader.split(b'\n') {
        let Ok(line) = line else { return };
        let line = String::from_utf8_lossy(&line).trim_end().to_string();
        tracing::debug!(target: "cadlink::engine", backend = %kind, pid, "{}", line);
        let mut tail = tail.lock();
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}
