use std::io::{self, BufRead, BufReader, Read};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use cadlink_protocol::{decode_record, write_record, Command, Response, MAX_RECORD_LEN};

use super::{check_response_id, Backend, BackendDescriptor, BackendKind, SERVER};
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};

/// TCP client for a command server already running inside a live engine.
/// Never starts that server itself.
pub struct SocketBackend {
    host: String,
    port: u16,
    connect_timeout: Duration,
    stream: Option<SocketStream>,
}

struct SocketStream {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl SocketBackend {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            connect_timeout: config.connect_timeout(),
            stream: None,
        }
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.stream.as_ref().and_then(|s| s.writer.local_addr().ok())
    }

    fn open(&self) -> Result<TcpStream> {
        let addrs = (self.host.as_str(), self.port).to_socket_addrs().map_err(|e| {
            Error::connection(
                BackendKind::Server,
                format!("cannot resolve {}:{}: {e}", self.host, self.port),
            )
        })?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    tracing::debug!(backend = %BackendKind::Server, %addr, "connect failed: {}", e);
                    last_err = Some(e);
                }
            }
        }
        Err(Error::connection(
            BackendKind::Server,
            match last_err {
                Some(e) => format!("cannot reach {}:{}: {e}", self.host, self.port),
                None => format!("{}:{} resolved to no addresses", self.host, self.port),
            },
        ))
    }
}

impl Backend for SocketBackend {
    fn descriptor(&self) -> &'static BackendDescriptor {
        &SERVER
    }

    fn is_available(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }

    fn connect(&mut self) -> Result<()> {
        self.disconnect();

        let stream = self.open()?;
        stream.set_nodelay(true).ok();
        let writer = stream.try_clone().map_err(|e| {
            Error::connection(BackendKind::Server, format!("cannot clone socket: {e}"))
        })?;
        tracing::info!(
            backend = %BackendKind::Server,
            peer = %format!("{}:{}", self.host, self.port),
            "connected to engine server"
        );
        self.stream = Some(SocketStream {
            reader: BufReader::new(stream),
            writer,
        });
        Ok(())
    }

    /// A peer that closes before replying is a connection failure, not a
    /// protocol error: the channel is gone and no record was malformed.
    fn execute(&mut self, command: &Command, timeout: Duration) -> Result<Response> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::connection(BackendKind::Server, "socket not connected"))?;
        let deadline = Instant::now() + timeout;

        stream
            .writer
            .set_write_timeout(non_zero(timeout))
            .map_err(|e| Error::connection(BackendKind::Server, e.to_string()))?;
        write_record(&mut stream.writer, command).map_err(|e| io_error(e, timeout))?;

        let mut line = String::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout(timeout));
            }
            stream
                .reader
                .get_ref()
                .set_read_timeout(Some(remaining))
                .map_err(|e| Error::connection(BackendKind::Server, e.to_string()))?;

            let budget = (MAX_RECORD_LEN + 1 - line.len()) as u64;
            match stream.reader.by_ref().take(budget).read_line(&mut line) {
                Ok(0) => {
                    return Err(Error::connection(
                        BackendKind::Server,
                        "server closed the connection",
                    ))
                }
                Ok(_) if line.len() > MAX_RECORD_LEN => {
                    return Err(Error::Protocol("record exceeds maximum length".into()))
                }
                Ok(_) if !line.ends_with('\n') => continue,
                Ok(_) if line.trim().is_empty() => line.clear(),
                Ok(_) => break,
                Err(e) => return Err(io_error(e, timeout)),
            }
        }

        let response: Response = decode_record(&line)
            .map_err(|e| Error::Protocol(format!("malformed record from server: {e}")))?;
        check_response_id(command, &response)?;
        Ok(response)
    }

    fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.writer.shutdown(Shutdown::Both);
            tracing::info!(backend = %BackendKind::Server, "socket closed");
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

fn non_zero(d: Duration) -> Option<Duration> {
    if d.is_zero() {
        Some(Duration::from_millis(1))
    } else {
        Some(d)
    }
}

/// A read deadline cannot tell a hung server from a slow one; both are
/// reported as a timeout.
fn io_error(e: io::Error, timeout: Duration) -> Error {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::Timeout(timeout),
        io::ErrorKind::InvalidData => Error::Protocol(e.to_string()),
        _ => Error::connection(BackendKind::Server, e.to_string()),
    }
}
