//! Error taxonomy for the connection core.
//!
//! Callers mostly need one bit of information: is the channel broken
//! ([`Error::is_transport`], reconnect) or was this one command rejected
//! ([`Error::Command`], fix the request).

use std::time::Duration;

use thiserror::Error;

use crate::backend::BackendKind;
use crate::manager::ConnectionState;

#[derive(Debug, Error)]
pub enum Error {
    /// The transport could not be established.
    #[error("{backend} connection failed: {message}")]
    Connection {
        backend: BackendKind,
        message: String,
    },

    /// A record could not be parsed or did not answer the outstanding command.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("engine process exited unexpectedly (exit code {}): {detail}", display_code(.exit_code))]
    ProcessCrash {
        exit_code: Option<i32>,
        detail: String,
    },

    /// The engine answered and reported that the command failed.
    #[error("command {id} failed: {message}")]
    Command { id: u64, message: String },

    #[error("no backend available ({})", summarize_attempts(.attempts))]
    NoBackendAvailable { attempts: Vec<(BackendKind, String)> },

    #[error("not connected (state: {state})")]
    NotConnected { state: ConnectionState },

    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },

    #[error("invalid config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Stable tag for an [`Error`], reported through `status()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Protocol,
    Timeout,
    ProcessCrash,
    Command,
    NoBackendAvailable,
    NotConnected,
    InvalidState,
    Config,
}

impl Error {
    pub fn connection(backend: BackendKind, message: impl Into<String>) -> Self {
        Self::Connection {
            backend,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::ProcessCrash { .. } => ErrorKind::ProcessCrash,
            Self::Command { .. } => ErrorKind::Command,
            Self::NoBackendAvailable { .. } => ErrorKind::NoBackendAvailable,
            Self::NotConnected { .. } => ErrorKind::NotConnected,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// True when the channel itself is broken and the connection must be
    /// re-established before further commands.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Protocol(_) | Self::Timeout(_) | Self::ProcessCrash { .. }
        )
    }

    /// Exit code carried by a [`Error::ProcessCrash`].
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::ProcessCrash { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}

fn display_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn summarize_attempts(attempts: &[(BackendKind, String)]) -> String {
    if attempts.is_empty() {
        return "no candidates configured".to_string();
    }
    attempts
        .iter()
        .map(|(kind, why)| format!("{kind}: {why}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_flagged() {
        assert!(Error::connection(BackendKind::Server, "refused").is_transport());
        assert!(Error::Protocol("bad".into()).is_transport());
        assert!(Error::Timeout(Duration::from_secs(1)).is_transport());
        assert!(Error::ProcessCrash {
            exit_code: Some(1),
            detail: String::new()
        }
        .is_transport());
    }

    #[test]
    fn command_error_is_not_transport() {
        let err = Error::Command {
            id: 3,
            message: "radius must be positive".into(),
        };
        assert!(!err.is_transport());
        assert_eq!(err.kind(), ErrorKind::Command);
    }

    #[test]
    fn crash_message_includes_exit_code() {
        let err = Error::ProcessCrash {
            exit_code: Some(1),
            detail: "stdout closed".into(),
        };
        assert_eq!(err.exit_code(), Some(1));
        assert!(err.to_string().contains("exit code 1"));

        let unknown = Error::ProcessCrash {
            exit_code: None,
            detail: "killed".into(),
        };
        assert!(unknown.to_string().contains("exit code unknown"));
    }

    #[test]
    fn no_backend_lists_attempts() {
        let err = Error::NoBackendAvailable {
            attempts: vec![
                (BackendKind::Launcher, "launcher not found".into()),
                (BackendKind::Server, "refused".into()),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("launcher: launcher not found"));
        assert!(text.contains("server: refused"));
    }
}
