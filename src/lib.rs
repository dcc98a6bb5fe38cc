//! Connection core for driving a CAD engine process.
//!
//! A [`ConnectionManager`] owns one [`Backend`] at a time and forwards
//! [`Command`] records to it. Backends differ only in transport: a
//! long-lived launcher with a companion script, a Python interpreter that
//! imports the engine directly, a TCP server inside a running engine, a
//! fresh command-line process per call, or an in-process simulation.

pub mod backend;
pub mod config;
pub mod error;
pub mod logging;
pub mod manager;
pub mod retry;

pub use backend::{Backend, BackendDescriptor, BackendKind};
pub use cadlink_protocol::{Command, Params, Response, PROBE_COMMAND, PROBE_ID};
pub use config::{ConnectionConfig, ConnectionMethod};
pub use error::{Error, ErrorKind, Result};
pub use manager::{Attempt, AttemptOutcome, ConnectionManager, ConnectionState, Status};
pub use retry::RetryPolicy;
