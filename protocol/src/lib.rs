//! Wire protocol shared by every cadlink transport.
//!
//! One JSON object per line, UTF-8, newline-terminated. The same records
//! travel over child stdio, TCP sockets and captured CLI output.

pub mod frame;
pub mod messages;

pub use frame::{decode_record, encode_record, last_response_in, read_record, write_record};
pub use messages::{Command, Params, Response, PROBE_COMMAND, PROBE_ID};

/// Upper bound for a single record, newline included.
pub const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;
