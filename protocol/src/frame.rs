use std::io::{self, BufRead, Read};

use serde::{de::DeserializeOwned, Serialize};

use crate::messages::Response;
use crate::MAX_RECORD_LEN;

/// Encode a record as one compact JSON line, newline included.
pub fn encode_record<T: Serialize>(msg: &T) -> io::Result<String> {
    let mut line =
        serde_json::to_string(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    line.push('\n');
    Ok(line)
}

/// Write one newline-terminated JSON record and flush.
pub fn write_record<W: io::Write, T: Serialize>(writer: &mut W, msg: &T) -> io::Result<()> {
    let line = encode_record(msg)?;
    writer.write_all(line.as_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Decode a single record from one line of text (trailing newline optional).
pub fn decode_record<T: DeserializeOwned>(line: &str) -> io::Result<T> {
    serde_json::from_str(line.trim_end_matches(['\r', '\n']))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Read the next newline-delimited JSON record.
/// Returns None on EOF. Blank lines between records are skipped.
/// A record cut off by EOF is rejected rather than decoded.
pub fn read_record<R: BufRead, T: DeserializeOwned>(reader: &mut R) -> io::Result<Option<T>> {
    loop {
        let mut line = String::new();
        let limit = (MAX_RECORD_LEN + 1) as u64;
        let n = reader.by_ref().take(limit).read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }
        if line.len() > MAX_RECORD_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Record too large: more than {} bytes", MAX_RECORD_LEN),
            ));
        }
        if !line.ends_with('\n') {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Stream ended in the middle of a record",
            ));
        }
        if line.trim().is_empty() {
            continue;
        }
        return decode_record(&line).map(Some);
    }
}

/// Find the last well-formed Response in captured program output.
///
/// Anything else the program printed (banners, progress, warnings) is
/// skipped, including lines that merely look like JSON.
pub fn last_response_in(output: &str) -> Option<Response> {
    output
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str::<Response>(line).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Command, Params};
    use serde_json::json;
    use std::io::Cursor;

    #[test]
    fn test_write_is_single_line() {
        let mut params = Params::new();
        params.insert("text".into(), json!("line one\nline two"));
        let mut buf = Vec::new();
        write_record(&mut buf, &Command::new(1, "annotate", params)).unwrap();

        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.matches('\n').count(), 1);
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn test_read_sequence_then_eof() {
        let input = b"{\"id\":1,\"success\":true,\"result\":1}\n\n{\"id\":2,\"success\":false,\"error\":\"x\"}\n";
        let mut cursor = Cursor::new(&input[..]);

        let first: Response = read_record(&mut cursor).unwrap().unwrap();
        assert_eq!(first.id, 1);
        let second: Response = read_record(&mut cursor).unwrap().unwrap();
        assert_eq!(second.error.as_deref(), Some("x"));
        assert!(read_record::<_, Response>(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_malformed_record_is_invalid_data() {
        let mut cursor = Cursor::new(&b"{not json}\n"[..]);
        let err = read_record::<_, Response>(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_truncated_record_rejected() {
        let mut cursor = Cursor::new(&b"{\"id\":1,\"succ"[..]);
        let err = read_record::<_, Response>(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_read_across_small_chunks() {
        // BufReader over a reader that hands out 3 bytes at a time
        struct Trickle<'a>(&'a [u8]);
        impl Read for Trickle<'_> {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                let n = self.0.len().min(3).min(buf.len());
                buf[..n].copy_from_slice(&self.0[..n]);
                self.0 = &self.0[n..];
                Ok(n)
            }
        }
        let data = b"{\"id\":7,\"command\":\"ping\",\"params\":{}}\n";
        let mut reader = io::BufReader::with_capacity(4, Trickle(data));
        let cmd: Command = read_record(&mut reader).unwrap().unwrap();
        assert_eq!(cmd.id, 7);
    }

    #[test]
    fn test_last_response_ignores_noise() {
        let output = "FreeCAD 0.21 banner\n\
                      {\"id\":9,\"success\":true,\"result\":\"early\"}\n\
                      {\"progress\": 50}\n\
                      {\"id\":9,\"success\":true,\"result\":\"final\"}\n\
                      Exiting...\n";
        let resp = last_response_in(output).unwrap();
        assert_eq!(resp.result, Some(json!("final")));
    }

    #[test]
    fn test_last_response_none_when_absent() {
        assert!(last_response_in("nothing here\n{\"partial\": \n").is_none());
    }
}
