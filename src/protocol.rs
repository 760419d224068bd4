//! Text protocol framing helpers and response generator.
//!
//! Request lines are `\r\n` terminated and split on ASCII whitespace.
//! Value-bearing requests carry a header line followed by a raw data block:
//!
//! ```text
//! <command> <key> <flags> <exptime> <bytes>\r\n
//! <data block>\r\n
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use std::str;

/// Line terminator used throughout the protocol
pub const CRLF: &[u8] = b"\r\n";

/// Longest command line accepted before its `\r\n` arrives
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Token count of a well-formed value command header
pub const VALUE_HEADER_TOKENS: usize = 5;

/// Find `\r\n` in buffer, returning the position of `\r`.
pub fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|window| window == CRLF)
}

/// Split a command line into tokens. Returns `None` if the line is not UTF-8.
pub fn tokenize(line: &[u8]) -> Option<Vec<&str>> {
    let line = str::from_utf8(line).ok()?;
    Some(line.split_ascii_whitespace().collect())
}

/// Parsed value command header (`<key> <flags> <exptime> <bytes>`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueHeader<'a> {
    pub key: &'a str,
    pub flags: &'a str,
    pub exptime: i64,
    pub bytes: usize,
}

/// Result of parsing a value command header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderParse<'a> {
    /// Well-formed header; the data block follows
    Complete(ValueHeader<'a>),
    /// Malformed header with a readable length: the data block must be skipped
    Skip { bytes: usize },
    /// Too few tokens to know whether a data block follows
    NoLength,
    /// The length token is present but unreadable; framing is lost
    BadLength,
}

/// Parse a value command header from the full token list (`args[0]` is the
/// command name).
pub fn parse_value_header<'a>(args: &[&'a str]) -> HeaderParse<'a> {
    if args.len() < VALUE_HEADER_TOKENS {
        return HeaderParse::NoLength;
    }

    let bytes = match args[4].parse::<usize>() {
        Ok(bytes) => bytes,
        Err(_) => return HeaderParse::BadLength,
    };

    if args.len() != VALUE_HEADER_TOKENS {
        return HeaderParse::Skip { bytes };
    }

    match args[3].parse::<i64>() {
        Ok(exptime) => HeaderParse::Complete(ValueHeader {
            key: args[1],
            flags: args[2],
            exptime,
            bytes,
        }),
        Err(_) => HeaderParse::Skip { bytes },
    }
}

/// Response generator
pub struct Response;

impl Response {
    /// Generate a VALUE block
    pub fn value(key: &str, flags: &str, data: &[u8]) -> Bytes {
        let header = format!("VALUE {} {} {}\r\n", key, flags, data.len());
        let mut response = BytesMut::with_capacity(header.len() + data.len() + CRLF.len());
        response.put_slice(header.as_bytes());
        response.put_slice(data);
        response.put_slice(CRLF);
        response.freeze()
    }

    /// Generate a STAT line
    pub fn stat(name: &str, value: u64) -> Bytes {
        Bytes::from(format!("STAT {} {}\r\n", name, value))
    }

    pub fn end() -> Bytes {
        Bytes::from_static(b"END\r\n")
    }

    pub fn stored() -> Bytes {
        Bytes::from_static(b"STORED\r\n")
    }

    pub fn not_stored() -> Bytes {
        Bytes::from_static(b"NOT_STORED\r\n")
    }

    pub fn deleted() -> Bytes {
        Bytes::from_static(b"DELETED\r\n")
    }

    pub fn not_found() -> Bytes {
        Bytes::from_static(b"NOT_FOUND\r\n")
    }

    pub fn ok() -> Bytes {
        Bytes::from_static(b"OK\r\n")
    }

    pub fn client_error() -> Bytes {
        Bytes::from_static(b"CLIENT_ERROR\r\n")
    }
}
