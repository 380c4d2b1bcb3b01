//! Response encoding.

use bytes::BytesMut;

/// A response token or line, encoded into the session's write buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response<'a> {
    /// `STORED`
    Stored,
    /// `NOT_STORED`
    NotStored,
    /// `EXISTS`
    Exists,
    /// `NOT_FOUND`
    NotFound,
    /// `DELETED`
    Deleted,
    /// `TOUCHED`
    Touched,
    /// `END`
    End,
    /// Bare decimal value, the reply to a successful `incr`/`decr`.
    Number(u64),
    /// `VERSION <v>`
    Version(&'a str),
    /// `CLIENT_ERROR <msg>`
    ClientError(&'a str),
    /// `SERVER_ERROR <msg>`
    ServerError(&'a str),
}

const CRLF: &[u8] = b"\r\n";

impl Response<'_> {
    /// Append the encoded response line to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::Stored => buf.extend_from_slice(b"STORED\r\n"),
            Self::NotStored => buf.extend_from_slice(b"NOT_STORED\r\n"),
            Self::Exists => buf.extend_from_slice(b"EXISTS\r\n"),
            Self::NotFound => buf.extend_from_slice(b"NOT_FOUND\r\n"),
            Self::Deleted => buf.extend_from_slice(b"DELETED\r\n"),
            Self::Touched => buf.extend_from_slice(b"TOUCHED\r\n"),
            Self::End => buf.extend_from_slice(b"END\r\n"),
            Self::Number(value) => {
                let mut digits = itoa::Buffer::new();
                buf.extend_from_slice(digits.format(*value).as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Self::Version(version) => {
                buf.extend_from_slice(b"VERSION ");
                buf.extend_from_slice(version.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Self::ClientError(msg) => {
                buf.extend_from_slice(b"CLIENT_ERROR ");
                buf.extend_from_slice(msg.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Self::ServerError(msg) => {
                buf.extend_from_slice(b"SERVER_ERROR ");
                buf.extend_from_slice(msg.as_bytes());
                buf.extend_from_slice(CRLF);
            }
        }
    }
}

/// Encode a `VALUE` header line:
/// `VALUE <key> <flags> <bytes> [<version>]\r\n`.
pub fn encode_value_header(
    buf: &mut BytesMut,
    key: &[u8],
    flags: u32,
    size: usize,
    version: Option<u64>,
) {
    let mut digits = itoa::Buffer::new();
    buf.extend_from_slice(b"VALUE ");
    buf.extend_from_slice(key);
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(digits.format(flags).as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(digits.format(size).as_bytes());
    if let Some(version) = version {
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(digits.format(version).as_bytes());
    }
    buf.extend_from_slice(CRLF);
}

/// Encode a `STAT <name> <value>\r\n` line.
pub fn encode_stat(buf: &mut BytesMut, name: &str, value: u64) {
    let mut digits = itoa::Buffer::new();
    buf.extend_from_slice(b"STAT ");
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(digits.format(value).as_bytes());
    buf.extend_from_slice(CRLF);
}

/// Encode a `STAT <name> <value>\r\n` line with a string value.
pub fn encode_stat_str(buf: &mut BytesMut, name: &str, value: &str) {
    buf.extend_from_slice(b"STAT ");
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(value.as_bytes());
    buf.extend_from_slice(CRLF);
}
