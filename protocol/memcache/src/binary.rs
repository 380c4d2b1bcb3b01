//! Binary protocol framing, reserved for a future binary session.
//!
//! Only the 24-byte request/response header layout is defined; there is
//! no binary state machine. The layout follows the memcache binary
//! protocol: all multi-byte fields are big-endian on the wire.

/// First byte of every binary request.
pub const REQUEST_MAGIC: u8 = 0x80;

/// First byte of every binary response.
pub const RESPONSE_MAGIC: u8 = 0x81;

/// Encoded size of either header.
pub const HEADER_LEN: usize = 24;

/// A binary request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub opcode: u8,
    pub key_length: u16,
    pub extras_length: u8,
    pub data_type: u8,
    pub vbucket_id: u16,
    pub total_body_length: u32,
    pub opaque: u32,
    pub cas: u64,
}

/// A binary response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub opcode: u8,
    pub key_length: u16,
    pub extras_length: u8,
    pub data_type: u8,
    pub status: u16,
    pub total_body_length: u32,
    pub opaque: u32,
    pub cas: u64,
}

/// Header decode failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    /// Fewer than [`HEADER_LEN`] bytes available.
    Truncated,
    /// The magic byte did not match.
    BadMagic(u8),
}

impl std::fmt::Display for HeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated header"),
            Self::BadMagic(magic) => write!(f, "bad magic byte {:#04x}", magic),
        }
    }
}

impl std::error::Error for HeaderError {}

impl RequestHeader {
    /// Decode a request header from the front of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, HeaderError> {
        if buf.len() < HEADER_LEN {
            return Err(HeaderError::Truncated);
        }
        if buf[0] != REQUEST_MAGIC {
            return Err(HeaderError::BadMagic(buf[0]));
        }
        Ok(RequestHeader {
            opcode: buf[1],
            key_length: u16::from_be_bytes([buf[2], buf[3]]),
            extras_length: buf[4],
            data_type: buf[5],
            vbucket_id: u16::from_be_bytes([buf[6], buf[7]]),
            total_body_length: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            opaque: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            cas: u64::from_be_bytes([
                buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
            ]),
        })
    }

    /// Encode the header into a fixed buffer.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = REQUEST_MAGIC;
        out[1] = self.opcode;
        out[2..4].copy_from_slice(&self.key_length.to_be_bytes());
        out[4] = self.extras_length;
        out[5] = self.data_type;
        out[6..8].copy_from_slice(&self.vbucket_id.to_be_bytes());
        out[8..12].copy_from_slice(&self.total_body_length.to_be_bytes());
        out[12..16].copy_from_slice(&self.opaque.to_be_bytes());
        out[16..24].copy_from_slice(&self.cas.to_be_bytes());
        out
    }
}

impl ResponseHeader {
    /// Decode a response header from the front of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, HeaderError> {
        if buf.len() < HEADER_LEN {
            return Err(HeaderError::Truncated);
        }
        if buf[0] != RESPONSE_MAGIC {
            return Err(HeaderError::BadMagic(buf[0]));
        }
        Ok(ResponseHeader {
            opcode: buf[1],
            key_length: u16::from_be_bytes([buf[2], buf[3]]),
            extras_length: buf[4],
            data_type: buf[5],
            status: u16::from_be_bytes([buf[6], buf[7]]),
            total_body_length: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            opaque: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            cas: u64::from_be_bytes([
                buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
            ]),
        })
    }

    /// Encode the header into a fixed buffer.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = RESPONSE_MAGIC;
        out[1] = self.opcode;
        out[2..4].copy_from_slice(&self.key_length.to_be_bytes());
        out[4] = self.extras_length;
        out[5] = self.data_type;
        out[6..8].copy_from_slice(&self.status.to_be_bytes());
        out[8..12].copy_from_slice(&self.total_body_length.to_be_bytes());
        out[12..16].copy_from_slice(&self.opaque.to_be_bytes());
        out[16..24].copy_from_slice(&self.cas.to_be_bytes());
        out
    }
}
