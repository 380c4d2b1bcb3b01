//! Result types for cache operations.

use std::fmt;

/// Outcome of a cache verb.
///
/// The cache never raises for flow control; every verb reports through
/// this single enumeration and the session layer translates it to wire
/// tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// The value was stored.
    Stored,

    /// The key was deleted.
    Deleted,

    /// The key does not exist.
    NotFound,

    /// Operation-specific store failure: add on an existing key,
    /// replace on a missing key, integer parse failure, or a full
    /// table.
    SetError,

    /// CAS version mismatch: the value changed since it was read.
    CasExists,
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stored => write!(f, "stored"),
            Self::Deleted => write!(f, "deleted"),
            Self::NotFound => write!(f, "not found"),
            Self::SetError => write!(f, "not stored"),
            Self::CasExists => write!(f, "version mismatch"),
        }
    }
}

/// Error parsing a stored value as an unsigned decimal integer, raised
/// by `incr`/`decr` and surfaced as [`CacheStatus::SetError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueError {
    /// The value is not a decimal unsigned integer.
    NotANumber,
}

impl fmt::Display for ValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotANumber => write!(f, "not a number"),
        }
    }
}

impl std::error::Error for ValueError {}
