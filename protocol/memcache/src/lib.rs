//! Server-side parsing and encoding for the memcache ASCII protocol.
//!
//! Commands are CRLF-terminated lines. Storage commands announce a data
//! block length; the block (payload plus CRLF) follows the command line
//! and is read by the session, not this parser. Responses are encoded
//! straight into the session's write buffer.

#![warn(clippy::all)]

pub mod binary;

mod command;
mod response;

pub use command::{parse, Command, ParseError, StoreVerb, MAX_COMMAND_LINE, MAX_KEY_LEN};
pub use response::{encode_stat, encode_stat_str, encode_value_header, Response};
