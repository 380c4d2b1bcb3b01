//! Command-line parsing.

use std::fmt;

/// Longest accepted key, per the protocol.
pub const MAX_KEY_LEN: usize = 250;

/// Longest accepted command line, including the CRLF.
pub const MAX_COMMAND_LINE: usize = 4096;

/// A parsed command line borrowing from the session's input buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Command<'a> {
    /// `get <key>+` / `gets <key>+`; `cas_unique` requests version
    /// tokens in the VALUE lines.
    Get {
        keys: Vec<&'a [u8]>,
        cas_unique: bool,
    },
    /// `set/add/replace/append/prepend <key> <flags> <exptime> <bytes>
    /// [noreply]` — `data_len` bytes plus CRLF follow the line.
    Store {
        verb: StoreVerb,
        key: &'a [u8],
        flags: u32,
        exptime: u32,
        data_len: usize,
        noreply: bool,
    },
    /// `cas <key> <flags> <exptime> <bytes> <cas unique> [noreply]`.
    Cas {
        key: &'a [u8],
        flags: u32,
        exptime: u32,
        data_len: usize,
        version: u64,
        noreply: bool,
    },
    /// `delete <key> [noreply]`.
    Delete { key: &'a [u8], noreply: bool },
    /// `incr/decr <key> <value> [noreply]`.
    IncrDecr {
        incr: bool,
        key: &'a [u8],
        delta: u64,
        noreply: bool,
    },
    /// `touch <key> <exptime> [noreply]`.
    Touch {
        key: &'a [u8],
        exptime: u32,
        noreply: bool,
    },
    /// `flush_all [delay] [noreply]`.
    FlushAll { delay: u32, noreply: bool },
    /// `stats`.
    Stats,
    /// `version`.
    Version,
    /// `quit`.
    Quit,
    /// An empty line, ignored.
    Empty,
}

/// Storage verbs sharing the `<key> <flags> <exptime> <bytes>` shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreVerb {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
}

impl fmt::Display for StoreVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Set => write!(f, "set"),
            Self::Add => write!(f, "add"),
            Self::Replace => write!(f, "replace"),
            Self::Append => write!(f, "append"),
            Self::Prepend => write!(f, "prepend"),
        }
    }
}

/// A client error: the command line could not be understood. The
/// message goes back verbatim after `CLIENT_ERROR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Not a recognized command name.
    UnknownCommand,
    /// `<key>` missing or longer than [`MAX_KEY_LEN`].
    BadKey,
    /// A numeric field was missing or not a number.
    BadNumber(&'static str),
    /// Trailing tokens where `noreply` or end of line was expected.
    TrailingGarbage,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownCommand => write!(f, "unknown command"),
            Self::BadKey => write!(f, "bad key"),
            Self::BadNumber(field) => write!(f, "missing {}", field),
            Self::TrailingGarbage => write!(f, "expected noreply or end of command"),
        }
    }
}

impl std::error::Error for ParseError {}

struct Tokens<'a> {
    rest: &'a [u8],
}

impl<'a> Tokens<'a> {
    fn new(line: &'a [u8]) -> Self {
        Tokens { rest: line }
    }

    fn next(&mut self) -> Option<&'a [u8]> {
        let start = self.rest.iter().position(|&b| b != b' ')?;
        let rest = &self.rest[start..];
        let end = rest.iter().position(|&b| b == b' ').unwrap_or(rest.len());
        self.rest = &rest[end..];
        Some(&rest[..end])
    }

    fn key(&mut self) -> Result<&'a [u8], ParseError> {
        match self.next() {
            Some(key) if !key.is_empty() && key.len() <= MAX_KEY_LEN => Ok(key),
            _ => Err(ParseError::BadKey),
        }
    }

    fn number<T: Number>(&mut self, field: &'static str) -> Result<T, ParseError> {
        let token = self.next().ok_or(ParseError::BadNumber(field))?;
        parse_number(token).ok_or(ParseError::BadNumber(field))
    }

    fn noreply(&mut self) -> Result<bool, ParseError> {
        match self.next() {
            None => Ok(false),
            Some(b"noreply") => match self.next() {
                None => Ok(true),
                Some(_) => Err(ParseError::TrailingGarbage),
            },
            Some(_) => Err(ParseError::TrailingGarbage),
        }
    }

    fn end(&mut self) -> Result<(), ParseError> {
        match self.next() {
            None => Ok(()),
            Some(_) => Err(ParseError::TrailingGarbage),
        }
    }
}

trait Number: Sized {
    fn from_digit(value: Option<Self>, digit: u8) -> Option<Self>;
}

macro_rules! impl_number {
    ($($ty:ty),*) => {
        $(impl Number for $ty {
            fn from_digit(value: Option<Self>, digit: u8) -> Option<Self> {
                let value = value.unwrap_or(0);
                value
                    .checked_mul(10)?
                    .checked_add(digit as $ty)
            }
        })*
    };
}

impl_number!(u32, u64, usize);

fn parse_number<T: Number>(token: &[u8]) -> Option<T> {
    if token.is_empty() {
        return None;
    }
    let mut value = None;
    for &b in token {
        if !b.is_ascii_digit() {
            return None;
        }
        value = Some(T::from_digit(value, b - b'0')?);
    }
    value
}

/// Parse one CRLF-stripped command line.
pub fn parse(line: &[u8]) -> Result<Command<'_>, ParseError> {
    let mut tokens = Tokens::new(line);
    let Some(name) = tokens.next() else {
        return Ok(Command::Empty);
    };

    match name {
        b"get" | b"gets" => {
            let cas_unique = name == b"gets";
            let mut keys = Vec::new();
            while let Some(key) = tokens.next() {
                if key.is_empty() || key.len() > MAX_KEY_LEN {
                    return Err(ParseError::BadKey);
                }
                keys.push(key);
            }
            if keys.is_empty() {
                return Err(ParseError::BadKey);
            }
            Ok(Command::Get { keys, cas_unique })
        }
        b"set" | b"add" | b"replace" | b"append" | b"prepend" => {
            let verb = match name {
                b"set" => StoreVerb::Set,
                b"add" => StoreVerb::Add,
                b"replace" => StoreVerb::Replace,
                b"append" => StoreVerb::Append,
                _ => StoreVerb::Prepend,
            };
            let key = tokens.key()?;
            let flags = tokens.number("flags")?;
            let exptime = tokens.number("exptime")?;
            let data_len = tokens.number("bytes")?;
            let noreply = tokens.noreply()?;
            Ok(Command::Store {
                verb,
                key,
                flags,
                exptime,
                data_len,
                noreply,
            })
        }
        b"cas" => {
            let key = tokens.key()?;
            let flags = tokens.number("flags")?;
            let exptime = tokens.number("exptime")?;
            let data_len = tokens.number("bytes")?;
            let version = tokens.number("cas unique")?;
            let noreply = tokens.noreply()?;
            Ok(Command::Cas {
                key,
                flags,
                exptime,
                data_len,
                version,
                noreply,
            })
        }
        b"delete" => {
            let key = tokens.key()?;
            let noreply = tokens.noreply()?;
            Ok(Command::Delete { key, noreply })
        }
        b"incr" | b"decr" => {
            let key = tokens.key()?;
            let delta = tokens.number("value")?;
            let noreply = tokens.noreply()?;
            Ok(Command::IncrDecr {
                incr: name == b"incr",
                key,
                delta,
                noreply,
            })
        }
        b"touch" => {
            let key = tokens.key()?;
            let exptime = tokens.number("exptime")?;
            let noreply = tokens.noreply()?;
            Ok(Command::Touch {
                key,
                exptime,
                noreply,
            })
        }
        b"flush_all" => {
            // the delay argument is optional
            let mut delay = 0;
            let mut noreply = false;
            match tokens.next() {
                None => {}
                Some(b"noreply") => {
                    tokens.end()?;
                    noreply = true;
                }
                Some(token) => {
                    delay = parse_number(token).ok_or(ParseError::BadNumber("delay"))?;
                    noreply = tokens.noreply()?;
                }
            }
            Ok(Command::FlushAll { delay, noreply })
        }
        b"stats" => {
            tokens.end()?;
            Ok(Command::Stats)
        }
        b"version" => {
            tokens.end()?;
            Ok(Command::Version)
        }
        b"quit" => {
            tokens.end()?;
            Ok(Command::Quit)
        }
        _ => Err(ParseError::UnknownCommand),
    }
}
