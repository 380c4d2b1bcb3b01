//! Per-connection protocol session.
//!
//! A session alternates between reading CRLF-terminated command lines
//! and, for storage commands, reading the announced data block. All
//! output is staged into a write buffer the reactor drains. Transport
//! errors terminate the session only; they never reach the cache.

use crate::execute::{execute_line, execute_store, LineOutcome, PendingStore};
use bytes::{Buf, BytesMut};
use ember_cache::{Cache, Rope};
use ember_protocol::MAX_COMMAND_LINE;
use tracing::{debug, trace};

const READ_CHUNK: usize = 4096;

/// What the reactor should do with the connection after feeding input.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Keep the connection open.
    Continue,
    /// Close the connection once the write buffer drains.
    Close,
}

enum SessionState {
    /// Reading the next command line.
    Command,
    /// Reading `data_len + CRLF` bytes for a storage command.
    Data(PendingStore),
}

/// A text-protocol session over one connection.
pub struct Session {
    read_buf: BytesMut,
    write_buf: BytesMut,
    state: SessionState,
}

impl Session {
    pub fn new() -> Self {
        Session {
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::with_capacity(READ_CHUNK),
            state: SessionState::Command,
        }
    }

    /// Staged output waiting to be written to the socket.
    pub fn write_buf(&mut self) -> &mut BytesMut {
        &mut self.write_buf
    }

    /// Append received bytes and run the state machine as far as the
    /// buffered input allows.
    pub fn receive(&mut self, cache: &Cache, input: &[u8]) -> SessionOutcome {
        self.read_buf.extend_from_slice(input);
        self.advance(cache)
    }

    fn advance(&mut self, cache: &Cache) -> SessionOutcome {
        loop {
            match &self.state {
                SessionState::Command => {
                    let Some(line_len) = find_line(&self.read_buf) else {
                        if self.read_buf.len() > MAX_COMMAND_LINE {
                            // the whole command line must fit in the buffer
                            debug!("command overflow, closing session");
                            return SessionOutcome::Close;
                        }
                        return SessionOutcome::Continue;
                    };
                    let line = self.read_buf.split_to(line_len + 1);
                    let line = strip_line_ending(&line[..line_len]);
                    trace!(line = %String::from_utf8_lossy(line), "command");
                    match execute_line(cache, line, &mut self.write_buf) {
                        LineOutcome::Continue => {}
                        LineOutcome::Quit => return SessionOutcome::Close,
                        LineOutcome::NeedData(pending) => {
                            self.state = SessionState::Data(pending);
                        }
                    }
                }
                SessionState::Data(pending) => {
                    // the data block is the announced length plus CRLF
                    let needed = pending.data_len + 2;
                    if self.read_buf.len() < needed {
                        self.read_buf.reserve(needed - self.read_buf.len());
                        return SessionOutcome::Continue;
                    }
                    let data = Rope::from_bytes(&self.read_buf[..pending.data_len]);
                    execute_store(cache, pending, data, &mut self.write_buf);
                    self.read_buf.advance(needed);
                    self.state = SessionState::Command;
                }
            }
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Index of the LF ending the first complete line, if any.
fn find_line(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == b'\n')
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_cache::Domain;
    use std::sync::Arc;

    fn test_cache() -> Cache {
        let domain = Arc::new(Domain::new());
        domain.register();
        Cache::builder()
            .max_bytes(1024 * 1024)
            .initial_lg2size(8)
            .domain(domain)
            .build()
    }

    fn drain(session: &mut Session) -> Vec<u8> {
        session.write_buf().split().to_vec()
    }

    #[test]
    fn one_command_per_line() {
        let cache = test_cache();
        let mut session = Session::new();
        assert_eq!(
            session.receive(&cache, b"set pooh 0 0 4\r\nbear\r\nget pooh\r\n"),
            SessionOutcome::Continue
        );
        assert_eq!(
            drain(&mut session),
            b"STORED\r\nVALUE pooh 0 4\r\nbear\r\nEND\r\n"
        );
        cache.domain().exit();
    }

    #[test]
    fn data_block_split_across_reads() {
        let cache = test_cache();
        let mut session = Session::new();
        session.receive(&cache, b"set pooh 0 0 8\r\nbea");
        assert_eq!(drain(&mut session), b"");
        session.receive(&cache, b"rbear\r\n");
        assert_eq!(drain(&mut session), b"STORED\r\n");
        session.receive(&cache, b"get pooh\r\n");
        assert_eq!(drain(&mut session), b"VALUE pooh 0 8\r\nbearbear\r\nEND\r\n");
        cache.domain().exit();
    }

    #[test]
    fn command_split_across_reads() {
        let cache = test_cache();
        let mut session = Session::new();
        session.receive(&cache, b"ver");
        assert_eq!(drain(&mut session), b"");
        session.receive(&cache, b"sion\r\n");
        assert!(drain(&mut session).starts_with(b"VERSION "));
        cache.domain().exit();
    }

    #[test]
    fn quit_closes() {
        let cache = test_cache();
        let mut session = Session::new();
        assert_eq!(session.receive(&cache, b"quit\r\n"), SessionOutcome::Close);
        cache.domain().exit();
    }

    #[test]
    fn empty_lines_are_ignored() {
        let cache = test_cache();
        let mut session = Session::new();
        assert_eq!(session.receive(&cache, b"\r\n\r\n"), SessionOutcome::Continue);
        assert_eq!(drain(&mut session), b"");
        cache.domain().exit();
    }

    #[test]
    fn oversized_command_line_closes() {
        let cache = test_cache();
        let mut session = Session::new();
        let line = vec![b'x'; MAX_COMMAND_LINE + 1];
        assert_eq!(session.receive(&cache, &line), SessionOutcome::Close);
        cache.domain().exit();
    }

    #[test]
    fn bare_lf_is_accepted() {
        let cache = test_cache();
        let mut session = Session::new();
        session.receive(&cache, b"version\n");
        assert!(drain(&mut session).starts_with(b"VERSION "));
        cache.domain().exit();
    }
}
