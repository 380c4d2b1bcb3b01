//! Command execution - bridges protocol commands to cache verbs.
//!
//! Command lines either execute immediately or, for storage commands,
//! yield a [`PendingStore`] describing the data block the session must
//! read before calling [`execute_store`]. Responses are staged into the
//! session's write buffer; `noreply` suppresses result tokens but never
//! value data.

use crate::metrics;
use bytes::BytesMut;
use ember_cache::{Cache, CacheStatus, Rope};
use ember_protocol::{
    encode_stat, encode_stat_str, encode_value_header, parse, Command, Response, StoreVerb,
};
use tracing::debug;

/// What the session should do after a command line.
pub enum LineOutcome {
    /// Keep reading command lines.
    Continue,
    /// The client asked to quit; close the session.
    Quit,
    /// A storage command awaits its data block.
    NeedData(PendingStore),
}

/// A storage command waiting for its data block.
pub struct PendingStore {
    op: StoreOp,
    key: Vec<u8>,
    flags: u32,
    exptime: u32,
    /// Announced payload length, excluding the trailing CRLF.
    pub data_len: usize,
    noreply: bool,
}

enum StoreOp {
    Store(StoreVerb),
    Cas { version: u64 },
}

/// Parse and execute one CRLF-stripped command line.
pub fn execute_line(cache: &Cache, line: &[u8], out: &mut BytesMut) -> LineOutcome {
    let command = match parse(line) {
        Ok(command) => command,
        Err(error) => {
            metrics::PROTOCOL_ERRORS.increment();
            debug!(?error, "bad command line");
            let message = error.to_string();
            Response::ClientError(&message).encode(out);
            return LineOutcome::Continue;
        }
    };

    match command {
        Command::Empty => LineOutcome::Continue,
        Command::Quit => LineOutcome::Quit,
        Command::Get { keys, cas_unique } => {
            get(cache, &keys, cas_unique, out);
            LineOutcome::Continue
        }
        Command::Store {
            verb,
            key,
            flags,
            exptime,
            data_len,
            noreply,
        } => LineOutcome::NeedData(PendingStore {
            op: StoreOp::Store(verb),
            key: key.to_vec(),
            flags,
            exptime,
            data_len,
            noreply,
        }),
        Command::Cas {
            key,
            flags,
            exptime,
            data_len,
            version,
            noreply,
        } => LineOutcome::NeedData(PendingStore {
            op: StoreOp::Cas { version },
            key: key.to_vec(),
            flags,
            exptime,
            data_len,
            noreply,
        }),
        Command::Delete { key, noreply } => {
            metrics::DELETES.increment();
            let status = cache.del(key);
            reply(status, noreply, out);
            LineOutcome::Continue
        }
        Command::IncrDecr {
            incr,
            key,
            delta,
            noreply,
        } => {
            let result = if incr {
                cache.incr(key, delta)
            } else {
                cache.decr(key, delta)
            };
            if !noreply {
                match result {
                    Ok(value) => Response::Number(value).encode(out),
                    Err(status) => status_token(status).encode(out),
                }
            }
            LineOutcome::Continue
        }
        Command::Touch {
            key,
            exptime,
            noreply,
        } => {
            let status = cache.touch(key, exptime);
            if !noreply {
                match status {
                    CacheStatus::Stored => Response::Touched.encode(out),
                    other => status_token(other).encode(out),
                }
            }
            LineOutcome::Continue
        }
        Command::FlushAll { delay, .. } => {
            metrics::FLUSHES.increment();
            cache.flush_all(delay);
            // flush_all sends no reply line
            LineOutcome::Continue
        }
        Command::Stats => {
            stats(cache, out);
            LineOutcome::Continue
        }
        Command::Version => {
            Response::Version(env!("CARGO_PKG_VERSION")).encode(out);
            LineOutcome::Continue
        }
    }
}

/// Execute a storage command whose data block has arrived.
pub fn execute_store(cache: &Cache, pending: &PendingStore, data: Rope, out: &mut BytesMut) {
    metrics::SETS.increment();
    let status = match pending.op {
        StoreOp::Store(StoreVerb::Set) => {
            cache.set(&pending.key, pending.flags, pending.exptime, data)
        }
        StoreOp::Store(StoreVerb::Add) => {
            cache.add(&pending.key, pending.flags, pending.exptime, data)
        }
        StoreOp::Store(StoreVerb::Replace) => {
            cache.replace(&pending.key, pending.flags, pending.exptime, data)
        }
        StoreOp::Store(StoreVerb::Append) => cache.append(&pending.key, data),
        StoreOp::Store(StoreVerb::Prepend) => cache.prepend(&pending.key, data),
        StoreOp::Cas { version } => {
            cache.cas(&pending.key, pending.flags, pending.exptime, version, data)
        }
    };
    if status != CacheStatus::Stored {
        metrics::STORE_ERRORS.increment();
    }
    reply(status, pending.noreply, out);
}

fn reply(status: CacheStatus, noreply: bool, out: &mut BytesMut) {
    if !noreply {
        status_token(status).encode(out);
    }
}

fn status_token(status: CacheStatus) -> Response<'static> {
    match status {
        CacheStatus::Stored => Response::Stored,
        CacheStatus::Deleted => Response::Deleted,
        CacheStatus::NotFound => Response::NotFound,
        CacheStatus::SetError => Response::NotStored,
        CacheStatus::CasExists => Response::Exists,
    }
}

fn get(cache: &Cache, keys: &[&[u8]], cas_unique: bool, out: &mut BytesMut) {
    for key in keys {
        metrics::GETS.increment();
        let Some(entry) = cache.get(key) else {
            // a miss aborts the remaining keys without an END
            Response::NotFound.encode(out);
            return;
        };
        let mut data = entry.read();
        let size = data.size();
        let version = cas_unique.then(|| data.hash(entry.flags() as u64));
        encode_value_header(out, key, entry.flags(), size, version);
        out.reserve(size + 2);
        while let Some(part) = data.pop() {
            out.extend_from_slice(part);
        }
        out.extend_from_slice(b"\r\n");
    }
    Response::End.encode(out);
}

fn stats(cache: &Cache, out: &mut BytesMut) {
    encode_stat_str(out, "version", env!("CARGO_PKG_VERSION"));
    encode_stat(out, "pointer_size", std::mem::size_of::<usize>() as u64 * 8);
    encode_stat(out, "cmd_get", cache.get_count() as u64);
    encode_stat(out, "cmd_set", cache.set_count() as u64);
    encode_stat(out, "cmd_flush", cache.flush_count() as u64);
    encode_stat(out, "cmd_touch", cache.touch_count() as u64);
    encode_stat(out, "get_hits", cache.get_hit_count() as u64);
    encode_stat(out, "get_misses", cache.get_miss_count() as u64);
    encode_stat(out, "bytes", cache.bytes() as u64);
    encode_stat(out, "buckets", cache.buckets() as u64);
    encode_stat(out, "keys", cache.keys() as u64);
    Response::End.encode(out);
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

    fn run(cache: &Cache, line: &[u8]) -> (Vec<u8>, LineOutcome) {
        let mut out = BytesMut::new();
        let outcome = execute_line(cache, line, &mut out);
        (out.to_vec(), outcome)
    }

    fn store(cache: &Cache, line: &[u8], data: &[u8]) -> Vec<u8> {
        let (empty, outcome) = run(cache, line);
        assert!(empty.is_empty());
        let LineOutcome::NeedData(pending) = outcome else {
            panic!("expected a pending store");
        };
        assert_eq!(pending.data_len, data.len());
        let mut out = BytesMut::new();
        execute_store(cache, &pending, Rope::from_bytes(data), &mut out);
        out.to_vec()
    }

    #[test]
    fn set_and_get_round_trip() {
        let cache = test_cache();
        assert_eq!(store(&cache, b"set pooh 0 0 4", b"bear"), b"STORED\r\n");
        let (out, _) = run(&cache, b"get pooh");
        assert_eq!(out, b"VALUE pooh 0 4\r\nbear\r\nEND\r\n");
        cache.domain().exit();
    }

    #[test]
    fn add_on_existing_key() {
        let cache = test_cache();
        assert_eq!(store(&cache, b"add pooh 0 0 4", b"bear"), b"STORED\r\n");
        assert_eq!(store(&cache, b"add pooh 0 0 4", b"b33r"), b"NOT_STORED\r\n");
        let (out, _) = run(&cache, b"get pooh");
        assert_eq!(out, b"VALUE pooh 0 4\r\nbear\r\nEND\r\n");
        cache.domain().exit();
    }

    #[test]
    fn get_miss_aborts_key_list() {
        let cache = test_cache();
        assert_eq!(store(&cache, b"set tigger 0 0 3", b"too"), b"STORED\r\n");
        let (out, _) = run(&cache, b"get piglet");
        assert_eq!(out, b"NOT_FOUND\r\n");
        let (out, _) = run(&cache, b"get tigger");
        assert_eq!(out, b"VALUE tigger 0 3\r\ntoo\r\nEND\r\n");
        cache.domain().exit();
    }

    #[test]
    fn incr_decr_results() {
        let cache = test_cache();
        assert_eq!(store(&cache, b"set a 0 0 4", b"1001"), b"STORED\r\n");
        assert_eq!(run(&cache, b"incr a 1").0, b"1002\r\n");
        assert_eq!(run(&cache, b"incr a 1").0, b"1003\r\n");
        assert_eq!(run(&cache, b"decr b 1").0, b"NOT_FOUND\r\n");
        assert_eq!(store(&cache, b"set b 0 0 1", b"0"), b"STORED\r\n");
        assert_eq!(run(&cache, b"incr b 1000").0, b"1000\r\n");
        cache.domain().exit();
    }

    #[test]
    fn cas_flow() {
        let cache = test_cache();
        assert_eq!(store(&cache, b"set x 0 0 4", b"abcd"), b"STORED\r\n");

        let (out, _) = run(&cache, b"gets x");
        let text = String::from_utf8(out).unwrap();
        // VALUE x <flags> <size> <version>
        let version: u64 = text
            .lines()
            .next()
            .unwrap()
            .split(' ')
            .nth(4)
            .unwrap()
            .parse()
            .unwrap();

        let line = format!("cas x 0 0 4 {}", version);
        assert_eq!(store(&cache, line.as_bytes(), b"wxyz"), b"STORED\r\n");
        // the replaced value invalidates the old token
        assert_eq!(store(&cache, line.as_bytes(), b"nope"), b"EXISTS\r\n");
        cache.domain().exit();
    }

    #[test]
    fn delete_and_touch() {
        let cache = test_cache();
        assert_eq!(store(&cache, b"set pooh 0 0 4", b"bear"), b"STORED\r\n");
        assert_eq!(run(&cache, b"touch pooh 0").0, b"TOUCHED\r\n");
        assert_eq!(run(&cache, b"touch absent 0").0, b"NOT_FOUND\r\n");
        assert_eq!(run(&cache, b"delete pooh").0, b"DELETED\r\n");
        assert_eq!(run(&cache, b"delete pooh").0, b"NOT_FOUND\r\n");
        cache.domain().exit();
    }

    #[test]
    fn noreply_suppresses_tokens() {
        let cache = test_cache();
        assert_eq!(store(&cache, b"set pooh 0 0 4 noreply", b"bear"), b"");
        assert_eq!(run(&cache, b"delete pooh noreply").0, b"");
        assert_eq!(run(&cache, b"delete pooh").0, b"NOT_FOUND\r\n");
        cache.domain().exit();
    }

    #[test]
    fn version_stats_and_errors() {
        let cache = test_cache();
        let (out, _) = run(&cache, b"version");
        assert!(out.starts_with(b"VERSION "));

        let (out, _) = run(&cache, b"stats");
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("STAT cmd_get 0"));
        assert!(text.contains("STAT keys 0"));
        assert!(text.ends_with("END\r\n"));

        let (out, _) = run(&cache, b"frobnicate");
        assert!(out.starts_with(b"CLIENT_ERROR "));

        assert!(matches!(run(&cache, b"quit").1, LineOutcome::Quit));
        cache.domain().exit();
    }

    #[test]
    fn flush_all_sends_nothing() {
        let cache = test_cache();
        let (out, _) = run(&cache, b"flush_all");
        assert_eq!(out, b"");
        assert_eq!(cache.flush_count(), 1);
        cache.domain().exit();
    }
}
