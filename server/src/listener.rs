//! TCP accept loop and worker reactors.
//!
//! The main thread accepts connections and hands them round-robin to a
//! fixed pool of worker threads through waker-signalled mailboxes.
//! Each worker pumps a mio poll loop, drives its sessions, and
//! checkpoints the reclamation domain between iterations so deferred
//! frees keep flowing even on an idle server.

use crate::config::Config;
use crate::metrics;
use crate::session::{Session, SessionOutcome};
use crate::workers::spawn_workers;
use ember_cache::Cache;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const WAKER_TOKEN: Token = Token(0);

/// Workers poll with this timeout so reclamation checkpoints happen on
/// a bounded schedule even without traffic.
const POLL_TIMEOUT: Duration = Duration::from_millis(500);

struct Mailbox {
    waker: Waker,
    inbox: Mutex<Vec<std::net::TcpStream>>,
}

/// One connection owned by a worker.
struct Connection {
    stream: TcpStream,
    session: Session,
    closing: bool,
}

/// Bind the listener and serve forever.
pub fn serve(config: &Config, cache: Arc<Cache>) -> io::Result<()> {
    let listener = std::net::TcpListener::bind(("0.0.0.0", config.port))?;
    serve_on(listener, config, cache)
}

/// Serve connections accepted from an already-bound listener.
pub fn serve_on(
    listener: std::net::TcpListener,
    config: &Config,
    cache: Arc<Cache>,
) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, threads = config.threads, "listening");

    let active = Arc::new(AtomicUsize::new(0));
    let mut mailboxes = Vec::with_capacity(config.threads);
    let mut polls = Vec::with_capacity(config.threads);
    for _ in 0..config.threads {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        mailboxes.push(Arc::new(Mailbox {
            waker,
            inbox: Mutex::new(Vec::new()),
        }));
        polls.push(poll);
    }
    let mailboxes = Arc::new(mailboxes);

    let _workers = {
        let mailboxes = mailboxes.clone();
        let active = active.clone();
        let mut polls = polls.into_iter();
        let handles: Vec<_> = (0..config.threads)
            .map(|worker_id| {
                let poll = polls.next().expect("one poll per worker");
                let cache = cache.clone();
                let mailbox = mailboxes[worker_id].clone();
                let active = active.clone();
                (worker_id, poll, cache, mailbox, active)
            })
            .collect();
        spawn_workers(config.threads, "ember-worker", {
            let handles = Arc::new(Mutex::new(
                handles
                    .into_iter()
                    .map(|h| (h.0, Some((h.1, h.2, h.3, h.4))))
                    .collect::<HashMap<_, _>>(),
            ));
            move |worker_id| {
                let (poll, cache, mailbox, active) = handles
                    .lock()
                    .get_mut(&worker_id)
                    .and_then(Option::take)
                    .expect("worker context claimed twice");
                worker_loop(poll, cache, mailbox, active);
            }
        })
    };

    let mut next_worker = 0usize;
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(error) => {
                warn!(%error, "accept failed");
                continue;
            }
        };
        if active.load(Ordering::Relaxed) >= config.max_connections {
            metrics::CONNECTIONS_REJECTED.increment();
            drop(stream);
            continue;
        }
        metrics::CONNECTIONS_ACCEPTED.increment();
        if let Err(error) = stream.set_nonblocking(true) {
            warn!(%error, "set_nonblocking failed");
            continue;
        }
        active.fetch_add(1, Ordering::Relaxed);
        metrics::CONNECTIONS_ACTIVE.increment();

        let mailbox = &mailboxes[next_worker];
        next_worker = (next_worker + 1) % mailboxes.len();
        mailbox.inbox.lock().push(stream);
        if let Err(error) = mailbox.waker.wake() {
            warn!(%error, "worker wake failed");
        }
    }
    Ok(())
}

fn worker_loop(mut poll: Poll, cache: Arc<Cache>, mailbox: Arc<Mailbox>, active: Arc<AtomicUsize>) {
    cache.domain().register();

    let mut events = Events::with_capacity(256);
    let mut connections: HashMap<Token, Connection> = HashMap::new();
    let mut next_token = 1usize;

    loop {
        if let Err(error) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            if error.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            warn!(%error, "poll failed");
            break;
        }

        for event in events.iter() {
            match event.token() {
                WAKER_TOKEN => {
                    let streams = std::mem::take(&mut *mailbox.inbox.lock());
                    for stream in streams {
                        let mut stream = TcpStream::from_std(stream);
                        let token = Token(next_token);
                        next_token += 1;
                        if let Err(error) = poll.registry().register(
                            &mut stream,
                            token,
                            Interest::READABLE,
                        ) {
                            warn!(%error, "register failed");
                            active.fetch_sub(1, Ordering::Relaxed);
                            metrics::CONNECTIONS_ACTIVE.decrement();
                            continue;
                        }
                        debug!(?token, "connection assigned");
                        connections.insert(
                            token,
                            Connection {
                                stream,
                                session: Session::new(),
                                closing: false,
                            },
                        );
                    }
                }
                token => {
                    let done = match connections.get_mut(&token) {
                        Some(connection) => drive(connection, &cache, &poll, token),
                        None => false,
                    };
                    if done {
                        if let Some(mut connection) = connections.remove(&token) {
                            let _ = poll.registry().deregister(&mut connection.stream);
                            active.fetch_sub(1, Ordering::Relaxed);
                            metrics::CONNECTIONS_ACTIVE.decrement();
                            debug!(?token, "connection closed");
                        }
                    }
                }
            }
        }

        // announce quiescence once per reactor iteration
        cache.domain().checkpoint();
    }

    cache.domain().exit();
}

/// Pump one connection. Returns true when it should be dropped.
fn drive(connection: &mut Connection, cache: &Cache, poll: &Poll, token: Token) -> bool {
    if !connection.closing {
        let mut chunk = [0u8; 4096];
        loop {
            match connection.stream.read(&mut chunk) {
                Ok(0) => return true, // client EOF
                Ok(n) => {
                    if connection.session.receive(cache, &chunk[..n]) == SessionOutcome::Close {
                        connection.closing = true;
                        break;
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    debug!(%error, "recv error");
                    return true;
                }
            }
        }
    }

    // drain staged output
    let write_buf = connection.session.write_buf();
    while !write_buf.is_empty() {
        match connection.stream.write(write_buf) {
            Ok(0) => return true,
            Ok(n) => bytes::Buf::advance(write_buf, n),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                // come back when the socket is writable
                let _ = poll.registry().reregister(
                    &mut connection.stream,
                    token,
                    Interest::READABLE | Interest::WRITABLE,
                );
                return false;
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => {
                debug!(%error, "send error");
                return true;
            }
        }
    }
    let _ = poll
        .registry()
        .reregister(&mut connection.stream, token, Interest::READABLE);

    connection.closing
}
