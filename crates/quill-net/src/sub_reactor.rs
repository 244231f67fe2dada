//! Single-threaded I/O workers.
//!
//! Each sub-reactor owns a poller, a shared read buffer reused across its
//! connections and a connection matrix keyed by fd. A connection is
//! registered with exactly one sub-reactor for its entire life. The poll
//! loop is the only code that touches the `Poll`; interest changes from
//! other threads go through the cloned `Registry`, which is thread-safe.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::conn::Conn;
use crate::engine::Engine;
use crate::error::{NetError, NetResult};
use crate::options::DEFAULT_READ_BUFFER_SIZE;

/// Token reserved for the cross-thread waker.
const WAKE_TOKEN: Token = Token(usize::MAX - 1);

const POLL_TIMEOUT: Duration = Duration::from_millis(500);

pub struct SubReactor {
    idx: usize,
    engine: Weak<Engine>,
    poll: Mutex<Option<Poll>>,
    registry: Registry,
    waker: Waker,
    conns: Mutex<HashMap<RawFd, Arc<dyn Conn>>>,
    conn_count: AtomicUsize,
    read_buf: Mutex<Vec<u8>>,
    shutdown: AtomicBool,
}

/// The fallible pieces of a sub-reactor, created before the engine's
/// cyclic `Arc` exists.
pub(crate) struct SubParts {
    poll: Poll,
    registry: Registry,
    waker: Waker,
}

impl SubParts {
    pub(crate) fn new() -> NetResult<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok(Self {
            poll,
            registry,
            waker,
        })
    }
}

impl SubReactor {
    pub(crate) fn from_parts(idx: usize, parts: SubParts, engine: Weak<Engine>) -> Self {
        Self {
            idx,
            engine,
            poll: Mutex::new(Some(parts.poll)),
            registry: parts.registry,
            waker: parts.waker,
            conns: Mutex::new(HashMap::new()),
            conn_count: AtomicUsize::new(0),
            read_buf: Mutex::new(vec![0u8; DEFAULT_READ_BUFFER_SIZE]),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn idx(&self) -> usize {
        self.idx
    }

    pub fn conn_count(&self) -> usize {
        self.conn_count.load(Ordering::Acquire)
    }

    pub(crate) fn register_conn(&self, conn: Arc<dyn Conn>) -> NetResult<()> {
        let fd = conn.fd();
        self.registry
            .register(&mut SourceFd(&fd), Token(fd as usize), Interest::READABLE)?;
        self.conns.lock().insert(fd, conn);
        self.conn_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub(crate) fn remove_conn(&self, fd: RawFd) -> Option<Arc<dyn Conn>> {
        let removed = self.conns.lock().remove(&fd);
        if removed.is_some() {
            self.conn_count.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    pub(crate) fn conn(&self, fd: RawFd) -> Option<Arc<dyn Conn>> {
        self.conns.lock().get(&fd).cloned()
    }

    pub(crate) fn add_write_interest(&self, fd: RawFd) -> NetResult<()> {
        self.registry.reregister(
            &mut SourceFd(&fd),
            Token(fd as usize),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        Ok(())
    }

    pub(crate) fn remove_write_interest(&self, fd: RawFd) -> NetResult<()> {
        self.registry
            .reregister(&mut SourceFd(&fd), Token(fd as usize), Interest::READABLE)?;
        Ok(())
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> NetResult<()> {
        self.registry.deregister(&mut SourceFd(&fd))?;
        Ok(())
    }

    pub(crate) fn wake(&self) {
        let _ = self.waker.wake();
    }

    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake();
    }

    /// The poll loop. Runs on a dedicated thread until shutdown.
    pub(crate) fn run(&self) {
        let Some(mut poll) = self.poll.lock().take() else {
            return;
        };
        let mut events = Events::with_capacity(1024);
        while !self.shutdown.load(Ordering::Acquire) {
            if let Err(err) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(sub = self.idx, error = %err, "poll failed, stopping sub-reactor");
                break;
            }
            for event in events.iter() {
                let token = event.token();
                if token == WAKE_TOKEN {
                    continue;
                }
                let fd = token.0 as RawFd;
                let Some(conn) = self.conn(fd) else {
                    continue;
                };
                if event.is_readable() || event.is_read_closed() {
                    self.drain_read(&conn);
                }
                if event.is_writable() && !conn.is_closed() {
                    if let Err(err) = conn.flush() {
                        self.close_conn(&conn, Some(err));
                    }
                }
            }
        }
    }

    /// Read until the fd runs dry (the poller is edge-triggered), handing
    /// each chunk to the data callback as it lands.
    fn drain_read(&self, conn: &Arc<dyn Conn>) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        loop {
            let result = {
                let mut read_buf = self.read_buf.lock();
                conn.read_to_inbound(&mut read_buf)
            };
            match result {
                Ok(0) => return,
                Ok(_) => {
                    // A panicking data callback must not take the whole
                    // sub-reactor down with it.
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        engine.handler().on_data(conn)
                    }));
                    match outcome {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            self.close_conn(conn, Some(err));
                            return;
                        }
                        Err(_) => {
                            error!(sub = self.idx, conn = %conn.describe(), "data callback panicked");
                            self.close_conn(conn, None);
                            return;
                        }
                    }
                }
                Err(err) => {
                    self.close_conn(conn, Some(err));
                    return;
                }
            }
            if conn.is_closed() {
                return;
            }
        }
    }

    pub(crate) fn close_conn(&self, conn: &Arc<dyn Conn>, err: Option<NetError>) {
        if let Some(err) = err.as_ref() {
            match err {
                NetError::Io(io_err) if io_err.kind() == io::ErrorKind::UnexpectedEof => {}
                _ => debug!(sub = self.idx, conn = %conn.describe(), error = %err, "closing connection"),
            }
        }
        let _ = conn.close_with_err(err);
    }

    /// Visit every connection of this sub-reactor; stop when `f` returns
    /// false.
    pub fn iterate_conns(&self, mut f: impl FnMut(&Arc<dyn Conn>) -> bool) {
        let conns: Vec<_> = self.conns.lock().values().cloned().collect();
        for conn in &conns {
            if !f(conn) {
                return;
            }
        }
    }
}
