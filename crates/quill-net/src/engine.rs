//! Process-wide reactor engine.
//!
//! The engine owns the listeners, the sub-reactors, the buffer pool and
//! the timing wheel. Connections hold weak back-references to the engine
//! and their sub-reactor; release is explicit through the close path, not
//! through reclamation.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::conn::{Conn, TcpConn};
use crate::error::NetResult;
use crate::event::EventHandler;
use crate::options::{Options, DEFAULT_RING_CAPACITY, DEFAULT_WHEEL_SPOKES, DEFAULT_WHEEL_TICK};
use crate::ring::RingBuffer;
use crate::sub_reactor::{SubParts, SubReactor};
use crate::timer::{TimerId, TimingWheel};
use crate::tls::TlsConn;

const ACCEPT_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Cap on idle ring buffers retained for reuse.
const POOL_MAX: usize = 256;

struct BufferPool {
    bufs: Mutex<Vec<RingBuffer>>,
}

impl BufferPool {
    fn new() -> Self {
        Self {
            bufs: Mutex::new(Vec::new()),
        }
    }

    fn take(&self) -> RingBuffer {
        self.bufs
            .lock()
            .pop()
            .unwrap_or_else(|| RingBuffer::with_capacity(DEFAULT_RING_CAPACITY))
    }

    fn put(&self, mut buf: RingBuffer) {
        buf.reset();
        let mut bufs = self.bufs.lock();
        if bufs.len() < POOL_MAX {
            bufs.push(buf);
        }
    }
}

pub struct Engine {
    options: Options,
    handler: Box<dyn EventHandler>,
    subs: Vec<Arc<SubReactor>>,
    conns: DashMap<RawFd, Arc<dyn Conn>>,
    conn_id_seq: AtomicI64,
    wheel: Mutex<TimingWheel>,
    pool: BufferPool,
    started: AtomicBool,
    shutdown: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
    local_addrs: Mutex<Vec<SocketAddr>>,
}

impl Engine {
    pub fn new(options: Options, handler: impl EventHandler + 'static) -> NetResult<Arc<Engine>> {
        options.validate()?;
        let mut parts = Vec::with_capacity(options.sub_reactor_count);
        for _ in 0..options.sub_reactor_count {
            parts.push(SubParts::new()?);
        }
        let engine = Arc::new_cyclic(|weak| Engine {
            options,
            handler: Box::new(handler),
            subs: parts
                .into_iter()
                .enumerate()
                .map(|(idx, p)| Arc::new(SubReactor::from_parts(idx, p, weak.clone())))
                .collect(),
            conns: DashMap::new(),
            conn_id_seq: AtomicI64::new(0),
            wheel: Mutex::new(TimingWheel::new(DEFAULT_WHEEL_TICK, DEFAULT_WHEEL_SPOKES)),
            pool: BufferPool::new(),
            started: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
            local_addrs: Mutex::new(Vec::new()),
        });
        Ok(engine)
    }

    /// Bind the listeners and spawn the acceptor, sub-reactor and timer
    /// threads. Idempotent.
    pub fn start(self: &Arc<Self>) -> NetResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut listeners = Vec::with_capacity(self.options.addrs.len());
        {
            let mut local_addrs = self.local_addrs.lock();
            for addr in &self.options.addrs {
                let listener = bind_listener(*addr)?;
                local_addrs.push(listener.local_addr()?);
                listeners.push(listener);
            }
        }

        let mut threads = self.threads.lock();
        for sub in &self.subs {
            let sub = sub.clone();
            threads.push(
                std::thread::Builder::new()
                    .name(format!("quill-sub-{}", sub.idx()))
                    .spawn(move || sub.run())?,
            );
        }
        let engine = self.clone();
        threads.push(
            std::thread::Builder::new()
                .name("quill-timer".into())
                .spawn(move || engine.timer_loop())?,
        );
        let engine = self.clone();
        threads.push(
            std::thread::Builder::new()
                .name("quill-acceptor".into())
                .spawn(move || engine.accept_loop(listeners))?,
        );
        Ok(())
    }

    /// Close every live connection and stop all engine threads. Idempotent.
    pub fn stop(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let conns: Vec<Arc<dyn Conn>> = self
            .conns
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for conn in conns {
            let _ = conn.close();
        }
        for sub in &self.subs {
            sub.shutdown();
        }
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            let _ = handle.join();
        }
    }

    /// Addresses actually bound (resolves port 0).
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.local_addrs.lock().clone()
    }

    pub fn conn_count(&self) -> usize {
        self.conns.len()
    }

    pub fn conn_by_fd(&self, fd: RawFd) -> Option<Arc<dyn Conn>> {
        self.conns.get(&fd).map(|entry| entry.value().clone())
    }

    /// Visit every live connection; stop when `f` returns false.
    pub fn iterate_conns(&self, mut f: impl FnMut(&Arc<dyn Conn>) -> bool) {
        let conns: Vec<Arc<dyn Conn>> = self
            .conns
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for conn in &conns {
            if !f(conn) {
                return;
            }
        }
    }

    /// Run `f` every `interval` on the timing wheel until cancelled.
    pub fn schedule(&self, interval: Duration, f: impl FnMut() + Send + 'static) -> TimerId {
        self.wheel
            .lock()
            .schedule(interval, Some(interval), Box::new(f))
    }

    pub fn cancel_schedule(&self, id: TimerId) {
        self.wheel.lock().cancel(id);
    }

    /// Number of armed timers (idle reapers plus embedder schedules).
    pub fn timer_count(&self) -> usize {
        self.wheel.lock().timer_count()
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub(crate) fn handler(&self) -> &dyn EventHandler {
        self.handler.as_ref()
    }

    pub fn take_buffer(&self) -> RingBuffer {
        self.pool.take()
    }

    pub(crate) fn recycle_buffer(&self, buf: RingBuffer) {
        self.pool.put(buf);
    }

    pub(crate) fn remove_conn(&self, fd: RawFd) -> Option<Arc<dyn Conn>> {
        self.conns.remove(&fd).map(|(_, conn)| conn)
    }

    fn next_conn_id(&self) -> i64 {
        self.conn_id_seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn timer_loop(self: Arc<Self>) {
        let tick = self.wheel.lock().tick_duration();
        while !self.shutdown.load(Ordering::Acquire) {
            let due = self.wheel.lock().collect_expired(Instant::now());
            for mut entry in due {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    (entry.callback)()
                }));
                if outcome.is_err() {
                    // A panicking timer is dropped rather than re-armed.
                    error!("timer callback panicked");
                    continue;
                }
                self.wheel.lock().reschedule(entry);
            }
            std::thread::sleep(tick);
        }
    }

    fn accept_loop(self: Arc<Self>, mut listeners: Vec<TcpListener>) {
        let mut poll = match Poll::new() {
            Ok(poll) => poll,
            Err(err) => {
                error!(error = %err, "acceptor poll setup failed");
                return;
            }
        };
        for (i, listener) in listeners.iter_mut().enumerate() {
            if let Err(err) = poll
                .registry()
                .register(listener, Token(i), Interest::READABLE)
            {
                error!(error = %err, "listener registration failed");
                return;
            }
        }
        let mut events = Events::with_capacity(64);
        while !self.shutdown.load(Ordering::Acquire) {
            if let Err(err) = poll.poll(&mut events, Some(ACCEPT_POLL_TIMEOUT)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %err, "acceptor poll failed");
                return;
            }
            for event in events.iter() {
                let listener = &listeners[event.token().0];
                loop {
                    match listener.accept() {
                        Ok((stream, remote)) => {
                            if let Err(err) = self.handle_accept(stream, remote) {
                                warn!(remote = %remote, error = %err, "accepted connection setup failed");
                            }
                        }
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                            break;
                        }
                    }
                }
            }
        }
    }

    fn handle_accept(
        self: &Arc<Self>,
        stream: mio::net::TcpStream,
        remote: SocketAddr,
    ) -> NetResult<()> {
        let fd = stream.as_raw_fd();
        let local = stream.local_addr()?;
        let id = self.next_conn_id();
        let sub = &self.subs[fd as usize % self.subs.len()];

        let inbound = self.handler.on_new_inbound_buffer(self);
        let outbound = self.handler.on_new_outbound_buffer(self);
        let core = TcpConn::new(
            id,
            stream,
            local,
            remote,
            Arc::downgrade(self),
            Arc::downgrade(sub),
            inbound,
            outbound,
        );

        let conn: Arc<dyn Conn> = match &self.options.tcp_tls_config {
            Some(config) => {
                let staging = self.take_buffer();
                let tls = Arc::new(TlsConn::new(core, config.clone(), staging)?);
                tls.bind_self(Arc::downgrade(&(tls.clone() as Arc<dyn Conn>)));
                tls
            }
            None => {
                let tcp = Arc::new(core);
                tcp.bind_self(Arc::downgrade(&(tcp.clone() as Arc<dyn Conn>)));
                tcp
            }
        };

        sub.register_conn(conn.clone())?;
        self.conns.insert(fd, conn.clone());
        debug!(fd, id, remote = %remote, sub = sub.idx(), "connection accepted");
        self.handler.on_connect(&conn);
        Ok(())
    }
}

fn bind_listener(addr: SocketAddr) -> NetResult<TcpListener> {
    let domain = if addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(
        domain,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into()))
}
