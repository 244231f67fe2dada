//! Connection objects driven by the sub-reactors.
//!
//! A [`Conn`] owns its fd and two ring buffers. Inbound bytes are appended
//! by the owning sub-reactor thread; outbound bytes may be queued from any
//! thread and are drained by the sub-reactor on writable edges. `closed` is
//! a write-once atomic: once set, every I/O operation fails with
//! [`NetError::Closed`] and performs no I/O.

use std::any::Any;
use std::collections::HashMap;
use std::io::{self, IoSlice, Read, Write};
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::engine::Engine;
use crate::error::{NetError, NetResult};
use crate::ring::RingBuffer;
use crate::sub_reactor::SubReactor;
use crate::timer::TimerId;

/// Opaque value attachable to a connection by higher layers.
pub type ConnValue = Arc<dyn Any + Send + Sync>;

/// Per-connection traffic counters.
#[derive(Default)]
pub struct ConnStats {
    pub in_msgs: AtomicU64,
    pub out_msgs: AtomicU64,
    pub in_msg_bytes: AtomicU64,
    pub out_msg_bytes: AtomicU64,
    pub in_packets: AtomicU64,
    pub out_packets: AtomicU64,
    pub in_packet_bytes: AtomicU64,
    pub out_packet_bytes: AtomicU64,
}

impl ConnStats {
    pub fn new() -> Self {
        Self::default()
    }
}

/// One live client transport.
///
/// Implemented by [`TcpConn`] and the TLS wrapper; the engine and the
/// dispatch layers only ever see `Arc<dyn Conn>`.
pub trait Conn: Send + Sync {
    fn id(&self) -> i64;
    fn set_id(&self, id: i64);
    fn uid(&self) -> Option<String>;
    fn set_uid(&self, uid: String);
    fn device_flag(&self) -> u8;
    fn set_device_flag(&self, flag: u8);
    fn device_level(&self) -> u8;
    fn set_device_level(&self, level: u8);
    fn device_id(&self) -> String;
    fn set_device_id(&self, device_id: String);
    fn is_authed(&self) -> bool;
    fn set_authed(&self, authed: bool);
    fn proto_version(&self) -> u32;
    fn set_proto_version(&self, version: u32);
    fn fd(&self) -> RawFd;
    fn remote_addr(&self) -> SocketAddr;
    fn set_remote_addr(&self, addr: SocketAddr);
    fn local_addr(&self) -> SocketAddr;
    fn is_closed(&self) -> bool;

    /// Read once from the fd into the sub-reactor's shared buffer and
    /// append to the inbound ring. `Ok(0)` means the fd had no data.
    fn read_to_inbound(&self, read_buf: &mut [u8]) -> NetResult<usize>;
    /// Copy buffered inbound bytes out, consuming them.
    fn read(&self, buf: &mut [u8]) -> NetResult<usize>;
    /// Copy of the next `n` inbound bytes (all buffered bytes if `n <= 0`)
    /// without consuming.
    fn peek(&self, n: isize) -> NetResult<Vec<u8>>;
    /// Advance the inbound read cursor.
    fn discard(&self, n: usize) -> NetResult<usize>;
    /// Queue bytes on the outbound ring and arm writable interest.
    fn write(&self, buf: &[u8]) -> NetResult<usize>;
    /// Thread-safe append to the outbound ring; the caller is responsible
    /// for [`Conn::wake_write`].
    fn write_to_outbound(&self, buf: &[u8]) -> NetResult<usize>;
    /// Arm writable interest so the sub-reactor drains the outbound ring.
    fn wake_write(&self) -> NetResult<()>;
    /// Drain the outbound ring to the fd.
    fn flush(&self) -> NetResult<()>;
    fn close(&self) -> NetResult<()>;
    fn close_with_err(&self, err: Option<NetError>) -> NetResult<()>;

    /// (Re)arm the idle timer; the connection closes once it has seen no
    /// activity for `max_idle`. The timer fires at half that interval.
    fn set_max_idle(&self, max_idle: Duration);
    fn max_idle(&self) -> Duration;
    fn last_activity(&self) -> Instant;
    fn uptime(&self) -> Instant;

    fn set_context(&self, ctx: Option<ConnValue>);
    fn context(&self) -> Option<ConnValue>;
    fn set_value(&self, key: String, value: ConnValue);
    fn value(&self, key: &str) -> Option<ConnValue>;

    fn stats(&self) -> &ConnStats;

    fn set_deadline(&self, _deadline: Instant) -> NetResult<()> {
        Err(NetError::Unsupported)
    }
    fn set_read_deadline(&self, _deadline: Instant) -> NetResult<()> {
        Err(NetError::Unsupported)
    }
    fn set_write_deadline(&self, _deadline: Instant) -> NetResult<()> {
        Err(NetError::Unsupported)
    }

    fn describe(&self) -> String {
        format!(
            "conn[{}] uid={} fd={}",
            self.id(),
            self.uid().unwrap_or_default(),
            self.fd()
        )
    }
}

struct ConnState {
    uid: Option<String>,
    device_flag: u8,
    device_level: u8,
    device_id: String,
    authed: bool,
    proto_version: u32,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    context: Option<ConnValue>,
    value_map: HashMap<String, ConnValue>,
    last_activity: Instant,
    max_idle: Duration,
    idle_timer: Option<TimerId>,
}

/// Plain-TCP connection.
pub struct TcpConn {
    fd: RawFd,
    stream: Mutex<Option<TcpStream>>,
    engine: Weak<Engine>,
    sub: Weak<SubReactor>,
    closed: AtomicBool,
    id: AtomicI64,
    state: RwLock<ConnState>,
    inbound: Mutex<RingBuffer>,
    outbound: Mutex<RingBuffer>,
    uptime: Instant,
    stats: ConnStats,
    self_ref: Mutex<Weak<dyn Conn>>,
}

enum FlushOutcome {
    Wrote(usize),
    Again,
    Fatal(NetError),
}

impl TcpConn {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: i64,
        stream: TcpStream,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        engine: Weak<Engine>,
        sub: Weak<SubReactor>,
        inbound: RingBuffer,
        outbound: RingBuffer,
    ) -> Self {
        let fd = {
            use std::os::fd::AsRawFd;
            stream.as_raw_fd()
        };
        let now = Instant::now();
        Self {
            fd,
            stream: Mutex::new(Some(stream)),
            engine,
            sub,
            closed: AtomicBool::new(false),
            id: AtomicI64::new(id),
            state: RwLock::new(ConnState {
                uid: None,
                device_flag: 0,
                device_level: 0,
                device_id: String::new(),
                authed: false,
                proto_version: 0,
                remote_addr,
                local_addr,
                context: None,
                value_map: HashMap::new(),
                last_activity: now,
                max_idle: Duration::ZERO,
                idle_timer: None,
            }),
            inbound: Mutex::new(inbound),
            outbound: Mutex::new(outbound),
            uptime: now,
            stats: ConnStats::new(),
            self_ref: Mutex::new(Weak::<TcpConn>::new() as Weak<dyn Conn>),
        }
    }

    /// Install the weak self-reference used by timers and callbacks. Called
    /// by the engine right after the connection is wrapped in its `Arc`.
    pub(crate) fn bind_self(&self, weak: Weak<dyn Conn>) {
        *self.self_ref.lock() = weak;
    }

    pub(crate) fn keep_last_activity(&self) {
        self.state.write().last_activity = Instant::now();
    }

    /// Single non-blocking read from the fd into `buf`. `Ok(0)` means the
    /// socket had nothing to deliver; peer EOF surfaces as an error so the
    /// caller closes the connection.
    pub(crate) fn read_raw(&self, buf: &mut [u8]) -> NetResult<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Closed);
        }
        let n = {
            let guard = self.stream.lock();
            let Some(stream) = guard.as_ref() else {
                return Err(NetError::Closed);
            };
            let mut stream = stream;
            match stream.read(buf) {
                Ok(0) => {
                    return Err(NetError::Io(io::ErrorKind::UnexpectedEof.into()));
                }
                Ok(n) => n,
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::Interrupted =>
                {
                    return Ok(0);
                }
                Err(err) => return Err(err.into()),
            }
        };
        if let Some(engine) = self.engine.upgrade() {
            engine.handler().on_read_bytes(n);
        }
        self.keep_last_activity();
        Ok(n)
    }

    pub(crate) fn append_inbound(&self, data: &[u8]) -> NetResult<usize> {
        let max = self
            .engine
            .upgrade()
            .map(|eng| eng.options().max_read_buffer_size)
            .unwrap_or(0);
        let mut inbound = self.inbound.lock();
        if max > 0 && inbound.len() + data.len() > max {
            return Err(NetError::InboundOverflow {
                fd: self.fd,
                buffered: inbound.len(),
                incoming: data.len(),
                max,
            });
        }
        Ok(inbound.write(data))
    }

    pub(crate) fn enqueue_outbound(&self, buf: &[u8]) -> NetResult<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Closed);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let max = self
            .engine
            .upgrade()
            .map(|eng| eng.options().max_write_buffer_size)
            .unwrap_or(0);
        let mut outbound = self.outbound.lock();
        if max > 0 && outbound.len() + buf.len() > max {
            return Err(NetError::OutboundOverflow {
                fd: self.fd,
                buffered: outbound.len(),
                outgoing: buf.len(),
                max,
            });
        }
        Ok(outbound.write(buf))
    }

    fn write_direct(&self, head: &[u8], tail: &[u8]) -> io::Result<usize> {
        let guard = self.stream.lock();
        let Some(stream) = guard.as_ref() else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        let mut stream = stream;
        if tail.is_empty() {
            stream.write(head)
        } else {
            stream.write_vectored(&[IoSlice::new(head), IoSlice::new(tail)])
        }
    }

    fn add_write_if_not_exist(&self) -> NetResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Closed);
        }
        let sub = self.sub.upgrade().ok_or(NetError::Closed)?;
        sub.add_write_interest(self.fd)
    }

    fn remove_write_if_exist(&self) -> NetResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Closed);
        }
        let sub = self.sub.upgrade().ok_or(NetError::Closed)?;
        sub.remove_write_interest(self.fd)
    }

    /// Return pooled resources and clear identity state. The idle timer is
    /// stopped here so a pending fire observes `closed` and no-ops.
    fn release(&self) {
        let engine = self.engine.upgrade();
        {
            let mut state = self.state.write();
            debug!(
                fd = self.fd,
                uid = state.uid.as_deref().unwrap_or(""),
                device_id = %state.device_id,
                "release connection"
            );
            state.max_idle = Duration::ZERO;
            if let Some(timer) = state.idle_timer.take() {
                if let Some(engine) = engine.as_ref() {
                    engine.cancel_schedule(timer);
                }
            }
            state.context = None;
            state.value_map.clear();
        }
        if let Some(engine) = engine {
            let inbound = std::mem::replace(&mut *self.inbound.lock(), RingBuffer::with_capacity(0));
            let outbound =
                std::mem::replace(&mut *self.outbound.lock(), RingBuffer::with_capacity(0));
            engine.recycle_buffer(inbound);
            engine.recycle_buffer(outbound);
        }
    }
}

impl Conn for TcpConn {
    fn id(&self) -> i64 {
        self.id.load(Ordering::Acquire)
    }

    fn set_id(&self, id: i64) {
        self.id.store(id, Ordering::Release);
    }

    fn uid(&self) -> Option<String> {
        self.state.read().uid.clone()
    }

    fn set_uid(&self, uid: String) {
        self.state.write().uid = Some(uid);
    }

    fn device_flag(&self) -> u8 {
        self.state.read().device_flag
    }

    fn set_device_flag(&self, flag: u8) {
        self.state.write().device_flag = flag;
    }

    fn device_level(&self) -> u8 {
        self.state.read().device_level
    }

    fn set_device_level(&self, level: u8) {
        self.state.write().device_level = level;
    }

    fn device_id(&self) -> String {
        self.state.read().device_id.clone()
    }

    fn set_device_id(&self, device_id: String) {
        self.state.write().device_id = device_id;
    }

    fn is_authed(&self) -> bool {
        self.state.read().authed
    }

    fn set_authed(&self, authed: bool) {
        self.state.write().authed = authed;
    }

    fn proto_version(&self) -> u32 {
        self.state.read().proto_version
    }

    fn set_proto_version(&self, version: u32) {
        self.state.write().proto_version = version;
    }

    fn fd(&self) -> RawFd {
        self.fd
    }

    fn remote_addr(&self) -> SocketAddr {
        self.state.read().remote_addr
    }

    fn set_remote_addr(&self, addr: SocketAddr) {
        self.state.write().remote_addr = addr;
    }

    fn local_addr(&self) -> SocketAddr {
        self.state.read().local_addr
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn read_to_inbound(&self, read_buf: &mut [u8]) -> NetResult<usize> {
        let n = self.read_raw(read_buf)?;
        if n == 0 {
            return Ok(0);
        }
        self.append_inbound(&read_buf[..n])?;
        Ok(n)
    }

    fn read(&self, buf: &mut [u8]) -> NetResult<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Closed);
        }
        let mut inbound = self.inbound.lock();
        if inbound.is_empty() {
            return Ok(0);
        }
        Ok(inbound.read(buf))
    }

    fn peek(&self, n: isize) -> NetResult<Vec<u8>> {
        let inbound = self.inbound.lock();
        let buffered = inbound.len();
        if n > buffered as isize {
            return Err(NetError::ShortPeek {
                requested: n as usize,
                buffered,
            });
        }
        let n = if n <= 0 { buffered } else { n as usize };
        if n == 0 {
            return Ok(Vec::new());
        }
        let (head, tail) = inbound.peek(n);
        let mut out = Vec::with_capacity(n);
        out.extend_from_slice(head);
        out.extend_from_slice(tail);
        Ok(out)
    }

    fn discard(&self, n: usize) -> NetResult<usize> {
        Ok(self.inbound.lock().discard(n))
    }

    fn write(&self, buf: &[u8]) -> NetResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = self.enqueue_outbound(buf)?;
        self.add_write_if_not_exist()?;
        Ok(n)
    }

    fn write_to_outbound(&self, buf: &[u8]) -> NetResult<usize> {
        self.enqueue_outbound(buf)
    }

    fn wake_write(&self) -> NetResult<()> {
        self.add_write_if_not_exist()
    }

    fn flush(&self) -> NetResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Closed);
        }
        let outcome = {
            let mut outbound = self.outbound.lock();
            if outbound.is_empty() {
                drop(outbound);
                let _ = self.remove_write_if_exist();
                return Ok(());
            }
            let (head, tail) = outbound.peek(usize::MAX);
            match self.write_direct(head, tail) {
                Ok(n) => {
                    outbound.discard(n);
                    FlushOutcome::Wrote(n)
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => FlushOutcome::Again,
                Err(err) => FlushOutcome::Fatal(err.into()),
            }
        };
        match outcome {
            FlushOutcome::Wrote(n) => {
                if let Some(engine) = self.engine.upgrade() {
                    engine.handler().on_write_bytes(n);
                }
                // All data drained: drop writable interest so the poller
                // does not spin on an always-writable fd.
                if self.outbound.lock().is_empty() {
                    let _ = self.remove_write_if_exist();
                }
                Ok(())
            }
            FlushOutcome::Again => Ok(()),
            FlushOutcome::Fatal(err) => {
                tracing::error!(fd = self.fd, error = %err, "write failed, closing connection");
                self.close_with_err(Some(err))
            }
        }
    }

    fn close(&self) -> NetResult<()> {
        self.close_with_err(None)
    }

    fn close_with_err(&self, err: Option<NetError>) -> NetResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // ECONNRESET means the fd is already gone from the poller.
        let reset = err.as_ref().map(NetError::is_conn_reset).unwrap_or(false);
        if !reset {
            if let Some(sub) = self.sub.upgrade() {
                if let Err(err) = sub.deregister(self.fd) {
                    debug!(fd = self.fd, error = %err, "delete fd from poller failed");
                }
            }
        }
        *self.stream.lock() = None;
        let engine = self.engine.upgrade();
        let registered = engine.as_ref().and_then(|eng| eng.remove_conn(self.fd));
        if let Some(sub) = self.sub.upgrade() {
            sub.remove_conn(self.fd);
        }
        // The close callback runs with no connection locks held; embedders
        // may call back into the connection from it. A panicking callback
        // must not abort the cleanup below.
        if let Some(engine) = engine {
            let conn = registered.or_else(|| self.self_ref.lock().upgrade());
            if let Some(conn) = conn {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    engine.handler().on_close(&conn);
                }));
                if outcome.is_err() {
                    tracing::error!(fd = self.fd, "close callback panicked");
                }
            }
        }
        self.release();
        Ok(())
    }

    fn set_max_idle(&self, max_idle: Duration) {
        if self.closed.load(Ordering::Acquire) {
            debug!(fd = self.fd, "connection is closed, set_max_idle skipped");
            return;
        }
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let mut state = self.state.write();
        state.max_idle = max_idle;
        if let Some(timer) = state.idle_timer.take() {
            engine.cancel_schedule(timer);
        }
        if max_idle.is_zero() {
            return;
        }
        let weak = self.self_ref.lock().clone();
        let timer = engine.schedule(max_idle / 2, move || {
            let Some(conn) = weak.upgrade() else {
                return;
            };
            if conn.is_closed() {
                return;
            }
            let max_idle = conn.max_idle();
            if !max_idle.is_zero() && conn.last_activity().elapsed() >= max_idle {
                debug!(
                    max_idle_ms = max_idle.as_millis() as u64,
                    conn = %conn.describe(),
                    "max idle time exceeded, closing connection"
                );
                let _ = conn.close();
            }
        });
        state.idle_timer = Some(timer);
    }

    fn max_idle(&self) -> Duration {
        self.state.read().max_idle
    }

    fn last_activity(&self) -> Instant {
        self.state.read().last_activity
    }

    fn uptime(&self) -> Instant {
        self.uptime
    }

    fn set_context(&self, ctx: Option<ConnValue>) {
        self.state.write().context = ctx;
    }

    fn context(&self) -> Option<ConnValue> {
        self.state.read().context.clone()
    }

    fn set_value(&self, key: String, value: ConnValue) {
        self.state.write().value_map.insert(key, value);
    }

    fn value(&self, key: &str) -> Option<ConnValue> {
        self.state.read().value_map.get(key).cloned()
    }

    fn stats(&self) -> &ConnStats {
        &self.stats
    }
}
