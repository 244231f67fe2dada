//! TLS termination layered over [`TcpConn`].
//!
//! Ciphertext read from the fd is staged in an intermediate ring; the
//! decrypt loop feeds it to rustls and appends recovered plaintext to the
//! ordinary inbound ring, so framing code upstack is identical for plain
//! and TLS connections. Handshake records produced by rustls are queued on
//! the outbound ring like any other write.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustls::{ServerConfig, ServerConnection};

use crate::conn::{Conn, ConnStats, ConnValue, TcpConn};
use crate::error::{NetError, NetResult};
use crate::ring::RingBuffer;

/// Server-side TLS connection.
pub struct TlsConn {
    core: TcpConn,
    tls: Mutex<ServerConnection>,
    /// Ciphertext staging ring between the fd and rustls.
    staging: Mutex<RingBuffer>,
}

/// Adapts the staging ring to the `io::Read` rustls pulls records through.
struct RingReader<'a>(&'a mut RingBuffer);

impl io::Read for RingReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.0.read(buf))
    }
}

impl TlsConn {
    pub(crate) fn new(
        core: TcpConn,
        config: Arc<ServerConfig>,
        staging: RingBuffer,
    ) -> NetResult<Self> {
        let tls = ServerConnection::new(config)?;
        Ok(Self {
            core,
            tls: Mutex::new(tls),
            staging: Mutex::new(staging),
        })
    }

    pub(crate) fn bind_self(&self, weak: std::sync::Weak<dyn Conn>) {
        self.core.bind_self(weak);
    }

    /// Queue whatever rustls wants on the wire (handshake records, alerts,
    /// freshly encrypted application data) onto the outbound ring.
    fn flush_tls_output(&self, tls: &mut ServerConnection) -> NetResult<()> {
        while tls.wants_write() {
            let mut out = Vec::new();
            tls.write_tls(&mut out)?;
            if out.is_empty() {
                break;
            }
            self.core.enqueue_outbound(&out)?;
        }
        Ok(())
    }

    /// Decrypt everything currently staged. `not enough data` simply leaves
    /// the partial record in the staging ring for the next readable edge;
    /// any real TLS failure is fatal to the connection.
    fn drain_staging(&self) -> NetResult<()> {
        let mut tls = self.tls.lock();
        loop {
            {
                let mut staging = self.staging.lock();
                if staging.is_empty() {
                    break;
                }
                let mut reader = RingReader(&mut staging);
                if tls.read_tls(&mut reader)? == 0 {
                    break;
                }
            }
            let state = tls.process_new_packets().map_err(NetError::Tls)?;
            let plaintext = state.plaintext_bytes_to_read();
            if plaintext > 0 {
                let mut buf = vec![0u8; plaintext];
                tls.reader().read_exact(&mut buf)?;
                self.core.append_inbound(&buf)?;
            }
            self.flush_tls_output(&mut tls)?;
        }
        Ok(())
    }

    fn release_staging(&self) {
        self.staging.lock().reset();
    }
}

impl Conn for TlsConn {
    fn id(&self) -> i64 {
        self.core.id()
    }

    fn set_id(&self, id: i64) {
        self.core.set_id(id);
    }

    fn uid(&self) -> Option<String> {
        self.core.uid()
    }

    fn set_uid(&self, uid: String) {
        self.core.set_uid(uid);
    }

    fn device_flag(&self) -> u8 {
        self.core.device_flag()
    }

    fn set_device_flag(&self, flag: u8) {
        self.core.set_device_flag(flag);
    }

    fn device_level(&self) -> u8 {
        self.core.device_level()
    }

    fn set_device_level(&self, level: u8) {
        self.core.set_device_level(level);
    }

    fn device_id(&self) -> String {
        self.core.device_id()
    }

    fn set_device_id(&self, device_id: String) {
        self.core.set_device_id(device_id);
    }

    fn is_authed(&self) -> bool {
        self.core.is_authed()
    }

    fn set_authed(&self, authed: bool) {
        self.core.set_authed(authed);
    }

    fn proto_version(&self) -> u32 {
        self.core.proto_version()
    }

    fn set_proto_version(&self, version: u32) {
        self.core.set_proto_version(version);
    }

    fn fd(&self) -> RawFd {
        self.core.fd()
    }

    fn remote_addr(&self) -> SocketAddr {
        self.core.remote_addr()
    }

    fn set_remote_addr(&self, addr: SocketAddr) {
        self.core.set_remote_addr(addr);
    }

    fn local_addr(&self) -> SocketAddr {
        self.core.local_addr()
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    fn read_to_inbound(&self, read_buf: &mut [u8]) -> NetResult<usize> {
        let n = self.core.read_raw(read_buf)?;
        if n == 0 {
            return Ok(0);
        }
        self.staging.lock().write(&read_buf[..n]);
        self.drain_staging()?;
        Ok(n)
    }

    fn read(&self, buf: &mut [u8]) -> NetResult<usize> {
        self.core.read(buf)
    }

    fn peek(&self, n: isize) -> NetResult<Vec<u8>> {
        self.core.peek(n)
    }

    fn discard(&self, n: usize) -> NetResult<usize> {
        self.core.discard(n)
    }

    fn write(&self, buf: &[u8]) -> NetResult<usize> {
        if self.core.is_closed() {
            return Err(NetError::Closed);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let mut tls = self.tls.lock();
        let mut written = 0;
        while written < buf.len() {
            let n = tls.writer().write(&buf[written..])?;
            if n == 0 {
                // rustls buffered as much plaintext as it will hold (the
                // handshake has not freed it yet); push what it wants on
                // the wire and retry once before giving up.
                self.flush_tls_output(&mut tls)?;
                let retry = tls.writer().write(&buf[written..])?;
                if retry == 0 {
                    return Err(NetError::Io(io::ErrorKind::WriteZero.into()));
                }
                written += retry;
                continue;
            }
            written += n;
        }
        self.flush_tls_output(&mut tls)?;
        drop(tls);
        self.core.wake_write()?;
        Ok(buf.len())
    }

    fn write_to_outbound(&self, buf: &[u8]) -> NetResult<usize> {
        self.core.write_to_outbound(buf)
    }

    fn wake_write(&self) -> NetResult<()> {
        self.core.wake_write()
    }

    fn flush(&self) -> NetResult<()> {
        self.core.flush()
    }

    fn close(&self) -> NetResult<()> {
        self.release_staging();
        self.core.close()
    }

    fn close_with_err(&self, err: Option<NetError>) -> NetResult<()> {
        self.release_staging();
        self.core.close_with_err(err)
    }

    fn set_max_idle(&self, max_idle: Duration) {
        self.core.set_max_idle(max_idle);
    }

    fn max_idle(&self) -> Duration {
        self.core.max_idle()
    }

    fn last_activity(&self) -> Instant {
        self.core.last_activity()
    }

    fn uptime(&self) -> Instant {
        self.core.uptime()
    }

    fn set_context(&self, ctx: Option<ConnValue>) {
        self.core.set_context(ctx);
    }

    fn context(&self) -> Option<ConnValue> {
        self.core.context()
    }

    fn set_value(&self, key: String, value: ConnValue) {
        self.core.set_value(key, value);
    }

    fn value(&self, key: &str) -> Option<ConnValue> {
        self.core.value(key)
    }

    fn stats(&self) -> &ConnStats {
        self.core.stats()
    }
}
