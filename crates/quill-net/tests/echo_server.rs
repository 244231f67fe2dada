use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use quill_net::{Conn, Engine, EventHandler, NetError, NetResult, Options};

struct EchoHandler {
    closes: Arc<AtomicUsize>,
    idle: Option<Duration>,
    last_conn: Arc<Mutex<Option<Arc<dyn Conn>>>>,
}

impl EchoHandler {
    fn new(idle: Option<Duration>) -> Self {
        Self {
            closes: Arc::new(AtomicUsize::new(0)),
            idle,
            last_conn: Arc::new(Mutex::new(None)),
        }
    }
}

impl EventHandler for EchoHandler {
    fn on_connect(&self, conn: &Arc<dyn Conn>) {
        *self.last_conn.lock() = Some(conn.clone());
        if let Some(idle) = self.idle {
            conn.set_max_idle(idle);
        }
    }

    fn on_data(&self, conn: &Arc<dyn Conn>) -> NetResult<()> {
        let data = conn.peek(0)?;
        if data.is_empty() {
            return Ok(());
        }
        conn.discard(data.len())?;
        conn.write(&data)?;
        Ok(())
    }

    fn on_close(&self, _conn: &Arc<dyn Conn>) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn start_engine(handler: EchoHandler, options: Options) -> (Arc<Engine>, std::net::SocketAddr) {
    let engine = Engine::new(options, handler).expect("engine setup");
    engine.start().expect("engine start");
    let addr = engine.local_addrs()[0];
    (engine, addr)
}

fn read_exact_with_deadline(stream: &mut TcpStream, buf: &mut [u8]) {
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("set timeout");
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).expect("read echo");
        assert!(n > 0, "connection closed before echo completed");
        filled += n;
    }
}

#[test]
fn echoes_bytes_in_order() {
    let (engine, addr) = start_engine(EchoHandler::new(None), Options::default());

    let mut client = TcpStream::connect(addr).expect("connect");
    let payload: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
    client.write_all(&payload).expect("send");

    let mut echoed = vec![0u8; payload.len()];
    read_exact_with_deadline(&mut client, &mut echoed);
    assert_eq!(echoed, payload);

    engine.stop();
}

#[test]
fn multiple_writes_arrive_concatenated_in_write_order() {
    let (engine, addr) = start_engine(EchoHandler::new(None), Options::default());

    let mut client = TcpStream::connect(addr).expect("connect");
    for chunk in [&b"alpha"[..], &b"beta"[..], &b"gamma"[..]] {
        client.write_all(chunk).expect("send chunk");
    }

    let mut echoed = vec![0u8; 14];
    read_exact_with_deadline(&mut client, &mut echoed);
    assert_eq!(&echoed, b"alphabetagamma");

    engine.stop();
}

#[test]
fn idle_connection_is_reaped() {
    let handler = EchoHandler::new(Some(Duration::from_millis(100)));
    let closes = handler.closes.clone();
    let last_conn = handler.last_conn.clone();
    let (engine, addr) = start_engine(handler, Options::default());

    let mut client = TcpStream::connect(addr).expect("connect");
    // Wait for the connection to register.
    let deadline = Instant::now() + Duration::from_secs(5);
    while engine.conn_count() == 0 {
        assert!(Instant::now() < deadline, "connection never registered");
        std::thread::sleep(Duration::from_millis(5));
    }

    // No traffic: the idle reaper must close the connection and the client
    // must observe EOF.
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("set timeout");
    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).expect("read EOF");
    assert_eq!(n, 0, "expected EOF after idle close");
    let deadline = Instant::now() + Duration::from_secs(5);
    while engine.conn_count() != 0 {
        assert!(Instant::now() < deadline, "connection never removed");
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(closes.load(Ordering::SeqCst), 1, "on_close fires exactly once");

    // A closed connection rejects all further I/O.
    let conn = last_conn.lock().take().expect("connection captured");
    assert!(conn.is_closed());
    assert!(matches!(conn.write(b"late"), Err(NetError::Closed)));
    assert!(matches!(conn.flush(), Err(NetError::Closed)));
    let mut buf = [0u8; 4];
    assert!(matches!(conn.read(&mut buf), Err(NetError::Closed)));

    engine.stop();
}

#[test]
fn inbound_overflow_closes_the_connection() {
    let options = Options {
        max_read_buffer_size: 64,
        ..Options::default()
    };
    // A handler that never consumes, so the inbound ring only fills.
    struct SilentHandler;
    impl EventHandler for SilentHandler {}

    let engine = Engine::new(options, SilentHandler).expect("engine setup");
    engine.start().expect("engine start");
    let addr = engine.local_addrs()[0];

    let mut client = TcpStream::connect(addr).expect("connect");
    client.write_all(&[7u8; 1024]).expect("send oversized");

    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("set timeout");
    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).expect("read EOF");
    assert_eq!(n, 0, "expected EOF after overflow close");

    engine.stop();
}
