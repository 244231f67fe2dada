//! Poll-driven connection reactor for the quill messaging server.
//!
//! The engine accepts TCP (optionally TLS-terminated) connections, assigns
//! each to one of N single-threaded sub-reactors by fd, and streams bytes
//! through per-connection bounded ring buffers. Embedders receive
//! [`EventHandler`] callbacks and frame the inbound ring themselves with
//! `peek`/`discard`; quiescent connections are reaped by a timing wheel.
//!
//! ## Architecture Overview
//!
//! - [`Engine`]: listeners, sub-reactor array, buffer pool, timing wheel
//! - [`SubReactor`]: one poller and one connection matrix per I/O thread
//! - [`Conn`]: a live transport with exclusive inbound/outbound rings
//! - [`TlsConn`]: the same pipeline with a ciphertext staging ring
//!
//! Within one connection, inbound bytes reach `on_data` in wire order and
//! outbound bytes reach the fd in write order. Across connections there is
//! no ordering.

pub mod conn;
pub mod engine;
pub mod error;
pub mod event;
pub mod options;
pub mod ring;
pub mod tls;

mod sub_reactor;
mod timer;

pub use conn::{Conn, ConnStats, ConnValue, TcpConn};
pub use engine::Engine;
pub use error::{NetError, NetResult};
pub use event::{EventHandler, NoopHandler};
pub use options::Options;
pub use ring::RingBuffer;
pub use sub_reactor::SubReactor;
pub use timer::TimerId;
pub use tls::TlsConn;
