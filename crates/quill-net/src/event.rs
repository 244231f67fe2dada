//! Engine → embedder callbacks.

use std::sync::Arc;

use crate::conn::Conn;
use crate::engine::Engine;
use crate::error::NetResult;
use crate::ring::RingBuffer;

/// The callback set the engine drives. All methods have no-op defaults so
/// embedders implement only what they need. `on_data` runs on the
/// sub-reactor thread and must not block; hand slow work off to a worker.
pub trait EventHandler: Send + Sync {
    /// A connection was accepted and registered.
    fn on_connect(&self, _conn: &Arc<dyn Conn>) {}

    /// Bytes arrived on the inbound ring. Frame with `peek`/`discard`;
    /// partial frames stay buffered. Returning an error closes the
    /// connection.
    fn on_data(&self, _conn: &Arc<dyn Conn>) -> NetResult<()> {
        Ok(())
    }

    /// The connection is closed and removed; invoked exactly once.
    fn on_close(&self, _conn: &Arc<dyn Conn>) {}

    /// Raw byte count metering for reads.
    fn on_read_bytes(&self, _n: usize) {}

    /// Raw byte count metering for writes.
    fn on_write_bytes(&self, _n: usize) {}

    /// Supply the inbound ring for a new connection. The default takes a
    /// pooled buffer; override to pick capacity or allocator.
    fn on_new_inbound_buffer(&self, engine: &Engine) -> RingBuffer {
        engine.take_buffer()
    }

    /// Supply the outbound ring for a new connection.
    fn on_new_outbound_buffer(&self, engine: &Engine) -> RingBuffer {
        engine.take_buffer()
    }
}

/// Handler with every default left in place; useful for tests and for
/// engines that only relay through the dispatch layer.
pub struct NoopHandler;

impl EventHandler for NoopHandler {}
