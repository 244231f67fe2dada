use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{NetError, NetResult};

/// Default number of sub-reactor threads.
pub const DEFAULT_SUB_REACTOR_COUNT: usize = 4;

/// Size of the per-sub-reactor shared read buffer.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Initial capacity handed out for a connection ring buffer.
pub const DEFAULT_RING_CAPACITY: usize = 4 * 1024;

/// Tick resolution of the engine timing wheel.
pub const DEFAULT_WHEEL_TICK: Duration = Duration::from_millis(10);

/// Spoke count of the engine timing wheel.
pub const DEFAULT_WHEEL_SPOKES: usize = 1024;

/// Engine configuration.
///
/// `max_read_buffer_size` / `max_write_buffer_size` bound the per-connection
/// rings; a value of 0 means unbounded. Supplying `tcp_tls_config` switches
/// every accepted connection to TLS termination.
#[derive(Clone)]
pub struct Options {
    /// Addresses to bind and listen on.
    pub addrs: Vec<SocketAddr>,
    /// Number of I/O sub-reactors; connections are assigned by `fd % count`.
    pub sub_reactor_count: usize,
    /// Per-connection inbound ring bound in bytes (0 = unbounded).
    pub max_read_buffer_size: usize,
    /// Per-connection outbound ring bound in bytes (0 = unbounded).
    pub max_write_buffer_size: usize,
    /// Server-side TLS configuration; `None` means plain TCP.
    pub tcp_tls_config: Option<Arc<rustls::ServerConfig>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            addrs: vec!["127.0.0.1:0".parse().expect("static addr")],
            sub_reactor_count: DEFAULT_SUB_REACTOR_COUNT,
            max_read_buffer_size: 0,
            max_write_buffer_size: 0,
            tcp_tls_config: None,
        }
    }
}

impl Options {
    pub(crate) fn validate(&self) -> NetResult<()> {
        if self.addrs.is_empty() {
            return Err(NetError::invalid_config("no listen addresses"));
        }
        if self.sub_reactor_count == 0 {
            return Err(NetError::invalid_config("sub_reactor_count must be >= 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_validate() {
        assert!(Options::default().validate().is_ok());
    }

    #[test]
    fn zero_sub_reactors_rejected() {
        let opts = Options {
            sub_reactor_count: 0,
            ..Options::default()
        };
        assert!(matches!(
            opts.validate(),
            Err(NetError::InvalidConfig(_))
        ));
    }
}
