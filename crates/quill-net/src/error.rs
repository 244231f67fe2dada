use std::fmt::Display;
use std::os::fd::RawFd;

/// A specialized error type for reactor operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The connection has been closed.
    #[error("connection closed")]
    Closed,
    /// A peek requested more bytes than are buffered.
    #[error("short peek: requested {requested}, buffered {buffered}")]
    ShortPeek { requested: usize, buffered: usize },
    /// The inbound ring would exceed its configured bound.
    #[error(
        "inbound buffer overflow: fd {fd}, buffered {buffered} + incoming {incoming} exceeds max {max}"
    )]
    InboundOverflow {
        fd: RawFd,
        buffered: usize,
        incoming: usize,
        max: usize,
    },
    /// The outbound ring would exceed its configured bound.
    #[error(
        "outbound buffer overflow: fd {fd}, buffered {buffered} + outgoing {outgoing} exceeds max {max}"
    )]
    OutboundOverflow {
        fd: RawFd,
        buffered: usize,
        outgoing: usize,
        max: usize,
    },
    /// TLS-level failure while decrypting or encrypting.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    /// Configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The operation is not supported by this connection kind.
    #[error("unsupported operation")]
    Unsupported,
}

impl NetError {
    /// Create an invalid configuration error from a displayable value.
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidConfig(msg.to_string())
    }

    /// Whether this error indicates the peer already tore the socket down,
    /// in which case the fd must not be deregistered from the poller.
    pub fn is_conn_reset(&self) -> bool {
        matches!(self, NetError::Io(err) if err.kind() == std::io::ErrorKind::ConnectionReset)
    }
}

/// A Result type alias for reactor operations.
pub type NetResult<T> = Result<T, NetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_reset_detection() {
        let err = NetError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(err.is_conn_reset());
        assert!(!NetError::Closed.is_conn_reset());
    }
}
