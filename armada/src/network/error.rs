//! Network error types.

use thiserror::Error;

/// Errors raised by the transport layer.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Failed to bind a listen address.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: std::net::SocketAddr,
        source: std::io::Error,
    },

    /// Failed to connect to a peer.
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: std::net::SocketAddr,
        source: std::io::Error,
    },

    /// The channel is closed; the packet was dropped.
    #[error("channel to {0} is closed")]
    ChannelClosed(std::net::SocketAddr),

    /// The peer rejected the authorization handshake.
    #[error("authorization rejected by {0}")]
    AuthRejected(std::net::SocketAddr),

    /// A frame exceeded the configured maximum size.
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    /// Malformed frame or field content.
    #[error("wire decode error: {0}")]
    Decode(String),

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
