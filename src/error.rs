//! Error types for the proxy and its bypass transports.

use thiserror::Error;

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while serving or tunneling connections.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or short SOCKS5 message, unsupported version byte
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Username/password sub-negotiation failed
    #[error("authentication failed")]
    AuthFailed,

    /// Source IP exceeded its sliding-window admission budget
    #[error("rate limit exceeded")]
    RateLimited,

    /// Requested destination is not on the allow-list
    #[error("destination not allowed: {0}")]
    DestinationDenied(String),

    /// Upstream dial failed
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// An I/O operation exceeded its deadline
    #[error("timed out after {0}ms")]
    Timeout(u64),

    /// Obfuscated blob could not be decoded or decrypted
    #[error("obfuscation error: {0}")]
    Obfuscation(String),

    /// A bypass transport (HTTP tunnel, WebSocket, fronting) failed
    #[error("tunnel error: {0}")]
    Tunnel(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),
}

impl Error {
    /// Create a new protocol violation error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a new tunnel error
    pub fn tunnel(msg: impl Into<String>) -> Self {
        Error::Tunnel(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new obfuscation error
    pub fn obfuscation(msg: impl Into<String>) -> Self {
        Error::Obfuscation(msg.into())
    }

    /// Whether the session should close without sending any reply bytes.
    pub fn is_silent_close(&self) -> bool {
        matches!(self, Error::Protocol(_) | Error::RateLimited)
    }
}
