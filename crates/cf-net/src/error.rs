// error.rs - Error types for the peer protocol.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while connecting to, talking to, or serving peers.
#[derive(Debug, Error)]
pub enum NetError {
    /// Host name or port did not resolve to any address.
    #[error("could not resolve {server}:{port}")]
    Resolve { server: String, port: String },

    /// TCP connect failed (or timed out) for every resolved address.
    #[error("failed to connect to {server}:{port}: {source}")]
    Connect {
        server: String,
        port: String,
        source: std::io::Error,
    },

    /// Read or write on an established transport failed.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection mid-exchange.
    #[error("peer closed the connection")]
    PeerClosed,

    /// A transaction header could not be parsed.
    #[error("malformed transaction header {header:?}")]
    BadHeader { header: String },

    /// A transaction body exceeds the in-band limit.
    #[error("transaction body of {len} bytes exceeds the {max} byte limit")]
    BodyTooLarge { len: usize, max: usize },

    /// An earlier connection attempt to this server failed in this run.
    #[error("server {server} is marked offline")]
    ServerOffline { server: String },

    /// A reply did not have the shape its request calls for.
    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    /// The identification dialog failed.
    #[error("handshake failed: {reason}")]
    Handshake { reason: String },

    /// The peer rejected us with a `BAD` reply.
    #[error("peer rejected the request: {reply}")]
    Rejected { reply: String },

    /// TLS could not be set up or failed mid-session.
    #[error("TLS error: {0}")]
    Tls(String),

    /// A certificate or key file could not be loaded.
    #[error("failed to load TLS material from {path}: {reason}")]
    TlsMaterial { path: PathBuf, reason: String },

    /// A mutex protecting shared state was poisoned by a panicking thread.
    #[error("lock poisoned: {0}")]
    Lock(String),
}

impl NetError {
    /// Whether the connection this error came from can no longer be used.
    ///
    /// A `BAD` reply to a single request leaves the session intact; anything
    /// that broke framing or the socket does not.
    pub fn is_transport(&self) -> bool {
        !matches!(
            self,
            NetError::Rejected { .. } | NetError::Resolve { .. } | NetError::TlsMaterial { .. }
        )
    }
}

impl From<rustls::Error> for NetError {
    fn from(e: rustls::Error) -> Self {
        NetError::Tls(e.to_string())
    }
}
