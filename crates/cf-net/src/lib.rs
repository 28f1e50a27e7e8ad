//! # cf-net
//!
//! Peer protocol between the agent and file servers.
//!
//! A client asks a [`Connector`] (or, more usually, a [`ConnCache`]) for an
//! [`AgentConnection`] to `server:port` with a set of [`ConnectionFlags`].
//! Opening a connection negotiates a [`ProtocolVersion`], wraps the socket in
//! TLS when that version needs it, and runs the identification dialog. After
//! that, both sides exchange framed transactions: an 8 byte header holding a
//! status letter and body length, then up to [`MAX_BODY`] bytes.
//!
//! The server half lives in [`server`]: a threaded listener that detects TLS
//! by its first byte and hands each request to a [`RequestHandler`].
//!
//! ## Quick Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cf_net::{ConnCache, ConnectionFlags, Connector, ProtocolVersion, RustlsSecurity};
//!
//! let cache = Arc::new(ConnCache::new());
//! let connector = Connector::new(Arc::new(RustlsSecurity::new()));
//! let flags = ConnectionFlags::new(ProtocolVersion::CLASSIC);
//! let mut lease = cache.acquire("policy-hub", "5308", flags, &connector).unwrap();
//! let version = lease.with(|conn| conn.server_version()).unwrap();
//! println!("server runs {}", version);
//! ```

pub mod client;
pub mod conn_cache;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod protocol;
pub mod security;
pub mod server;
pub mod transaction;
pub mod wait;

pub use client::{Connect, Connector, FileKind, RemoteStat, DEFAULT_PORT};
pub use conn_cache::{ConnCache, ConnCacheStatus, ConnectionLease, SharedConnection};
pub use connection::{AgentConnection, ConnectionFlags};
pub use error::NetError;
pub use handshake::PeerIdentity;
pub use protocol::{parse_from_config, parse_from_wire, ProtocolVersion};
pub use security::{RustlsSecurity, SecurityProvider, Transport};
pub use server::{RequestHandler, Server, ServerOptions, Session, ShutdownHandle};
pub use transaction::{Transaction, TransactionStatus, MAX_BODY, TERMINATOR};
pub use wait::wait_for_incoming;
