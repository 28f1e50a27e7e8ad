//! # cf-serverd
//!
//! File-serving daemon for the cf agent's `copy_from` promises.
//!
//! [`FileServer`] answers `VERSION`, `STAT`, `HASH`, `OPENDIR` and `GET`
//! for paths under the admitted prefixes, on top of the threaded
//! [`cf_net::Server`]. [`build_server`] wires a [`ServerConfig`] into a
//! bound server ready to `serve()`.

pub mod config;
pub mod error;
pub mod handler;

use std::sync::Arc;

use cf_net::{RustlsSecurity, Server};

pub use config::{ServerConfig, DEFAULT_CONFIG_PATH};
pub use error::ServerError;
pub use handler::FileServer;

/// Validate `config`, load the TLS identity, bind the listener.
pub fn build_server(config: &ServerConfig) -> Result<Server, ServerError> {
    config.validate()?;
    let handler = FileServer::new(&config.root, &config.admit)?;

    let mut security = RustlsSecurity::new();
    if let (Some(cert), Some(key)) = (&config.tls_cert, &config.tls_key) {
        security = security.with_identity(cert, key)?;
    }

    let server = Server::bind(
        config.listen_addr(),
        config.server_options(),
        Arc::new(security),
        Arc::new(handler),
    )?;
    tracing::info!(
        addr = %server.local_addr()?,
        root = %config.root.display(),
        allow_classic = config.allow_classic,
        "cf-serverd ready"
    );
    Ok(server)
}
