// error.rs - Error types for the file server.

use std::path::PathBuf;
use thiserror::Error;

use cf_net::NetError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to read config {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    ParseConfig {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid config value for {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    /// The served root or an admitted prefix does not resolve.
    #[error("cannot serve {path}: {source}")]
    BadRoot {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Net(#[from] NetError),
}
