// error.rs - Error types for the agent driver and its configuration.

use std::path::PathBuf;
use thiserror::Error;

use cf_audit::AuditError;
use cf_eval::EvalError;
use cf_net::NetError;

#[derive(Debug, Error)]
pub enum AgentError {
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

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    /// Nothing to run: neither the config nor the policy names any bundle.
    #[error("empty bundlesequence")]
    EmptySequence,
}
