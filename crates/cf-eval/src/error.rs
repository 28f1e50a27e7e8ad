// error.rs - Error types for policy loading and evaluation.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while loading or inspecting a policy.
///
/// Promise failures are not errors: they are reported as a
/// [`PromiseResult`](crate::PromiseResult) and evaluation continues.
#[derive(Debug, Error)]
pub enum EvalError {
    /// The policy file could not be read.
    #[error("failed to read policy at {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The policy document is not valid JSON for the policy model.
    #[error("failed to parse policy: {0}")]
    Parse(#[from] serde_json::Error),

    /// The policy is structurally invalid (duplicate bundle, empty name, ...).
    #[error("invalid policy: {reason}")]
    InvalidPolicy { reason: String },

    /// A bundle named in a bundlesequence or method call does not exist.
    #[error("bundle '{name}' is not defined in the policy")]
    UndefinedBundle { name: String },

    /// A class expression could not be parsed.
    #[error("invalid class expression '{expression}': {reason}")]
    ClassExpression { expression: String, reason: String },
}
