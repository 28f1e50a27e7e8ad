//! # cf-audit
//!
//! Append-only record of promise outcomes.
//!
//! Every promise the agent actuates produces an [`OutcomeEvent`] appended to
//! a JSONL file. Each line carries the SHA-256 of the line before it, so
//! [`OutcomeLog::verify_chain`] detects any edit after the fact.
//!
//! ## Quick Example
//!
//! ```rust,no_run
//! use cf_audit::{OutcomeEvent, OutcomeLog};
//! use cf_eval::PromiseResult;
//! use uuid::Uuid;
//!
//! let mut log = OutcomeLog::open("/var/cf/outcomes.jsonl").unwrap();
//! let mut event = OutcomeEvent::new(Uuid::new_v4(), "default:main", "files", "/etc/motd", PromiseResult::Noop, 1);
//! log.append(&mut event).unwrap();
//! ```

pub mod error;
pub mod event;
pub mod hasher;
pub mod log;

pub use error::AuditError;
pub use event::OutcomeEvent;
pub use log::OutcomeLog;
