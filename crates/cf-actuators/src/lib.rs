//! # cf-actuators
//!
//! Promise-type actuators and the agent run driver.
//!
//! The evaluator in `cf-eval` walks bundles; this crate decides what each
//! promise does to the host. [`AgentActuator`] dispatches every promise to
//! the [`PromiseActuator`] registered for its promise type, handles
//! `methods` by re-entering the evaluator, tallies compliance and appends
//! each outcome to the audit log. [`Agent`] runs a whole bundlesequence for
//! the configured number of passes.
//!
//! Built-in promise types: `vars`, `classes`, `files`, `commands`,
//! `reports` and `methods`.
//!
//! ## Quick Example
//!
//! ```rust,no_run
//! use cf_actuators::{Agent, AgentConfig};
//! use cf_eval::Policy;
//! use std::path::Path;
//!
//! let config = AgentConfig::load_or_default(Path::new(".cf/agent.toml")).unwrap();
//! let policy = Policy::from_json_file("promises.json").unwrap();
//! let summary = Agent::new(config).unwrap().run(&policy).unwrap();
//! println!("{:.1}% compliant", summary.percent_compliant());
//! ```
//!
//! The agent only runs on Unix hosts: file modes and command termination
//! use POSIX calls.

pub mod agent;
pub mod classes;
pub mod commands;
pub mod compliance;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod files;
pub mod reports;
pub mod timeout;
pub mod vars;

pub use agent::{Agent, BundleSummary, RunSummary};
pub use compliance::{BundleCompliance, ComplianceCounts};
pub use config::{AgentConfig, DEFAULT_CONFIG_PATH};
pub use dispatch::{promise_type_order, ActuatorEnv, AgentActuator, Outcome, PromiseActuator};
pub use error::AgentError;

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use cf_net::{AgentConnection, ConnCache, Connect, ConnectionFlags, NetError, ProtocolVersion};

    use crate::dispatch::ActuatorEnv;

    /// Refuses every dial, as if all servers were down.
    pub struct NoNetwork;

    impl Connect for NoNetwork {
        fn connect(
            &self,
            server: &str,
            _port: &str,
            _flags: ConnectionFlags,
        ) -> Result<AgentConnection, NetError> {
            Err(NetError::ServerOffline {
                server: server.to_string(),
            })
        }
    }

    pub fn test_env() -> ActuatorEnv {
        ActuatorEnv {
            cache: Arc::new(ConnCache::new()),
            connector: Arc::new(NoNetwork),
            default_port: cf_net::DEFAULT_PORT.to_string(),
            protocol: ProtocolVersion::CLASSIC,
            command_timeout: Duration::from_secs(10),
        }
    }

    #[derive(Clone, Default)]
    pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        pub fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
