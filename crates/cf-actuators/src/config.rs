// config.rs - Agent configuration from .cf/agent.toml.
//
// Every field has a default so a missing file, or a file naming only a few
// keys, still yields a usable configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use cf_net::{parse_from_config, ProtocolVersion, DEFAULT_PORT};

use crate::error::AgentError;

pub const DEFAULT_CONFIG_PATH: &str = ".cf/agent.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Overrides the policy's own bundlesequence when non-empty.
    #[serde(default)]
    pub bundlesequence: Vec<String>,

    /// Policy-style version string: "classic", "tls", "latest", "1", "2".
    /// Unset means the latest version.
    #[serde(default)]
    pub protocol_version: Option<String>,

    #[serde(default = "default_port")]
    pub port: String,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,

    /// Evaluation passes per bundle.
    #[serde(default = "default_passes")]
    pub passes: usize,

    /// Defining any of these classes aborts the run.
    #[serde(default)]
    pub abort_classes: Vec<String>,

    #[serde(default = "default_outcome_log")]
    pub outcome_log: PathBuf,

    /// PEM bundle of CA certificates trusted for TLS sessions.
    #[serde(default)]
    pub trust_anchor: Option<PathBuf>,

    /// Name sent in the identification dialog. Defaults to `$USER`.
    #[serde(default)]
    pub username: Option<String>,

    /// Skip bundlesequence entries with no matching bundle instead of
    /// refusing to run.
    #[serde(default)]
    pub ignore_missing_bundles: bool,

    /// Default limit for commands promises without a `timeout` attribute.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bundlesequence: Vec::new(),
            protocol_version: None,
            port: default_port(),
            connect_timeout_secs: default_connect_timeout_secs(),
            io_timeout_secs: default_io_timeout_secs(),
            passes: default_passes(),
            abort_classes: Vec::new(),
            outcome_log: default_outcome_log(),
            trust_anchor: None,
            username: None,
            ignore_missing_bundles: false,
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

fn default_port() -> String {
    DEFAULT_PORT.to_string()
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_io_timeout_secs() -> u64 {
    30
}

fn default_passes() -> usize {
    3
}

fn default_outcome_log() -> PathBuf {
    PathBuf::from(".cf/outcomes.jsonl")
}

fn default_command_timeout_secs() -> u64 {
    300
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, AgentError> {
        let content = std::fs::read_to_string(path).map_err(|source| AgentError::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| AgentError::ParseConfig {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, defaults otherwise. A file that exists but
    /// does not parse is still an error.
    pub fn load_or_default(path: &Path) -> Result<Self, AgentError> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "no agent config, using defaults");
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.passes == 0 {
            return Err(AgentError::InvalidConfig {
                field: "passes".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if let Some(setting) = &self.protocol_version {
            let explicit_undefined = matches!(setting.as_str(), "0" | "undefined");
            if !explicit_undefined && parse_from_config(Some(setting)).is_undefined() {
                return Err(AgentError::InvalidConfig {
                    field: "protocol_version".to_string(),
                    reason: format!("unknown protocol version {:?}", setting),
                });
            }
        }
        Ok(())
    }

    pub fn protocol(&self) -> ProtocolVersion {
        parse_from_config(self.protocol_version.as_deref())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = AgentConfig::load_or_default(&dir.path().join("agent.toml")).unwrap();
        assert_eq!(config.passes, 3);
        assert_eq!(config.port, "5308");
        assert!(config.protocol().is_undefined());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(
            &path,
            "bundlesequence = [\"main\"]\nprotocol_version = \"classic\"\nabort_classes = [\"emergency\"]\n",
        )
        .unwrap();
        let config = AgentConfig::load(&path).unwrap();
        assert_eq!(config.bundlesequence, vec!["main"]);
        assert_eq!(config.protocol(), ProtocolVersion::CLASSIC);
        assert_eq!(config.abort_classes, vec!["emergency"]);
        assert_eq!(config.io_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn unknown_protocol_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(&path, "protocol_version = \"carrier-pigeon\"\n").unwrap();
        assert!(matches!(
            AgentConfig::load(&path),
            Err(AgentError::InvalidConfig { ref field, .. }) if field == "protocol_version"
        ));
    }

    #[test]
    fn zero_passes_is_rejected() {
        let config = AgentConfig {
            passes: 0,
            ..AgentConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(&path, "passes = \"many\"\n").unwrap();
        assert!(matches!(
            AgentConfig::load_or_default(&path),
            Err(AgentError::ParseConfig { .. })
        ));
    }
}
