// config.rs - Server configuration from cf-serverd.toml.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use cf_net::{ServerOptions, DEFAULT_PORT};

use crate::error::ServerError;

pub const DEFAULT_CONFIG_PATH: &str = "cf-serverd.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: String,

    /// Relative request paths resolve against this directory.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Only paths under one of these are served. Empty means `root` alone.
    #[serde(default)]
    pub admit: Vec<PathBuf>,

    /// Accept plaintext sessions.
    #[serde(default)]
    pub allow_classic: bool,

    #[serde(default)]
    pub tls_cert: Option<PathBuf>,

    #[serde(default)]
    pub tls_key: Option<PathBuf>,

    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,

    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            root: default_root(),
            admit: Vec::new(),
            allow_classic: false,
            tls_cert: None,
            tls_key: None,
            wait_timeout_ms: default_wait_timeout_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> String {
    DEFAULT_PORT.to_string()
}

fn default_root() -> PathBuf {
    PathBuf::from("/var/cf/masterfiles")
}

fn default_wait_timeout_ms() -> u64 {
    1000
}

fn default_idle_timeout_secs() -> u64 {
    30
}

fn default_max_connections() -> usize {
    50
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let content = std::fs::read_to_string(path).map_err(|source| ServerError::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ServerError::ParseConfig {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(config)
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self, ServerError> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "no server config, using defaults");
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        let invalid = |field: &str, reason: &str| ServerError::InvalidConfig {
            field: field.to_string(),
            reason: reason.to_string(),
        };
        if self.port.parse::<u16>().is_err() {
            return Err(invalid("port", "must be a number between 0 and 65535"));
        }
        if self.max_connections == 0 {
            return Err(invalid("max_connections", "must be at least 1"));
        }
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(invalid("tls_cert", "tls_cert and tls_key must be set together"));
        }
        if self.tls_cert.is_none() && !self.allow_classic {
            return Err(invalid(
                "allow_classic",
                "no TLS identity configured and classic sessions disabled: nothing could connect",
            ));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            allow_classic: self.allow_classic,
            wait_timeout: Duration::from_millis(self.wait_timeout_ms),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            max_connections: self.max_connections,
            ..ServerOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cf-serverd.toml");
        std::fs::write(&path, "root = \"/srv/files\"\nallow_classic = true\n").unwrap();
        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.root, PathBuf::from("/srv/files"));
        assert!(config.allow_classic);
        assert_eq!(config.port, "5308");
        assert_eq!(config.max_connections, 50);
        config.validate().unwrap();
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = ServerConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.listen_addr(), "0.0.0.0:5308");
    }

    #[test]
    fn unusable_configs_are_rejected() {
        // Defaults: no TLS identity and classic disabled.
        assert!(ServerConfig::default().validate().is_err());

        let half_tls = ServerConfig {
            tls_cert: Some(PathBuf::from("cert.pem")),
            ..ServerConfig::default()
        };
        assert!(matches!(
            half_tls.validate(),
            Err(ServerError::InvalidConfig { ref field, .. }) if field == "tls_cert"
        ));

        let bad_port = ServerConfig {
            port: "http".to_string(),
            allow_classic: true,
            ..ServerConfig::default()
        };
        assert!(bad_port.validate().is_err());
    }

    #[test]
    fn options_follow_config() {
        let config = ServerConfig {
            allow_classic: true,
            wait_timeout_ms: 50,
            max_connections: 4,
            ..ServerConfig::default()
        };
        let options = config.server_options();
        assert!(options.allow_classic);
        assert_eq!(options.wait_timeout, Duration::from_millis(50));
        assert_eq!(options.max_connections, 4);
    }
}
