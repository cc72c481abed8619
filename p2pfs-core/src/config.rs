//! Configuration management for p2pfs
//!
//! Handles CLI argument parsing, config file loading, and defaults. Flags
//! given on the command line override values from `--config`, which in turn
//! override the built-in defaults.

use clap::Args;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::blockexc::ExchangeConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Flags accepted by every command
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// TOML config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Data directory for node identity and block storage
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Logging level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Bootstrap node multiaddr (can be specified multiple times)
    #[arg(long, global = true)]
    pub bootstrap_node: Vec<String>,

    /// Providers to ask for per block lookup
    #[arg(long, global = true)]
    pub provider_limit: Option<usize>,

    /// Overall deadline for one block lookup, in seconds
    #[arg(long, global = true)]
    pub fetch_timeout_secs: Option<u64>,
}

/// Flags for the long-running node
#[derive(Args, Debug, Clone, Default)]
pub struct StartCommand {
    /// TCP port for P2P transport
    #[arg(long)]
    pub listen_port: Option<u16>,

    /// HTTP port for REST API
    #[arg(long)]
    pub api_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub listen_port: u16,
    pub api_port: u16,
    pub log_level: String,
    pub bootstrap_nodes: Vec<String>,
    pub provider_limit: usize,
    pub request_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("./data"),
            listen_port: 8070,
            api_port: 8080,
            log_level: "info".to_string(),
            bootstrap_nodes: Vec::new(),
            provider_limit: 10,
            request_timeout_secs: 30,
            fetch_timeout_secs: 120,
        }
    }
}

impl Config {
    /// Load config from a TOML file; missing keys take their defaults
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Build the effective config from defaults, an optional file and flags
    pub fn resolve(args: &GlobalArgs) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };

        if let Some(data_dir) = &args.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(level) = &args.log_level {
            config.log_level = level.clone();
        }
        if !args.bootstrap_node.is_empty() {
            config.bootstrap_nodes = args.bootstrap_node.clone();
        }
        if let Some(limit) = args.provider_limit {
            config.provider_limit = limit;
        }
        if let Some(secs) = args.fetch_timeout_secs {
            config.fetch_timeout_secs = secs;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_start(mut self, start: &StartCommand) -> Self {
        if let Some(port) = start.listen_port {
            self.listen_port = port;
        }
        if let Some(port) = start.api_port {
            self.api_port = port;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.provider_limit == 0 {
            return Err(ConfigError::Invalid("provider_limit must be at least 1".to_string()));
        }
        if self.request_timeout_secs == 0 || self.fetch_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be at least 1 second".to_string()));
        }
        Ok(())
    }

    pub fn blocks_path(&self) -> PathBuf {
        self.data_dir.join("blocks")
    }

    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join("identity.key")
    }

    pub fn exchange_config(&self) -> ExchangeConfig {
        ExchangeConfig {
            provider_limit: self.provider_limit,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.listen_port, 8070);
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.provider_limit, 10);
    }

    #[test]
    fn test_exchange_config_from_defaults() {
        let exchange = Config::default().exchange_config();
        assert_eq!(exchange.provider_limit, 10);
        assert_eq!(exchange.request_timeout, Duration::from_secs(30));
        assert_eq!(exchange.fetch_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p2pfs.toml");
        std::fs::write(&path, "listen_port = 9000\nbootstrap_nodes = [\"/ip4/1.2.3.4/tcp/8070\"]\n").unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.listen_port, 9000);
        assert_eq!(config.bootstrap_nodes.len(), 1);
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.fetch_timeout_secs, 120);
    }

    #[test]
    fn test_flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p2pfs.toml");
        std::fs::write(&path, "data_dir = \"/from/file\"\nlog_level = \"warn\"\n").unwrap();

        let args = GlobalArgs {
            config: Some(path),
            data_dir: Some(PathBuf::from("./test-data")),
            provider_limit: Some(3),
            ..GlobalArgs::default()
        };

        let config = Config::resolve(&args).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("./test-data"));
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.provider_limit, 3);
    }

    #[test]
    fn test_start_overrides_ports() {
        let config = Config::default().with_start(&StartCommand {
            listen_port: Some(9000),
            api_port: None,
        });
        assert_eq!(config.listen_port, 9000);
        assert_eq!(config.api_port, 8080);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let args = GlobalArgs {
            provider_limit: Some(0),
            ..GlobalArgs::default()
        };
        assert!(matches!(Config::resolve(&args), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "listen_port = \"not a number\"").unwrap();
        assert!(matches!(Config::load_from_file(&path), Err(ConfigError::Toml(_))));
    }
}
