//! Command-line interface and gateway configuration.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "arbor", about = "Arbor, the session-and-tree orchestration gateway")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the gateway (default).
    Serve,
    /// Configuration helpers.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Validate the config file and environment.
    Validate,
    /// Print the effective configuration.
    Show,
}

/// Gateway-level configuration, loaded from `arbor.toml` (if present) with
/// environment overrides. Per-user behaviour lives in `FrontendConfig`, not
/// here.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Directory for frontend config files and the resource report.
    pub data_dir: PathBuf,
    /// User idle timeout in minutes; 0 disables user eviction.
    pub user_timeout: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8000,
            data_dir: PathBuf::from("data"),
            user_timeout: 20,
        }
    }
}

impl GatewayConfig {
    /// Load `arbor.toml` from the working directory (or `ARBOR_CONFIG`),
    /// then apply env overrides.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("ARBOR_CONFIG").unwrap_or_else(|_| "arbor.toml".into());
        let mut config = if std::path::Path::new(&path).exists() {
            let raw = std::fs::read_to_string(&path)?;
            toml::from_str(&raw)?
        } else {
            Self::default()
        };

        if let Ok(host) = std::env::var("ARBOR_HOST") {
            config.host = host;
        }
        if let Ok(port) = std::env::var("ARBOR_PORT") {
            config.port = port.parse()?;
        }
        if let Ok(dir) = std::env::var("ARBOR_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(timeout) = std::env::var("USER_TIMEOUT") {
            config.user_timeout = timeout.parse()?;
        }

        Ok(config)
    }

    /// Sanity-check the configuration. Returns human-readable problems.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.host.is_empty() {
            issues.push("host must not be empty".to_owned());
        }
        if self.port == 0 {
            issues.push("port must be non-zero".to_owned());
        }
        if self.data_dir.as_os_str().is_empty() {
            issues.push("data_dir must not be empty".to_owned());
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_empty());
        assert_eq!(config.user_timeout, 20);
    }

    #[test]
    fn toml_overrides_defaults() {
        let config: GatewayConfig =
            toml::from_str("port = 9001\nuser_timeout = 0\n").unwrap();
        assert_eq!(config.port, 9001);
        assert_eq!(config.user_timeout, 0);
        assert_eq!(config.host, "127.0.0.1");
    }
}
