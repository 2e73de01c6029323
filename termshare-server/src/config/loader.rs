//! Configuration loader

use std::path::Path;

use termshare_utils::{config_file, Result, TermshareError};

use super::AppConfig;

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from default location
    pub fn load() -> Result<AppConfig> {
        let path = config_file();
        if path.exists() {
            Self::load_from_path(&path)
        } else {
            Ok(AppConfig::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<AppConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| TermshareError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::parse(&content, path)
    }

    /// Parse configuration from string
    pub fn parse(content: &str, path: &Path) -> Result<AppConfig> {
        toml::from_str(content).map_err(|e| TermshareError::ConfigInvalid {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Validate configuration
    pub fn validate(config: &AppConfig) -> Result<()> {
        let server = &config.server;

        if server.outbound_queue_capacity == 0 {
            return Err(TermshareError::config(
                "outbound_queue_capacity must be at least 1",
            ));
        }

        if server.handshake_timeout_secs == 0 {
            return Err(TermshareError::config(
                "handshake_timeout_secs must be at least 1",
            ));
        }

        if server.decision_timeout_secs == Some(0) {
            return Err(TermshareError::config(
                "decision_timeout_secs must be at least 1 when set",
            ));
        }

        if server.host_name.is_empty() || server.host_name.chars().any(char::is_whitespace) {
            return Err(TermshareError::config(
                "host_name must be non-empty and contain no whitespace",
            ));
        }

        if server.max_line_length < 64 {
            return Err(TermshareError::config("max_line_length must be at least 64"));
        }

        if server.listen_addr.is_empty() {
            return Err(TermshareError::config("listen_addr must not be empty"));
        }

        Ok(())
    }

    /// Load and validate
    pub fn load_and_validate() -> Result<AppConfig> {
        let config = Self::load()?;
        Self::validate(&config)?;
        Ok(config)
    }
}
