//! Server configuration loaded from TOML with command-line overrides.

use crate::packets::MAX_MESSAGE_LEN;
use crate::spatial::Position;
use serde::{Deserialize, Serialize};
use shared::protocol::{BASE_PORT, MAX_PLAYERS};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("welcome message is {len} bytes, the chat box takes at most {max}")]
    MessageTooLong { len: usize, max: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port_offset: u16,
    pub tick_ms: u64,
    pub flush_ms: u64,
    pub write_timeout_ms: u64,
    pub max_clients: usize,
    pub max_npcs: usize,
    pub view_radius: i32,
    pub login_timeout_secs: u64,
    pub ping_timeout_secs: u64,
    pub spawn: Position,
    pub regions: Option<PathBuf>,
    pub music: Option<PathBuf>,
    pub welcome_message: String,
    pub default_rights: u8,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port_offset: 0,
            tick_ms: 600,
            flush_ms: 30,
            write_timeout_ms: 2000,
            max_clients: 2000,
            max_npcs: 4096,
            view_radius: 2,
            login_timeout_secs: 5,
            ping_timeout_secs: 60,
            spawn: Position::new(2810, 3467, 0),
            regions: None,
            music: None,
            welcome_message: "Welcome.".to_string(),
            default_rights: 0,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.welcome_message.len() > MAX_MESSAGE_LEN {
            return Err(ConfigError::MessageTooLong {
                len: self.welcome_message.len(),
                max: MAX_MESSAGE_LEN,
            });
        }
        Ok(())
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, BASE_PORT.saturating_add(self.port_offset))
    }

    /// Client capacity, kept below the add-list terminator.
    pub fn client_capacity(&self) -> usize {
        self.max_clients.clamp(1, MAX_PLAYERS)
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_ms.max(1))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr(), "0.0.0.0:43594");
        assert_eq!(config.tick_duration(), Duration::from_millis(600));
        assert_eq!(config.spawn, Position::new(2810, 3467, 0));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = ServerConfig::parse(
            r#"
            port_offset = 1
            max_clients = 10
            spawn = { x = 3200, y = 3200 }
            "#,
        )
        .unwrap();
        assert_eq!(config.bind_addr(), "0.0.0.0:43595");
        assert_eq!(config.client_capacity(), 10);
        assert_eq!(config.spawn, Position::new(3200, 3200, 0));
        assert_eq!(config.view_radius, 2);
    }

    #[test]
    fn test_capacity_never_reaches_terminator() {
        let config = ServerConfig {
            max_clients: 5000,
            ..ServerConfig::default()
        };
        assert_eq!(config.client_capacity(), 2047);
    }

    #[test]
    fn test_long_welcome_message_is_rejected() {
        let text = format!("welcome_message = \"{}\"", "w".repeat(300));
        let config = ServerConfig::parse(&text).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MessageTooLong { len: 300, max: 254 })
        ));
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_unknown_types_fail() {
        assert!(ServerConfig::parse("tick_ms = \"fast\"").is_err());
    }
}
