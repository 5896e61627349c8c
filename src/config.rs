//! Deployment configuration.
//!
//! Both halves read the same TOML file; a server process uses `[server]`,
//! a client process `[client]`. Every field has a default, so an empty
//! file or a missing section is valid.
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! ws_port = 8082
//! http_port = 8080
//! history_limit = 64
//! log_level = "debug"
//!
//! [client]
//! server_url = "ws://127.0.0.1:8082"
//! hot_swap = true
//! restart = true
//! request_timeout_secs = 30
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::logger::Level;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {0}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
    #[error("{0}")]
    Validation(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    pub host: String,
    pub ws_port: u16,
    pub http_port: u16,
    /// How many updates each configuration retains before pruning.
    pub history_limit: usize,
    pub log_level: String,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            ws_port: 8082,
            http_port: 8080,
            history_limit: 64,
            log_level: "info".to_string(),
        }
    }
}

impl ServerOptions {
    pub fn log_level(&self) -> Level {
        Level::parse(&self.log_level).unwrap_or(Level::Info)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    pub server_url: String,
    /// Apply updates in place; when false every update escalates to an
    /// application restart.
    pub hot_swap: bool,
    /// Allow the client to restart the application on escalation.
    pub restart: bool,
    pub request_timeout_secs: u64,
    pub log_level: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8082".to_string(),
            hot_swap: true,
            restart: true,
            request_timeout_secs: 30,
            log_level: "info".to_string(),
        }
    }
}

impl ClientOptions {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn log_level(&self) -> Level {
        Level::parse(&self.log_level).unwrap_or(Level::Info)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Options {
    pub server: ServerOptions,
    pub client: ClientOptions,
}

impl Options {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io(path.to_path_buf(), err))?;
        let options: Options = toml::from_str(&raw)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.history_limit == 0 {
            return Err(ConfigError::Validation(
                "server.history_limit must be at least 1".to_string(),
            ));
        }
        if Level::parse(&self.server.log_level).is_none() {
            return Err(ConfigError::Validation(format!(
                "server.log_level `{}` is not a log level",
                self.server.log_level
            )));
        }
        if Level::parse(&self.client.log_level).is_none() {
            return Err(ConfigError::Validation(format!(
                "client.log_level `{}` is not a log level",
                self.client.log_level
            )));
        }
        let url = &self.client.server_url;
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConfigError::Validation(format!(
                "client.server_url `{url}` must start with ws:// or wss://"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let options = Options::default();
        assert_eq!(options.server.ws_port, 8082);
        assert_eq!(options.server.history_limit, 64);
        assert_eq!(options.server.log_level(), Level::Info);
        assert!(options.client.hot_swap);
        assert_eq!(options.client.request_timeout(), Duration::from_secs(30));
        options.validate().unwrap();
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rekindle.toml");
        std::fs::write(&path, "[server]\nws_port = 9000\nlog_level = \"debug\"\n").unwrap();
        let options = Options::load(&path).unwrap();
        assert_eq!(options.server.ws_port, 9000);
        assert_eq!(options.server.log_level(), Level::Debug);
        assert_eq!(options.server.http_port, 8080);
        assert_eq!(options.client.server_url, "ws://127.0.0.1:8082");
    }

    #[test]
    fn test_missing_file_is_an_io_error() {
        let err = Options::load(Path::new("/nonexistent/rekindle.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(..)));
    }

    #[test]
    fn test_malformed_toml_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rekindle.toml");
        std::fs::write(&path, "[server\n").unwrap();
        let err = Options::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn test_zero_history_limit_is_rejected() {
        let mut options = Options::default();
        options.server.history_limit = 0;
        assert!(matches!(
            options.validate().unwrap_err(),
            ConfigError::Validation(_)
        ));
    }

    #[test]
    fn test_non_websocket_server_url_is_rejected() {
        let mut options = Options::default();
        options.client.server_url = "http://127.0.0.1:8082".to_string();
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_unknown_log_level_is_rejected() {
        let mut options = Options::default();
        options.client.log_level = "chatty".to_string();
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_timeout_floor_is_one_second() {
        let mut options = Options::default();
        options.client.request_timeout_secs = 0;
        assert_eq!(options.client.request_timeout(), Duration::from_secs(1));
    }
}
