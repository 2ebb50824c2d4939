//! Server configuration, loadable from TOML.
//!
//! Every field has a default, so an empty file (or no file) yields a server
//! on `127.0.0.1:8080`:
//!
//! ```toml
//! bind_address = "0.0.0.0"
//! port = 8443
//! max_connections = 512
//! close_delay_ms = 50
//!
//! [tls]
//! cert_path = "certs/server.pem"
//! key_path = "certs/server.key"
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::http::request::DEFAULT_MAX_LINE_LENGTH;

/// Errors raised while loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// PEM files for the TLS listener.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Listener and connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    /// `0` asks the OS for a free port.
    pub port: u16,
    pub tls: Option<TlsConfig>,
    /// Upper bound on connections served at once; unbounded when unset.
    pub max_connections: Option<usize>,
    /// How long `stop()` waits for in-flight connections.
    pub shutdown_grace_ms: u64,
    /// Pause between half-closing the read side and closing the socket.
    pub close_delay_ms: u64,
    /// Deadline for receiving the complete request head.
    pub header_timeout_ms: u64,
    pub max_header_line: usize,
    /// How long a request in async mode may wait for its continuation.
    pub async_timeout_ms: u64,
    /// Interval of the idle-session sweep; `0` disables it.
    pub session_sweep_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_owned(),
            port: 8080,
            tls: None,
            max_connections: None,
            shutdown_grace_ms: 5_000,
            close_delay_ms: 50,
            header_timeout_ms: 10_000,
            max_header_line: DEFAULT_MAX_LINE_LENGTH,
            async_timeout_ms: 30_000,
            session_sweep_ms: 60_000,
        }
    }
}

impl ServerConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Examples
    ///
    /// ```
    /// use servlette::config::ServerConfig;
    ///
    /// let config = ServerConfig::from_toml_str("port = 9000\nclose_delay_ms = 0").unwrap();
    /// assert_eq!(config.port, 9000);
    /// assert_eq!(config.bind_address, "127.0.0.1");
    /// ```
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_ip()?;
        if self.max_connections == Some(0) {
            return Err(ConfigError::Invalid("max_connections must be at least 1".into()));
        }
        if self.max_header_line < 64 {
            return Err(ConfigError::Invalid("max_header_line must be at least 64".into()));
        }
        if self.header_timeout_ms == 0 || self.async_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        Ok(())
    }

    /// Address to bind; call [`validate`](Self::validate) first.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        Ok(SocketAddr::new(self.bind_ip()?, self.port))
    }

    fn bind_ip(&self) -> Result<IpAddr, ConfigError> {
        self.bind_address.parse().map_err(|_| {
            let message = format!("bind_address {:?} is not an IP address", self.bind_address);
            ConfigError::Invalid(message)
        })
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn close_delay(&self) -> Duration {
        Duration::from_millis(self.close_delay_ms)
    }

    pub fn header_timeout(&self) -> Duration {
        Duration::from_millis(self.header_timeout_ms)
    }

    pub fn async_timeout(&self) -> Duration {
        Duration::from_millis(self.async_timeout_ms)
    }

    pub fn session_sweep(&self) -> Option<Duration> {
        (self.session_sweep_ms > 0).then(|| Duration::from_millis(self.session_sweep_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_all_defaults() {
        let config = ServerConfig::from_toml_str("").unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.close_delay(), Duration::from_millis(50));
        assert!(config.tls.is_none());
        assert_eq!(config.socket_addr().unwrap(), "127.0.0.1:8080".parse().unwrap());
    }

    #[test]
    fn tls_table_is_read() {
        let config = ServerConfig::from_toml_str(
            r#"
            port = 8443
            [tls]
            cert_path = "a.pem"
            key_path = "a.key"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.tls,
            Some(TlsConfig {
                cert_path: "a.pem".into(),
                key_path: "a.key".into()
            })
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            ServerConfig::from_toml_str("bind_address = \"localhost\""),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ServerConfig::from_toml_str("max_connections = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(ServerConfig::from_toml_str("port = \"x\""), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = ServerConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.toml"));
    }

    #[test]
    fn sweep_can_be_disabled() {
        let config = ServerConfig::from_toml_str("session_sweep_ms = 0").unwrap();
        assert_eq!(config.session_sweep(), None);
    }
}
