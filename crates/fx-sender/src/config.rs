//! Sender configuration loading, mirroring the receiver's raw-to-validated
//! TOML pattern.
//!
//! # Client role (dials a game hosting the server role)
//! ```toml
//! role = "client"
//! host = "127.0.0.1"
//! port = 57575
//! password = "secret"
//! ```
//!
//! # Server role (accepts dialing games)
//! ```toml
//! role = "server"
//! port = 58430
//! ```

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Validated sender configuration.
#[derive(Debug, Clone)]
pub enum SenderConfig {
    Client(SenderClientConfig),
    Server(SenderServerConfig),
}

/// Client role: dial an upstream game server and log in with the shared
/// secret when challenged.
#[derive(Debug, Clone)]
pub struct SenderClientConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
}

/// Server role: accept dialing games. The login challenge only flows from a
/// game-hosted server to a dialing sender, so no password is held here.
#[derive(Debug, Clone)]
pub struct SenderServerConfig {
    pub port: u16,
}

impl SenderClientConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        password: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let host = host.into();
        if host.is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        let password = password.into();
        if password.is_empty() {
            return Err(ConfigError::EmptyPassword);
        }
        Ok(SenderClientConfig {
            host,
            port: validate_port(i64::from(port))?,
            password,
        })
    }
}

impl SenderServerConfig {
    pub fn new(port: u16) -> Result<Self, ConfigError> {
        Ok(SenderServerConfig {
            port: validate_port(i64::from(port))?,
        })
    }
}

impl SenderConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text)?;
        raw.validate()
    }
}

/// Tunables with protocol-inherited defaults; all overridable.
#[derive(Debug, Clone)]
pub struct SenderOptions {
    /// Deadline for the first response to each request; `None` means never.
    pub initial_response_timeout: Option<Duration>,
    /// RETRYs honored before the stream is completed instead.
    pub max_retries: u32,
    /// Grace period for in-flight packets during shutdown.
    pub drain_window: Duration,
    /// Cadence of unsolicited KEEP_ALIVE pings while open; `None` disables.
    pub keep_alive_interval: Option<Duration>,
}

impl Default for SenderOptions {
    fn default() -> Self {
        SenderOptions {
            initial_response_timeout: Some(Duration::from_secs(15)),
            max_retries: 6,
            drain_window: Duration::from_secs(2),
            keep_alive_interval: Some(Duration::from_secs(15)),
        }
    }
}

fn validate_port(port: i64) -> Result<u16, ConfigError> {
    if (1..=65535).contains(&port) {
        Ok(u16::try_from(port).unwrap_or_default())
    } else {
        Err(ConfigError::PortOutOfRange(port))
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    role: Option<String>,
    host: Option<String>,
    port: Option<i64>,
    password: Option<String>,
}

impl RawConfig {
    fn validate(self) -> Result<SenderConfig, ConfigError> {
        let role = self.role.ok_or(ConfigError::MissingField("role"))?;
        let port = validate_port(self.port.ok_or(ConfigError::MissingField("port"))?)?;
        match role.as_str() {
            "client" => {
                let host = self.host.ok_or(ConfigError::MissingField("host"))?;
                if host.is_empty() {
                    return Err(ConfigError::EmptyHost);
                }
                let password = self.password.ok_or(ConfigError::MissingField("password"))?;
                if password.is_empty() {
                    return Err(ConfigError::EmptyPassword);
                }
                Ok(SenderConfig::Client(SenderClientConfig {
                    host,
                    port,
                    password,
                }))
            }
            "server" => Ok(SenderConfig::Server(SenderServerConfig { port })),
            other => Err(ConfigError::UnknownRole(other.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_requires_the_shared_secret() {
        let config = SenderConfig::from_toml_str(
            "role = \"client\"\nhost = \"127.0.0.1\"\nport = 57575\npassword = \"pw\"",
        )
        .unwrap();
        match config {
            SenderConfig::Client(c) => {
                assert_eq!(c.port, 57575);
                assert_eq!(c.password, "pw");
            }
            SenderConfig::Server(_) => panic!("expected client role"),
        }

        let missing = SenderConfig::from_toml_str(
            "role = \"client\"\nhost = \"127.0.0.1\"\nport = 57575",
        );
        assert!(matches!(missing, Err(ConfigError::MissingField("password"))));
    }

    #[test]
    fn server_config_is_port_only() {
        let config = SenderConfig::from_toml_str("role = \"server\"\nport = 58430").unwrap();
        match config {
            SenderConfig::Server(s) => assert_eq!(s.port, 58430),
            SenderConfig::Client(_) => panic!("expected server role"),
        }
    }

    #[test]
    fn port_bounds_are_enforced() {
        for bad in [0, 65536] {
            let text = format!("role = \"server\"\nport = {bad}");
            assert!(matches!(
                SenderConfig::from_toml_str(&text),
                Err(ConfigError::PortOutOfRange(p)) if p == bad
            ));
        }
        assert!(SenderServerConfig::new(1).is_ok());
        assert!(SenderServerConfig::new(65535).is_ok());
        assert!(matches!(
            SenderClientConfig::new("h", 0, "pw"),
            Err(ConfigError::PortOutOfRange(0))
        ));
    }

    #[test]
    fn defaults_match_the_protocol() {
        let options = SenderOptions::default();
        assert_eq!(options.initial_response_timeout, Some(Duration::from_secs(15)));
        assert_eq!(options.max_retries, 6);
        assert_eq!(options.drain_window, Duration::from_secs(2));
        assert_eq!(options.keep_alive_interval, Some(Duration::from_secs(15)));
    }
}
