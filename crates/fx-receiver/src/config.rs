//! Receiver configuration loading.
//!
//! TOML is the config source; the raw deserialization types keep every field
//! optional and the conversion into the validated config reports what is
//! missing or out of range.
//!
//! # Client role
//! ```toml
//! role = "client"
//! host = "127.0.0.1"
//! port = 58430
//! ```
//!
//! # Server role
//! ```toml
//! role = "server"
//! port = 58429
//! password = "secret"
//! ```

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::Path;

/// Validated receiver configuration.
#[derive(Debug, Clone)]
pub enum ReceiverConfig {
    /// Dial a single upstream service.
    Client(ClientConfig),
    /// Accept many upstream connections, each authenticated by the shared
    /// secret.
    Server(ServerConfig),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub password: String,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, ConfigError> {
        let host = host.into();
        if host.is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        Ok(ClientConfig {
            host,
            port: validate_port(i64::from(port))?,
        })
    }
}

impl ServerConfig {
    pub fn new(port: u16, password: impl Into<String>) -> Result<Self, ConfigError> {
        let password = password.into();
        if password.is_empty() {
            return Err(ConfigError::EmptyPassword);
        }
        Ok(ServerConfig {
            port: validate_port(i64::from(port))?,
            password,
        })
    }
}

impl ReceiverConfig {
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
    fn validate(self) -> Result<ReceiverConfig, ConfigError> {
        let role = self.role.ok_or(ConfigError::MissingField("role"))?;
        let port = self.port.ok_or(ConfigError::MissingField("port"))?;
        let port = validate_port(port)?;
        match role.as_str() {
            "client" => {
                let host = self.host.ok_or(ConfigError::MissingField("host"))?;
                if host.is_empty() {
                    return Err(ConfigError::EmptyHost);
                }
                Ok(ReceiverConfig::Client(ClientConfig { host, port }))
            }
            "server" => {
                let password = self.password.ok_or(ConfigError::MissingField("password"))?;
                if password.is_empty() {
                    return Err(ConfigError::EmptyPassword);
                }
                Ok(ReceiverConfig::Server(ServerConfig { port, password }))
            }
            other => Err(ConfigError::UnknownRole(other.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_parses() {
        let config =
            ReceiverConfig::from_toml_str("role = \"client\"\nhost = \"127.0.0.1\"\nport = 57575")
                .unwrap();
        match config {
            ReceiverConfig::Client(c) => {
                assert_eq!(c.host, "127.0.0.1");
                assert_eq!(c.port, 57575);
            }
            ReceiverConfig::Server(_) => panic!("expected client role"),
        }
    }

    #[test]
    fn server_config_parses() {
        let config =
            ReceiverConfig::from_toml_str("role = \"server\"\nport = 57575\npassword = \"pw\"")
                .unwrap();
        match config {
            ReceiverConfig::Server(s) => {
                assert_eq!(s.port, 57575);
                assert_eq!(s.password, "pw");
            }
            ReceiverConfig::Client(_) => panic!("expected server role"),
        }
    }

    #[test]
    fn port_bounds_are_enforced() {
        for bad in [0, 65536, -1] {
            let text = format!("role = \"server\"\nport = {bad}\npassword = \"pw\"");
            assert!(matches!(
                ReceiverConfig::from_toml_str(&text),
                Err(ConfigError::PortOutOfRange(p)) if p == bad
            ));
        }
        for good in [1, 65535] {
            let text = format!("role = \"server\"\nport = {good}\npassword = \"pw\"");
            assert!(ReceiverConfig::from_toml_str(&text).is_ok());
        }
    }

    #[test]
    fn server_password_must_be_non_empty() {
        let err =
            ReceiverConfig::from_toml_str("role = \"server\"\nport = 1\npassword = \"\"");
        assert!(matches!(err, Err(ConfigError::EmptyPassword)));
        assert!(matches!(
            ServerConfig::new(1, ""),
            Err(ConfigError::EmptyPassword)
        ));
        ServerConfig::new(1, "x").unwrap();
    }

    #[test]
    fn missing_fields_are_named() {
        assert!(matches!(
            ReceiverConfig::from_toml_str("role = \"client\"\nport = 1"),
            Err(ConfigError::MissingField("host"))
        ));
        assert!(matches!(
            ReceiverConfig::from_toml_str("port = 1"),
            Err(ConfigError::MissingField("role"))
        ));
        assert!(matches!(
            ReceiverConfig::from_toml_str("role = \"proxy\"\nport = 1"),
            Err(ConfigError::UnknownRole(_))
        ));
    }

    #[test]
    fn direct_constructors_validate_too() {
        assert!(matches!(
            ClientConfig::new("", 1),
            Err(ConfigError::EmptyHost)
        ));
        assert!(matches!(
            ClientConfig::new("localhost", 0),
            Err(ConfigError::PortOutOfRange(0))
        ));
        ClientConfig::new("localhost", 65535).unwrap();
    }
}
