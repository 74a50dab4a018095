//! Configuration types for mock servers and the standalone host.

mod listen;

use serde::{Deserialize, Serialize};
use std::path::Path;

pub use listen::{PassthroughConfig, ServerConfig, TlsConfig};

/// Default control-protocol address of the standalone host
pub const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1:45454";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration of the standalone host
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    /// Control-protocol listen address
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Server configuration for sessions whose `start` carries none
    #[serde(default, alias = "server_defaults")]
    pub server_defaults: ServerConfig,
    /// Upper bound on how long the host waits for a remote callback result
    #[serde(default = "default_request_timeout", alias = "request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_listen() -> String {
    DEFAULT_CONTROL_ADDR.to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            server_defaults: ServerConfig::default(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl HostConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: HostConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_host_port(&self.listen) {
            return Err(ConfigError::Invalid(format!(
                "listen address '{}' must be host:port",
                self.listen
            )));
        }

        if let Some(ref tls) = self.server_defaults.https {
            if tls.cert_path.is_empty() || tls.key_path.is_empty() {
                return Err(ConfigError::Invalid(
                    "TLS configuration requires both 'certPath' and 'keyPath'".to_string(),
                ));
            }
        }

        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "requestTimeoutSecs must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// `host:port` with a numeric port. The host may be a name, an IPv4
/// address or a bracketed IPv6 address; resolution happens at bind time.
fn is_host_port(addr: &str) -> bool {
    match addr.rsplit_once(':') {
        Some((host, port)) => {
            let host_ok = if host.starts_with('[') {
                host.ends_with(']') && host.len() > 2
            } else {
                !host.is_empty() && !host.contains(':')
            };
            host_ok && port.parse::<u16>().is_ok()
        }
        None => false,
    }
}
