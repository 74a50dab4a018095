//! Listener, TLS and passthrough configuration for one mock server.

use serde::{Deserialize, Serialize};

/// TLS configuration for the HTTPS listener and CONNECT interception
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    /// Path to TLS certificate file (PEM format)
    #[serde(alias = "cert_path")]
    pub cert_path: String,
    /// Path to TLS private key file (PEM format)
    #[serde(alias = "key_path")]
    pub key_path: String,
}

/// Upstream behaviour for passthrough rules
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassthroughConfig {
    /// Skip upstream certificate verification
    #[serde(default, alias = "ignore_host_certificate_errors")]
    pub ignore_host_certificate_errors: bool,
    #[serde(default = "default_passthrough_timeout", alias = "timeout_secs")]
    pub timeout_secs: u64,
}

fn default_passthrough_timeout() -> u64 {
    30
}

impl Default for PassthroughConfig {
    fn default() -> Self {
        Self {
            ignore_host_certificate_errors: false,
            timeout_secs: default_passthrough_timeout(),
        }
    }
}

/// Options for `MockServer::start`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind; 0 picks an ephemeral port
    #[serde(default)]
    pub port: u16,
    /// Serve HTTPS and intercept CONNECT tunnels with this certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https: Option<TlsConfig>,
    #[serde(default)]
    pub passthrough: PassthroughConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            https: None,
            passthrough: PassthroughConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_https(mut self, cert_path: impl Into<String>, key_path: impl Into<String>) -> Self {
        self.https = Some(TlsConfig {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        });
        self
    }

    pub fn ignore_host_certificate_errors(mut self) -> Self {
        self.passthrough.ignore_host_certificate_errors = true;
        self
    }
}
