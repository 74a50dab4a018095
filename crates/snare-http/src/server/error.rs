use crate::pipeline::PassthroughError;
use crate::remote::RemoteError;

/// Errors from mock server operations, local or remote
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Server is already running on port {0}")]
    AlreadyRunning(u16),

    #[error("Server is not running")]
    NotRunning,

    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("Failed to set up passthrough: {0}")]
    Passthrough(#[from] PassthroughError),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl From<regex::Error> for ServerError {
    fn from(e: regex::Error) -> Self {
        ServerError::InvalidRule(e.to_string())
    }
}
