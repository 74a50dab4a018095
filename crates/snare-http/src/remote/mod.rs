//! Remote control of mock servers.
//!
//! A [`StandaloneHost`] runs mock servers on behalf of [`RemoteClient`]s
//! connected over the control protocol in [`protocol`]. Each client
//! connection gets its own server.

mod client;
mod host;
pub mod protocol;

pub use client::RemoteClient;
pub use host::StandaloneHost;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Control connection I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Control protocol error: {0}")]
    Protocol(String),

    #[error("Control request timed out")]
    Timeout,

    #[error("Control connection closed")]
    ConnectionClosed,

    #[error("Host error: {message}")]
    Host { message: String },
}

impl From<serde_json::Error> for RemoteError {
    fn from(e: serde_json::Error) -> Self {
        RemoteError::Protocol(e.to_string())
    }
}
