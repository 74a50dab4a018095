//! In-process mock server.

mod connection;
mod core;
mod error;
mod tls;

pub use self::core::{LocalServer, ServerState};
pub use error::ServerError;
pub use tls::create_tls_acceptor;
