//! The interception pipeline.
//!
//! Every request walks `Receiving → Captured → Matching → Handling →
//! Responding → Completed`; failures after capture move it to `Errored`,
//! which still produces a response and a response event.

mod handler;
pub mod headers;
mod passthrough;
mod response;

pub use handler::handle_request;
pub use passthrough::{Forwarder, PassthroughError};
pub use response::{build_response, build_response_with_headers, PreparedResponse, ReplyError};

use crate::capture::Protocol;
use crate::events::EventBus;
use crate::rules::RuleRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// Shared state every request of one running server goes through
pub struct Pipeline {
    pub registry: Arc<RuleRegistry>,
    pub bus: Arc<EventBus>,
    pub forwarder: Forwarder,
}

/// Per-connection facts the pipeline needs to reconstruct a request's URL
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub protocol: Protocol,
    pub remote_addr: Option<SocketAddr>,
    /// Authority from the `CONNECT` that opened this tunnel, if any
    pub tunnel_authority: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Receiving,
    Captured,
    Matching,
    Handling,
    Responding,
    Completed,
    Errored,
}

impl Stage {
    pub fn advance(&mut self, next: Stage, id: &str) {
        debug!(id = %id, from = ?*self, to = ?next, "Pipeline stage");
        *self = next;
    }

    pub fn fail(&mut self, id: &str, reason: &str) {
        debug!(id = %id, from = ?*self, reason = %reason, "Pipeline errored");
        *self = Stage::Errored;
    }
}
