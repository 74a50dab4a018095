//! Snare: programmable HTTP/HTTPS interception for tests.
//!
//! A mock server captures every request it receives, matches it against
//! registered rules, answers with the first matching rule's handler and
//! publishes the completed request and response to subscribers.
//!
//! Servers run in-process ([`LocalServer`]) or inside a standalone host
//! process driven over a control connection ([`RemoteClient`]); both
//! implement [`MockServer`].

pub mod api;
pub mod body;
pub mod capture;
pub mod config;
pub mod events;
pub mod normalize;
pub mod pipeline;
pub mod remote;
pub mod rules;
pub mod server;

pub use api::{MockServer, MockServerExt, RuleBuilder};
pub use body::{CapturedBody, Encoding};
pub use capture::{CompletedRequest, CompletedResponse, ErrorKind, Headers, Protocol};
pub use config::{HostConfig, PassthroughConfig, ServerConfig, TlsConfig};
pub use events::{Event, EventKind, Subscriber, SubscriptionHandle};
pub use remote::{RemoteClient, RemoteError, StandaloneHost};
pub use rules::{Handler, Matcher, Reply, RuleDefinition, RuleHandle, StringMatcher};
pub use server::{LocalServer, ServerError, ServerState};
