//! The `MockServer` trait and its rule-building sugar.
//!
//! [`LocalServer`](crate::LocalServer) and [`RemoteClient`](crate::RemoteClient)
//! both implement [`MockServer`], so test code can be written once and run
//! against an in-process server or a standalone host.
//!
//! ```no_run
//! use snare_http::{LocalServer, MockServer, MockServerExt, ServerConfig};
//!
//! # async fn example() -> Result<(), snare_http::ServerError> {
//! let server = LocalServer::new();
//! server.start(ServerConfig::default()).await?;
//! server
//!     .get("/mocked-endpoint")
//!     .then_reply(200, "Mock response")
//!     .await?;
//! let url = server.url_for("/mocked-endpoint")?;
//! # let _ = url;
//! server.stop().await?;
//! # Ok(())
//! # }
//! ```

use crate::capture::{CompletedRequest, CompletedResponse};
use crate::config::ServerConfig;
use crate::events::{Subscriber, SubscriptionHandle};
use crate::rules::{
    Callback, Handler, Matcher, PassthroughOptions, Reply, RuleDefinition, RuleHandle, StringMatcher,
};
use crate::server::ServerError;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// A mock server, running in this process or behind a control connection.
#[async_trait]
pub trait MockServer: Send + Sync {
    /// Bind and start serving. Port 0 picks an ephemeral port.
    async fn start(&self, config: ServerConfig) -> Result<(), ServerError>;

    /// Stop serving after in-flight requests finish. Clears rules and
    /// subscriptions.
    async fn stop(&self) -> Result<(), ServerError>;

    fn port(&self) -> Result<u16, ServerError>;

    /// Absolute URL of `path` on this server.
    fn url_for(&self, path: &str) -> Result<String, ServerError>;

    async fn add_rule(&self, rule: RuleDefinition) -> Result<RuleHandle, ServerError>;

    async fn remove_rule(&self, handle: &RuleHandle) -> Result<bool, ServerError>;

    /// Remove every rule.
    async fn reset(&self) -> Result<(), ServerError>;

    /// Subscribe to traffic events. Resolves once the subscription is active.
    async fn on(&self, subscriber: Subscriber) -> Result<SubscriptionHandle, ServerError>;

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<bool, ServerError>;
}

/// Convenience methods available on every [`MockServer`].
#[async_trait]
pub trait MockServerExt: MockServer {
    fn get(&self, path: &str) -> RuleBuilder<'_, Self> {
        RuleBuilder::new(self, Some("GET"), path)
    }

    fn post(&self, path: &str) -> RuleBuilder<'_, Self> {
        RuleBuilder::new(self, Some("POST"), path)
    }

    fn put(&self, path: &str) -> RuleBuilder<'_, Self> {
        RuleBuilder::new(self, Some("PUT"), path)
    }

    fn delete(&self, path: &str) -> RuleBuilder<'_, Self> {
        RuleBuilder::new(self, Some("DELETE"), path)
    }

    fn patch(&self, path: &str) -> RuleBuilder<'_, Self> {
        RuleBuilder::new(self, Some("PATCH"), path)
    }

    fn head(&self, path: &str) -> RuleBuilder<'_, Self> {
        RuleBuilder::new(self, Some("HEAD"), path)
    }

    fn options(&self, path: &str) -> RuleBuilder<'_, Self> {
        RuleBuilder::new(self, Some("OPTIONS"), path)
    }

    /// Rule for any method.
    fn any_request(&self, path: &str) -> RuleBuilder<'_, Self> {
        RuleBuilder::new(self, None, path)
    }

    async fn on_request<F>(&self, f: F) -> Result<SubscriptionHandle, ServerError>
    where
        F: Fn(Arc<CompletedRequest>) + Send + Sync + 'static,
    {
        self.on(Subscriber::request(f)).await
    }

    async fn on_response<F>(&self, f: F) -> Result<SubscriptionHandle, ServerError>
    where
        F: Fn(Arc<CompletedResponse>) + Send + Sync + 'static,
    {
        self.on(Subscriber::response(f)).await
    }
}

impl<T: MockServer + ?Sized> MockServerExt for T {}

/// Builder for one rule. Filters narrow the match; a `then_*` call registers it.
#[must_use = "a rule is only registered by one of the `then_*` methods"]
pub struct RuleBuilder<'a, S: ?Sized> {
    server: &'a S,
    matchers: Vec<Matcher>,
    times: Option<u32>,
}

impl<'a, S: MockServer + ?Sized> RuleBuilder<'a, S> {
    pub fn new(server: &'a S, method: Option<&str>, path: &str) -> Self {
        let mut matchers = Vec::new();
        if let Some(method) = method {
            matchers.push(Matcher::method(method));
        }
        matchers.push(Matcher::url(path));
        Self {
            server,
            matchers,
            times: None,
        }
    }

    /// Add an arbitrary matcher.
    pub fn matching(mut self, matcher: Matcher) -> Self {
        self.matchers.push(matcher);
        self
    }

    pub fn with_header(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.matching(Matcher::header(name, value))
    }

    pub fn with_query(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.matching(Matcher::query(name, value))
    }

    /// Decoded body text must equal `body`.
    pub fn with_body(self, body: impl Into<String>) -> Self {
        self.matching(Matcher::Body {
            body: StringMatcher::Equals(body.into()),
        })
    }

    pub fn with_json_body(self, json: Value) -> Self {
        self.matching(Matcher::JsonBody { json })
    }

    pub fn with_json_body_including(self, json: Value) -> Self {
        self.matching(Matcher::JsonBodyIncluding { json })
    }

    /// Handle a single request, then stop matching.
    pub fn once(self) -> Self {
        self.times(1)
    }

    pub fn times(mut self, n: u32) -> Self {
        self.times = Some(n);
        self
    }

    /// Register the rule with an explicit handler.
    pub async fn then(self, handler: Handler) -> Result<RuleHandle, ServerError> {
        self.server
            .add_rule(RuleDefinition {
                matchers: self.matchers,
                handler,
                times: self.times,
            })
            .await
    }

    pub async fn then_reply(
        self,
        status: u16,
        body: impl Into<bytes::Bytes>,
    ) -> Result<RuleHandle, ServerError> {
        self.then(Handler::StaticReply(Reply::new(status).with_body(body)))
            .await
    }

    pub async fn then_reply_with_headers<K, V>(
        self,
        status: u16,
        body: impl Into<bytes::Bytes>,
        headers: impl IntoIterator<Item = (K, V)>,
    ) -> Result<RuleHandle, ServerError>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut reply = Reply::new(status).with_body(body);
        for (name, value) in headers {
            reply.headers.append(name, value);
        }
        self.then(Handler::StaticReply(reply)).await
    }

    pub async fn then_json(self, status: u16, json: &Value) -> Result<RuleHandle, ServerError> {
        self.then(Handler::StaticReply(Reply::new(status).with_json(json)))
            .await
    }

    /// Forward proxied requests to their original destination.
    pub async fn then_passthrough(self) -> Result<RuleHandle, ServerError> {
        self.then(Handler::Passthrough(PassthroughOptions::default()))
            .await
    }

    /// Forward to `origin` (`scheme://host[:port]`), keeping path and query.
    pub async fn then_forward_to(self, origin: impl Into<String>) -> Result<RuleHandle, ServerError> {
        self.then(Handler::Passthrough(PassthroughOptions {
            forward_to: Some(origin.into()),
        }))
        .await
    }

    pub async fn then_callback<F, Fut>(self, f: F) -> Result<RuleHandle, ServerError>
    where
        F: Fn(Arc<CompletedRequest>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Reply>> + Send + 'static,
    {
        self.then(Handler::Callback(Callback::new(f))).await
    }
}
