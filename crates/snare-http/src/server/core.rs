//! LocalServer - one in-process mock server.

use super::connection::{serve_accepted, ConnectionContext};
use super::tls::create_tls_acceptor;
use super::ServerError;
use crate::api::MockServer;
use crate::capture::Protocol;
use crate::config::ServerConfig;
use crate::events::{EventBus, Subscriber, SubscriptionHandle};
use crate::pipeline::{Forwarder, Pipeline};
use crate::rules::{RuleDefinition, RuleHandle, RuleRegistry};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

/// Lifecycle state of a server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Copy)]
struct Status {
    state: ServerState,
    port: Option<u16>,
    protocol: Protocol,
}

struct Running {
    port: u16,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// An HTTP(S) mock server running in this process.
///
/// Rules and subscriptions may be registered before `start`; `stop` clears
/// both, so every start/stop cycle begins empty.
pub struct LocalServer {
    registry: Arc<RuleRegistry>,
    bus: Arc<EventBus>,
    lifecycle: tokio::sync::Mutex<Option<Running>>,
    status: RwLock<Status>,
}

impl Default for LocalServer {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalServer {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(RuleRegistry::new()),
            bus: Arc::new(EventBus::new()),
            lifecycle: tokio::sync::Mutex::new(None),
            status: RwLock::new(Status {
                state: ServerState::Stopped,
                port: None,
                protocol: Protocol::Http,
            }),
        }
    }

    pub fn state(&self) -> ServerState {
        self.status.read().state
    }

    pub fn protocol(&self) -> Option<Protocol> {
        let status = self.status.read();
        status.port.map(|_| status.protocol)
    }

    async fn launch(&self, config: &ServerConfig) -> Result<Running, ServerError> {
        let tls = match config.https {
            Some(ref tls) => Some(create_tls_acceptor(&tls.cert_path, &tls.key_path)?),
            None => None,
        };
        let forwarder = Forwarder::new(&config.passthrough)?;

        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let port = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?
            .port();

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let ctx = Arc::new(ConnectionContext {
            pipeline: Arc::new(Pipeline {
                registry: Arc::clone(&self.registry),
                bus: Arc::clone(&self.bus),
                forwarder,
            }),
            tls,
            tracker: tracker.clone(),
            shutdown: shutdown.clone(),
        });

        tracker.spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                ctx.tracker.spawn(serve_accepted(stream, addr, Arc::clone(&ctx)));
                            }
                            Err(e) => {
                                error!("Accept error on port {}: {}", port, e);
                            }
                        }
                    }
                    _ = ctx.shutdown.cancelled() => {
                        info!("Mock server on port {} shutting down", port);
                        break;
                    }
                }
            }
        });

        Ok(Running {
            port,
            shutdown,
            tracker,
        })
    }

    pub(crate) fn on_with_id(&self, id: String, subscriber: Subscriber) -> SubscriptionHandle {
        self.bus.subscribe_with_id(id, subscriber)
    }

    /// Rule explanations in priority order.
    pub fn rule_explanations(&self) -> Vec<String> {
        self.registry.explanations()
    }
}

#[async_trait]
impl MockServer for LocalServer {
    /// Bind and start serving.
    async fn start(&self, config: ServerConfig) -> Result<(), ServerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(ref running) = *lifecycle {
            return Err(ServerError::AlreadyRunning(running.port));
        }

        self.status.write().state = ServerState::Starting;
        match self.launch(&config).await {
            Ok(running) => {
                let protocol = if config.https.is_some() {
                    Protocol::Https
                } else {
                    Protocol::Http
                };
                *self.status.write() = Status {
                    state: ServerState::Running,
                    port: Some(running.port),
                    protocol,
                };
                info!("Mock server listening on {}://{}:{}", protocol.as_str(), config.host, running.port);
                *lifecycle = Some(running);
                Ok(())
            }
            Err(e) => {
                self.status.write().state = ServerState::Stopped;
                Err(e)
            }
        }
    }

    /// Stop accepting, let in-flight requests finish, then clear rules and
    /// subscriptions.
    async fn stop(&self) -> Result<(), ServerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let running = lifecycle.take().ok_or(ServerError::NotRunning)?;

        self.status.write().state = ServerState::Stopping;
        running.shutdown.cancel();
        running.tracker.close();
        running.tracker.wait().await;

        self.registry.clear();
        self.bus.clear();
        *self.status.write() = Status {
            state: ServerState::Stopped,
            port: None,
            protocol: Protocol::Http,
        };
        info!("Mock server on port {} stopped", running.port);
        Ok(())
    }

    fn port(&self) -> Result<u16, ServerError> {
        self.status.read().port.ok_or(ServerError::NotRunning)
    }

    /// `http(s)://localhost:{port}{path}`
    fn url_for(&self, path: &str) -> Result<String, ServerError> {
        let status = *self.status.read();
        let port = status.port.ok_or(ServerError::NotRunning)?;
        Ok(format!("{}://localhost:{}{}", status.protocol.as_str(), port, path))
    }

    async fn add_rule(&self, rule: RuleDefinition) -> Result<RuleHandle, ServerError> {
        Ok(self.registry.add(rule)?)
    }

    async fn remove_rule(&self, handle: &RuleHandle) -> Result<bool, ServerError> {
        Ok(self.registry.remove(handle))
    }

    /// Remove every rule. Subscriptions are kept.
    async fn reset(&self) -> Result<(), ServerError> {
        self.registry.clear();
        Ok(())
    }

    async fn on(&self, subscriber: Subscriber) -> Result<SubscriptionHandle, ServerError> {
        Ok(self.bus.subscribe(subscriber))
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<bool, ServerError> {
        Ok(self.bus.unsubscribe(handle))
    }
}

impl Drop for LocalServer {
    fn drop(&mut self) {
        if let Ok(mut lifecycle) = self.lifecycle.try_lock() {
            if let Some(running) = lifecycle.take() {
                running.shutdown.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockServerExt;

    #[tokio::test]
    async fn test_lifecycle() {
        let server = LocalServer::new();
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(matches!(server.port(), Err(ServerError::NotRunning)));

        server.start(ServerConfig::default()).await.unwrap();
        assert_eq!(server.state(), ServerState::Running);
        let port = server.port().unwrap();
        assert_ne!(port, 0);
        assert_eq!(
            server.url_for("/x").unwrap(),
            format!("http://localhost:{port}/x")
        );

        assert!(matches!(
            server.start(ServerConfig::default()).await,
            Err(ServerError::AlreadyRunning(p)) if p == port
        ));

        server.stop().await.unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(matches!(server.stop().await, Err(ServerError::NotRunning)));
    }

    #[tokio::test]
    async fn test_bind_error_leaves_server_stopped() {
        let first = LocalServer::new();
        first.start(ServerConfig::default()).await.unwrap();
        let port = first.port().unwrap();

        let second = LocalServer::new();
        let err = second
            .start(ServerConfig::default().with_port(port))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
        assert_eq!(second.state(), ServerState::Stopped);

        first.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_clears_rules_and_subscriptions() {
        let server = LocalServer::new();
        server.get("/x").then_reply(200, "ok").await.unwrap();
        server.on_request(|_| {}).await.unwrap();

        server.start(ServerConfig::default()).await.unwrap();
        assert_eq!(server.rule_explanations().len(), 1);
        server.stop().await.unwrap();

        assert!(server.rule_explanations().is_empty());
        assert_eq!(server.bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_tls_error_on_start() {
        let server = LocalServer::new();
        let err = server
            .start(ServerConfig::default().with_https("/nonexistent/c.pem", "/nonexistent/k.pem"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Tls(_)));
        assert_eq!(server.state(), ServerState::Stopped);
    }
}
