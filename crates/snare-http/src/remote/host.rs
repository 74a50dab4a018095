//! StandaloneHost - serves mock servers to remote clients.
//!
//! Each control connection is one session owning one [`LocalServer`].
//! Closing the connection stops that session's server.

use super::protocol::{
    encode_line, CallbackOutcome, ClientMessage, Command, HostMessage, Outcome, Started,
};
use crate::api::MockServer;
use crate::config::HostConfig;
use crate::events::{Event, EventKind, Subscriber};
use crate::rules::{Callback, Handler, HandlerData, RuleData, RuleDefinition};
use crate::server::{LocalServer, ServerError};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Control-protocol server
pub struct StandaloneHost {
    listener: TcpListener,
    config: Arc<HostConfig>,
    shutdown: CancellationToken,
}

impl StandaloneHost {
    pub async fn bind(config: HostConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.listen)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.listen.clone(),
                source,
            })?;
        Ok(Self {
            listener,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Token that stops [`run`](Self::run) when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept control connections until shut down, then stop every session.
    pub async fn run(self) -> Result<(), ServerError> {
        let addr = self.local_addr().ok();
        info!("Snare host listening on {:?}", addr);

        let sessions = TaskTracker::new();
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            debug!("Control connection from {}", peer);
                            sessions.spawn(run_session(
                                stream,
                                peer,
                                Arc::clone(&self.config),
                                self.shutdown.clone(),
                            ));
                        }
                        Err(e) => {
                            warn!("Control accept error: {}", e);
                        }
                    }
                }
                _ = self.shutdown.cancelled() => break,
            }
        }

        sessions.close();
        sessions.wait().await;
        info!("Snare host stopped");
        Ok(())
    }
}

struct Session {
    server: LocalServer,
    outbound: mpsc::UnboundedSender<HostMessage>,
    pending_callbacks: Arc<Waiters<CallbackOutcome>>,
    pending_acks: Arc<Waiters<()>>,
    config: Arc<HostConfig>,
}

#[derive(Debug, thiserror::Error)]
enum ExchangeError {
    #[error("control connection closed")]
    Closed,

    #[error("no answer from the control client after {0}s")]
    TimedOut(u64),
}

/// Answers awaited from the control client, keyed by correlation id.
struct Waiters<T>(Mutex<HashMap<String, oneshot::Sender<T>>>);

impl<T> Waiters<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self(Mutex::new(HashMap::new())))
    }

    /// Wake the waiter for `key`. False if nobody is waiting any more.
    fn resolve(&self, key: &str, value: T) -> bool {
        match self.0.lock().remove(key) {
            Some(waiter) => waiter.send(value).is_ok(),
            None => false,
        }
    }

    /// Drop every waiter; their exchanges fail with `Closed`.
    fn clear(&self) {
        self.0.lock().clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Send `message` and wait for the answer filed under `key`.
    ///
    /// The entry is always gone when this returns.
    async fn exchange(
        &self,
        key: String,
        message: HostMessage,
        outbound: &mpsc::UnboundedSender<HostMessage>,
        timeout: Duration,
    ) -> Result<T, ExchangeError> {
        let (tx, rx) = oneshot::channel();
        self.0.lock().insert(key.clone(), tx);
        if outbound.send(message).is_err() {
            self.0.lock().remove(&key);
            return Err(ExchangeError::Closed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(ExchangeError::Closed),
            Err(_) => {
                self.0.lock().remove(&key);
                Err(ExchangeError::TimedOut(timeout.as_secs()))
            }
        }
    }
}

async fn run_session(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<HostConfig>,
    shutdown: CancellationToken,
) {
    let (read_half, mut write_half) = stream.into_split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<HostMessage>();

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let line = match encode_line(&message) {
                Ok(line) => line,
                Err(e) => {
                    warn!("Failed to encode control message: {}", e);
                    continue;
                }
            };
            if let Err(e) = write_half.write_all(line.as_bytes()).await {
                debug!("Control connection write failed: {}", e);
                break;
            }
        }
    });

    let session = Arc::new(Session {
        server: LocalServer::new(),
        outbound,
        pending_callbacks: Waiters::new(),
        pending_acks: Waiters::new(),
        config,
    });

    let mut lines = BufReader::new(read_half).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => session.receive(&line),
                Ok(None) => break,
                Err(e) => {
                    debug!("Control connection read failed: {}", e);
                    break;
                }
            },
            _ = shutdown.cancelled() => break,
        }
    }

    debug!("Control connection from {} closed", peer);
    session.pending_callbacks.clear();
    session.pending_acks.clear();
    if let Err(e) = session.server.stop().await {
        if !matches!(e, ServerError::NotRunning) {
            warn!("Failed to stop session server: {}", e);
        }
    }
    drop(session);
    writer.abort();
}

impl Session {
    fn receive(self: &Arc<Self>, line: &str) {
        let message: ClientMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                warn!("Invalid control message: {}", e);
                return;
            }
        };

        // Answers to host-initiated exchanges are resolved inline.
        match message.command {
            Command::CallbackResult {
                invocation_id,
                result,
            } => {
                if !self.pending_callbacks.resolve(&invocation_id, result) {
                    debug!(invocation = %invocation_id, "Late callback result ignored");
                }
                self.respond(message.id, Ok(Value::Null));
                return;
            }
            Command::EventAck { delivery_id } => {
                if !self.pending_acks.resolve(&delivery_id, ()) {
                    debug!(delivery = %delivery_id, "Late event ack ignored");
                }
                self.respond(message.id, Ok(Value::Null));
                return;
            }
            _ => {}
        }

        // Commands run concurrently so a slow `stop` never blocks the
        // callback results it is waiting on.
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let result = session.execute(message.command).await;
            session.respond(message.id, result);
        });
    }

    fn respond(&self, id: u64, result: Result<Value, ServerError>) {
        let result = match result {
            Ok(value) => Outcome::Ok(value),
            Err(e) => Outcome::Err(e.to_string()),
        };
        let _ = self.outbound.send(HostMessage::Response { id, result });
    }

    async fn execute(self: &Arc<Self>, command: Command) -> Result<Value, ServerError> {
        match command {
            Command::Start { config } => {
                let config = config.unwrap_or_else(|| self.config.server_defaults.clone());
                self.server.start(config).await?;
                let started = Started {
                    port: self.server.port()?,
                    protocol: self.server.protocol().unwrap_or(crate::capture::Protocol::Http),
                };
                to_value(&started)
            }
            Command::Stop => {
                self.server.stop().await?;
                Ok(Value::Null)
            }
            Command::AddRule { rule } => {
                let handle = self.server.add_rule(self.rule_definition(rule)).await?;
                to_value(&handle)
            }
            Command::RemoveRule { handle } => {
                Ok(Value::Bool(self.server.remove_rule(&handle).await?))
            }
            Command::Reset => {
                self.server.reset().await?;
                Ok(Value::Null)
            }
            Command::Subscribe {
                subscription_id,
                kind,
            } => {
                let subscriber = self.forwarding_subscriber(subscription_id.clone(), kind);
                let handle = self.server.on_with_id(subscription_id, subscriber);
                to_value(&handle)
            }
            Command::Unsubscribe { handle } => {
                Ok(Value::Bool(self.server.unsubscribe(&handle).await?))
            }
            Command::CallbackResult { .. } | Command::EventAck { .. } => Ok(Value::Null),
        }
    }

    /// A subscriber pushing every event to the client under `subscription_id`.
    ///
    /// Delivery completes once the client acknowledges the event, so the
    /// intercepted exchange is held until remote subscribers have seen it.
    fn forwarding_subscriber(
        self: &Arc<Self>,
        subscription_id: String,
        kind: EventKind,
    ) -> Subscriber {
        let session = Arc::downgrade(self);
        Subscriber::acked(kind, move |event| {
            forward_event(session.clone(), subscription_id.clone(), event)
        })
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs)
    }

    fn rule_definition(self: &Arc<Self>, rule: RuleData) -> RuleDefinition {
        let handler = match rule.handler {
            HandlerData::Reply { reply } => Handler::StaticReply(reply),
            HandlerData::Passthrough { options } => Handler::Passthrough(options),
            HandlerData::Callback { callback_id } => {
                // Weak: the session owns the server, which owns this rule.
                let session = Arc::downgrade(self);
                Handler::Callback(Callback::new(move |request| {
                    invoke_remote_callback(session.clone(), callback_id.clone(), request)
                }))
            }
        };
        RuleDefinition {
            matchers: rule.matchers,
            handler,
            times: rule.times,
        }
    }
}

/// Push `event` to the client and wait for its ack.
async fn forward_event(session: Weak<Session>, subscription_id: String, event: Event) {
    let Some(session) = session.upgrade() else {
        return;
    };
    let acks = Arc::clone(&session.pending_acks);
    let outbound = session.outbound.clone();
    let timeout = session.request_timeout();
    drop(session);

    let delivery_id = uuid::Uuid::new_v4().to_string();
    let event_id = event.id().to_string();
    let message = HostMessage::Event {
        subscription_id: subscription_id.clone(),
        delivery_id: delivery_id.clone(),
        event,
    };
    if let Err(e) = acks.exchange(delivery_id, message, &outbound, timeout).await {
        warn!(
            subscription = %subscription_id,
            event_id = %event_id,
            "Event was not acknowledged: {}", e
        );
    }
}

/// Ask the client to run callback `callback_id` and wait for its reply.
async fn invoke_remote_callback(
    session: Weak<Session>,
    callback_id: String,
    request: Arc<crate::capture::CompletedRequest>,
) -> anyhow::Result<crate::rules::Reply> {
    let session = session
        .upgrade()
        .ok_or_else(|| anyhow::anyhow!("control session has ended"))?;
    let callbacks = Arc::clone(&session.pending_callbacks);
    let outbound = session.outbound.clone();
    let timeout = session.request_timeout();
    drop(session);

    let invocation_id = uuid::Uuid::new_v4().to_string();
    let message = HostMessage::CallbackRequest {
        callback_id,
        invocation_id: invocation_id.clone(),
        request,
    };
    match callbacks.exchange(invocation_id, message, &outbound, timeout).await {
        Ok(CallbackOutcome::Reply(reply)) => Ok(reply),
        Ok(CallbackOutcome::Error(message)) => Err(anyhow::anyhow!(message)),
        Err(ExchangeError::TimedOut(secs)) => {
            Err(anyhow::anyhow!("remote callback timed out after {secs}s"))
        }
        Err(e) => Err(e.into()),
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, ServerError> {
    serde_json::to_value(value)
        .map_err(|e| ServerError::Remote(super::RemoteError::Protocol(e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exchange_resolves_waiter() {
        let waiters: Arc<Waiters<()>> = Waiters::new();
        let (outbound, mut sent) = mpsc::unbounded_channel();

        let exchange = {
            let waiters = Arc::clone(&waiters);
            tokio::spawn(async move {
                let message = HostMessage::Response {
                    id: 1,
                    result: Outcome::Ok(Value::Null),
                };
                waiters
                    .exchange("d-1".to_string(), message, &outbound, Duration::from_secs(5))
                    .await
            })
        };

        assert!(sent.recv().await.is_some());
        assert!(waiters.resolve("d-1", ()));
        assert!(exchange.await.unwrap().is_ok());
        assert_eq!(waiters.len(), 0);
        assert!(!waiters.resolve("d-1", ()));
    }

    #[tokio::test]
    async fn test_exchange_timeout_forgets_waiter() {
        let waiters: Arc<Waiters<CallbackOutcome>> = Waiters::new();
        let (outbound, _sent) = mpsc::unbounded_channel();
        let message = HostMessage::Response {
            id: 1,
            result: Outcome::Ok(Value::Null),
        };

        let result = waiters
            .exchange("inv".to_string(), message, &outbound, Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(ExchangeError::TimedOut(_))));
        assert_eq!(waiters.len(), 0);
    }

    #[tokio::test]
    async fn test_exchange_on_closed_connection_forgets_waiter() {
        let waiters: Arc<Waiters<CallbackOutcome>> = Waiters::new();
        let (outbound, sent) = mpsc::unbounded_channel();
        drop(sent);
        let message = HostMessage::Response {
            id: 1,
            result: Outcome::Ok(Value::Null),
        };

        let result = waiters
            .exchange("inv".to_string(), message, &outbound, Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(ExchangeError::Closed)));
        assert_eq!(waiters.len(), 0);
    }
}
