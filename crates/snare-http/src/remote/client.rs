//! RemoteClient - drives a mock server inside a [`StandaloneHost`](super::StandaloneHost).

use super::protocol::{
    encode_line, CallbackOutcome, ClientMessage, Command, HostMessage, Outcome, Started,
};
use super::RemoteError;
use crate::api::MockServer;
use crate::capture::{CompletedRequest, Protocol};
use crate::config::ServerConfig;
use crate::events::{EventBus, Subscriber, SubscriptionHandle};
use crate::rules::{Callback, Handler, HandlerData, RuleData, RuleDefinition, RuleHandle};
use crate::server::ServerError;
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

type PendingReply = oneshot::Sender<Result<Value, RemoteError>>;

struct Shared {
    pending: Mutex<HashMap<u64, PendingReply>>,
    callbacks: RwLock<HashMap<String, Callback>>,
    /// rule id -> callback id, so removing a rule drops its callback
    rule_callbacks: Mutex<HashMap<String, String>>,
    bus: EventBus,
    outbound: mpsc::UnboundedSender<String>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Shared {
    fn send(&self, command: Command) -> Result<u64, RemoteError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = encode_line(&ClientMessage { id, command })?;
        self.outbound
            .send(line)
            .map_err(|_| RemoteError::ConnectionClosed)?;
        Ok(id)
    }

    fn fail_pending(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for (_, waiter) in self.pending.lock().drain() {
            let _ = waiter.send(Err(RemoteError::ConnectionClosed));
        }
    }
}

/// A [`MockServer`] whose server runs in a standalone host process.
///
/// Rule callbacks run here, in the client; the host calls back over the
/// control connection for each matched request.
pub struct RemoteClient {
    shared: Arc<Shared>,
    started: RwLock<Option<Started>>,
    timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl RemoteClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, RemoteError> {
        Self::with_timeout(addr, DEFAULT_TIMEOUT).await
    }

    /// Connect with a per-command timeout.
    pub async fn with_timeout(
        addr: impl ToSocketAddrs,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, mut write_half) = stream.into_split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();

        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            callbacks: RwLock::new(HashMap::new()),
            rule_callbacks: Mutex::new(HashMap::new()),
            bus: EventBus::new(),
            outbound,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });

        let writer = tokio::spawn(async move {
            while let Some(line) = outbound_rx.recv().await {
                if let Err(e) = write_half.write_all(line.as_bytes()).await {
                    debug!("Control connection write failed: {}", e);
                    break;
                }
            }
        });

        let reader_shared = Arc::clone(&shared);
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => dispatch(&reader_shared, &line),
                    Ok(None) => break,
                    Err(e) => {
                        debug!("Control connection read failed: {}", e);
                        break;
                    }
                }
            }
            reader_shared.fail_pending();
        });

        Ok(Self {
            shared,
            started: RwLock::new(None),
            timeout,
            tasks: vec![writer, reader],
        })
    }

    async fn call(&self, command: Command) -> Result<Value, RemoteError> {
        let (tx, rx) = oneshot::channel();
        // Hold the pending lock across the send so a fast response cannot be
        // missed, and so a concurrent close either sees this entry or is seen.
        let id = {
            let mut pending = self.shared.pending.lock();
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(RemoteError::ConnectionClosed);
            }
            let id = self.shared.send(command)?;
            pending.insert(id, tx);
            id
        };

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RemoteError::ConnectionClosed),
            Err(_) => {
                self.shared.pending.lock().remove(&id);
                Err(RemoteError::Timeout)
            }
        }
    }

    async fn call_as<T: DeserializeOwned>(&self, command: Command) -> Result<T, RemoteError> {
        let value = self.call(command).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Start the remote server with the host's configured server defaults.
    pub async fn start_with_host_defaults(&self) -> Result<(), ServerError> {
        let started: Started = self.call_as(Command::Start { config: None }).await?;
        *self.started.write() = Some(started);
        Ok(())
    }

    /// Protocol the remote server was started with.
    pub fn protocol(&self) -> Option<Protocol> {
        self.started.read().as_ref().map(|s| s.protocol)
    }

    fn forget_callbacks(&self) {
        self.shared.callbacks.write().clear();
        self.shared.rule_callbacks.lock().clear();
    }
}

/// Route one line from the host.
fn dispatch(shared: &Arc<Shared>, line: &str) {
    let message: HostMessage = match serde_json::from_str(line) {
        Ok(message) => message,
        Err(e) => {
            warn!("Invalid message from host: {}", e);
            return;
        }
    };

    match message {
        HostMessage::Response { id, result } => {
            let Some(waiter) = shared.pending.lock().remove(&id) else {
                debug!(id, "Response for unknown or expired command");
                return;
            };
            let result = match result {
                Outcome::Ok(value) => Ok(value),
                Outcome::Err(message) => Err(RemoteError::Host { message }),
            };
            let _ = waiter.send(result);
        }
        HostMessage::Event {
            subscription_id,
            delivery_id,
            event,
        } => {
            let shared = Arc::clone(shared);
            tokio::spawn(async move {
                if !shared.bus.publish_to(&subscription_id, &event).await {
                    debug!(subscription = %subscription_id, "Event for unknown subscription");
                }
                // Acknowledge even unknown subscriptions so the host stops waiting.
                if let Err(e) = shared.send(Command::EventAck { delivery_id }) {
                    debug!("Could not acknowledge event: {}", e);
                }
            });
        }
        HostMessage::CallbackRequest {
            callback_id,
            invocation_id,
            request,
        } => {
            let callback = shared.callbacks.read().get(&callback_id).cloned();
            let shared = Arc::clone(shared);
            tokio::spawn(async move {
                let result = run_callback(callback, request).await;
                let command = Command::CallbackResult {
                    invocation_id,
                    result,
                };
                if let Err(e) = shared.send(command) {
                    debug!("Could not return callback result: {}", e);
                }
            });
        }
    }
}

async fn run_callback(
    callback: Option<Callback>,
    request: Arc<CompletedRequest>,
) -> CallbackOutcome {
    let Some(callback) = callback else {
        return CallbackOutcome::Error("callback is no longer registered".to_string());
    };
    match AssertUnwindSafe(callback.call(request)).catch_unwind().await {
        Ok(Ok(reply)) => CallbackOutcome::Reply(reply),
        Ok(Err(e)) => CallbackOutcome::Error(format!("{e:#}")),
        Err(_) => CallbackOutcome::Error("callback panicked".to_string()),
    }
}

#[async_trait]
impl MockServer for RemoteClient {
    async fn start(&self, config: ServerConfig) -> Result<(), ServerError> {
        let started: Started = self
            .call_as(Command::Start {
                config: Some(config),
            })
            .await?;
        *self.started.write() = Some(started);
        Ok(())
    }

    async fn stop(&self) -> Result<(), ServerError> {
        self.call(Command::Stop).await?;
        *self.started.write() = None;
        self.shared.bus.clear();
        self.forget_callbacks();
        Ok(())
    }

    fn port(&self) -> Result<u16, ServerError> {
        self.started
            .read()
            .as_ref()
            .map(|s| s.port)
            .ok_or(ServerError::NotRunning)
    }

    /// `http(s)://localhost:{port}{path}` on the host's machine.
    fn url_for(&self, path: &str) -> Result<String, ServerError> {
        let started = (*self.started.read()).ok_or(ServerError::NotRunning)?;
        Ok(format!(
            "{}://localhost:{}{}",
            started.protocol.as_str(),
            started.port,
            path
        ))
    }

    async fn add_rule(&self, rule: RuleDefinition) -> Result<RuleHandle, ServerError> {
        let mut callback_id = None;
        let handler = match rule.handler {
            Handler::StaticReply(reply) => HandlerData::Reply { reply },
            Handler::Passthrough(options) => HandlerData::Passthrough { options },
            Handler::Callback(callback) => {
                let id = uuid::Uuid::new_v4().to_string();
                self.shared.callbacks.write().insert(id.clone(), callback);
                callback_id = Some(id.clone());
                HandlerData::Callback { callback_id: id }
            }
        };
        let data = RuleData {
            matchers: rule.matchers,
            handler,
            times: rule.times,
        };

        match self.call_as::<RuleHandle>(Command::AddRule { rule: data }).await {
            Ok(handle) => {
                if let Some(callback_id) = callback_id {
                    self.shared
                        .rule_callbacks
                        .lock()
                        .insert(handle.id.clone(), callback_id);
                }
                Ok(handle)
            }
            Err(e) => {
                if let Some(callback_id) = callback_id {
                    self.shared.callbacks.write().remove(&callback_id);
                }
                Err(e.into())
            }
        }
    }

    async fn remove_rule(&self, handle: &RuleHandle) -> Result<bool, ServerError> {
        let removed: bool = self
            .call_as(Command::RemoveRule {
                handle: handle.clone(),
            })
            .await?;
        if let Some(callback_id) = self.shared.rule_callbacks.lock().remove(&handle.id) {
            self.shared.callbacks.write().remove(&callback_id);
        }
        Ok(removed)
    }

    async fn reset(&self) -> Result<(), ServerError> {
        self.call(Command::Reset).await?;
        self.forget_callbacks();
        Ok(())
    }

    async fn on(&self, subscriber: Subscriber) -> Result<SubscriptionHandle, ServerError> {
        let subscription_id = uuid::Uuid::new_v4().to_string();
        let kind = subscriber.kind();
        // Subscribe locally first so events pushed before the ack are delivered.
        let handle = self
            .shared
            .bus
            .subscribe_with_id(subscription_id.clone(), subscriber);

        let result = self
            .call_as::<SubscriptionHandle>(Command::Subscribe {
                subscription_id,
                kind,
            })
            .await;
        match result {
            Ok(_) => Ok(handle),
            Err(e) => {
                self.shared.bus.unsubscribe(&handle);
                Err(e.into())
            }
        }
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<bool, ServerError> {
        let local = self.shared.bus.unsubscribe(handle);
        let remote: bool = self
            .call_as(Command::Unsubscribe {
                handle: handle.clone(),
            })
            .await?;
        Ok(local || remote)
    }
}

impl Drop for RemoteClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
