//! In-process publish/subscribe for captured traffic.
//!
//! `publish` returns only after every subscriber of the event's kind has
//! been called, and after every acknowledged subscriber's future has
//! resolved. A panicking subscriber is contained and reported on the
//! `snare::events` tracing target.

use crate::capture::{CompletedRequest, CompletedResponse};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Kind of traffic event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Request,
    Response,
}

/// A published traffic event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "lowercase")]
pub enum Event {
    Request(Arc<CompletedRequest>),
    Response(Arc<CompletedResponse>),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Request(_) => EventKind::Request,
            Event::Response(_) => EventKind::Response,
        }
    }

    /// Correlation id of the request/response pair this event belongs to.
    pub fn id(&self) -> &str {
        match self {
            Event::Request(r) => &r.id,
            Event::Response(r) => &r.id,
        }
    }
}

pub type RequestCallback = Arc<dyn Fn(Arc<CompletedRequest>) + Send + Sync>;
pub type ResponseCallback = Arc<dyn Fn(Arc<CompletedResponse>) + Send + Sync>;
pub type AckFuture = BoxFuture<'static, ()>;
pub type AckedCallback = Arc<dyn Fn(Event) -> AckFuture + Send + Sync>;

/// A callback registered for one event kind
#[derive(Clone)]
pub enum Subscriber {
    Request(RequestCallback),
    Response(ResponseCallback),
    /// Delivery completes when the returned future resolves, e.g. once a
    /// remote peer confirms receipt.
    Acked(EventKind, AckedCallback),
}

/// Result of handing an event to one subscriber
pub enum Delivery {
    /// Kinds differ
    Skipped,
    Done,
    Pending(AckFuture),
}

impl Subscriber {
    pub fn request(f: impl Fn(Arc<CompletedRequest>) + Send + Sync + 'static) -> Self {
        Subscriber::Request(Arc::new(f))
    }

    pub fn response(f: impl Fn(Arc<CompletedResponse>) + Send + Sync + 'static) -> Self {
        Subscriber::Response(Arc::new(f))
    }

    pub fn acked<F, Fut>(kind: EventKind, f: F) -> Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Subscriber::Acked(kind, Arc::new(move |event| -> AckFuture { Box::pin(f(event)) }))
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Subscriber::Request(_) => EventKind::Request,
            Subscriber::Response(_) => EventKind::Response,
            Subscriber::Acked(kind, _) => *kind,
        }
    }

    /// Invoke with `event` if kinds agree.
    pub fn deliver(&self, event: &Event) -> Delivery {
        match (self, event) {
            (Subscriber::Request(f), Event::Request(r)) => {
                f(Arc::clone(r));
                Delivery::Done
            }
            (Subscriber::Response(f), Event::Response(r)) => {
                f(Arc::clone(r));
                Delivery::Done
            }
            (Subscriber::Acked(kind, f), event) if *kind == event.kind() => {
                Delivery::Pending(f(event.clone()))
            }
            _ => Delivery::Skipped,
        }
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Subscriber({:?})", self.kind())
    }
}

/// Handle returned by a subscription, used to unsubscribe
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionHandle {
    pub id: String,
    pub kind: EventKind,
}

/// Subscriber registry and dispatcher
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<(String, Subscriber)>>,
    next_id: AtomicU64,
    failures: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: Subscriber) -> SubscriptionHandle {
        let id = format!("sub-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.subscribe_with_id(id, subscriber)
    }

    /// Register under a caller-chosen id (used by the standalone host so
    /// remote clients can route pushed events before the ack arrives).
    pub fn subscribe_with_id(&self, id: String, subscriber: Subscriber) -> SubscriptionHandle {
        let kind = subscriber.kind();
        self.subscribers.write().push((id.clone(), subscriber));
        SubscriptionHandle { id, kind }
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(id, _)| id != &handle.id);
        before != subscribers.len()
    }

    /// Drop every subscription.
    pub fn clear(&self) {
        self.subscribers.write().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Number of subscriber invocations that panicked.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Deliver `event` to every subscriber of its kind.
    ///
    /// The subscriber list is snapshotted first, so callbacks may subscribe
    /// or unsubscribe without deadlocking.
    pub async fn publish(&self, event: &Event) {
        let kind = event.kind();
        let targets: Vec<(String, Subscriber)> = self
            .subscribers
            .read()
            .iter()
            .filter(|(_, s)| s.kind() == kind)
            .cloned()
            .collect();

        let pending: Vec<(String, AckFuture)> = targets
            .into_iter()
            .filter_map(|(id, subscriber)| {
                self.deliver_isolated(&id, &subscriber, event)
                    .map(|ack| (id, ack))
            })
            .collect();
        join_all(
            pending
                .into_iter()
                .map(|(id, ack)| self.await_ack(id, ack, event)),
        )
        .await;
    }

    /// Deliver `event` to the single subscription `id`. Returns false when no
    /// such subscription exists.
    pub async fn publish_to(&self, id: &str, event: &Event) -> bool {
        let target = self
            .subscribers
            .read()
            .iter()
            .find(|(sub_id, _)| sub_id == id)
            .map(|(_, s)| s.clone());

        let Some(subscriber) = target else {
            return false;
        };
        if let Some(ack) = self.deliver_isolated(id, &subscriber, event) {
            self.await_ack(id.to_string(), ack, event).await;
        }
        true
    }

    fn deliver_isolated(
        &self,
        id: &str,
        subscriber: &Subscriber,
        event: &Event,
    ) -> Option<AckFuture> {
        match catch_unwind(AssertUnwindSafe(|| subscriber.deliver(event))) {
            Ok(Delivery::Pending(ack)) => Some(ack),
            Ok(_) => None,
            Err(_) => {
                self.record_failure(id, event);
                None
            }
        }
    }

    async fn await_ack(&self, id: String, ack: AckFuture, event: &Event) {
        if AssertUnwindSafe(ack).catch_unwind().await.is_err() {
            self.record_failure(&id, event);
        }
    }

    fn record_failure(&self, id: &str, event: &Event) {
        self.failures.fetch_add(1, Ordering::SeqCst);
        warn!(
            target: "snare::events",
            subscription = %id,
            event_id = %event.id(),
            "Subscriber panicked while handling {:?} event",
            event.kind()
        );
    }
}
