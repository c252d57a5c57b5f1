#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Publish/subscribe and request/response capabilities shared by guidance components.
//!
//! Components only see the [`PubSubService`] trait; the in-process [`MemoryPubSub`]
//! stands in for the real messaging substrate in tests and replay runs. Channels are
//! opaque names. Delivery within one topic follows publish order; nothing is promised
//! across topics.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Default wait applied by [`PubSubService::call_service`].
pub const DEFAULT_SERVICE_TIMEOUT: Duration = Duration::from_millis(500);

/// Errors surfaced by the capability layer.
#[derive(Debug, Error)]
pub enum PubSubError {
    /// The service did not answer within the allowed wait.
    #[error("service `{service}` timed out after {after:?}")]
    TransportTimeout {
        /// Service name.
        service: String,
        /// Wait that expired.
        after: Duration,
    },
    /// Nothing is advertised under the requested name.
    #[error("no service advertised as `{0}`")]
    ServiceUnavailable(String),
    /// The service handler answered with an error.
    #[error("service `{service}` failed: {reason}")]
    ServiceFailed {
        /// Service name.
        service: String,
        /// Handler supplied reason.
        reason: String,
    },
    /// A handler is already bound to the name.
    #[error("service `{0}` is already advertised")]
    ServiceAlreadyAdvertised(String),
    /// Payload could not be converted to or from JSON.
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Message delivered on a topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique identifier.
    pub id: Uuid,
    /// Bus-wide publish sequence.
    pub seq: u64,
    /// Topic the message was published on.
    pub topic: String,
    /// Publish time.
    pub timestamp: DateTime<Utc>,
    /// Opaque JSON payload.
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Decodes the payload into a typed message.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, PubSubError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Callback invoked for every message on a subscribed topic.
pub type MessageCallback = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Request/response handler bound to a service name.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    /// Handles one request.
    async fn handle(&self, request: Value) -> Result<Value, String>;
}

/// Transport-independent messaging surface.
#[async_trait]
pub trait PubSubService: Send + Sync {
    /// Publishes a payload on a topic.
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), PubSubError>;

    /// Registers a callback for every future message on `topic`.
    async fn subscribe(
        &self,
        topic: &str,
        handler: MessageCallback,
    ) -> Result<Subscription, PubSubError>;

    /// Returns a raw receiver for pull-style consumers.
    async fn subscribe_channel(
        &self,
        topic: &str,
    ) -> Result<broadcast::Receiver<Envelope>, PubSubError>;

    /// Binds a handler to a service name.
    async fn advertise_service(
        &self,
        name: &str,
        handler: Arc<dyn ServiceHandler>,
    ) -> Result<(), PubSubError>;

    /// Calls a service, failing with [`PubSubError::TransportTimeout`] once `timeout` expires.
    async fn call_service_with_timeout(
        &self,
        name: &str,
        request: Value,
        timeout: Duration,
    ) -> Result<Value, PubSubError>;

    /// Calls a service with the transport's default timeout.
    async fn call_service(&self, name: &str, request: Value) -> Result<Value, PubSubError> {
        self.call_service_with_timeout(name, request, DEFAULT_SERVICE_TIMEOUT)
            .await
    }
}

/// Serializes `value` and publishes it on `topic`.
pub async fn publish_json<T>(
    bus: &dyn PubSubService,
    topic: &str,
    value: &T,
) -> Result<(), PubSubError>
where
    T: Serialize + Sync + ?Sized,
{
    let payload = serde_json::to_value(value)?;
    bus.publish(topic, payload).await
}

/// Live callback subscription.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Topic this subscription listens on.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Whether the delivery task is still running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stops delivery to the callback. Dropping the subscription does the same.
    pub fn unsubscribe(self) {
        self.task.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// In-process bus backed by one broadcast channel per topic.
#[derive(Clone)]
pub struct MemoryPubSub {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    capacity: usize,
    backlog_limit: usize,
    service_timeout: Duration,
    seq: AtomicU64,
    topics: Mutex<HashMap<String, broadcast::Sender<Envelope>>>,
    backlog: Mutex<VecDeque<Envelope>>,
    services: RwLock<HashMap<String, Arc<dyn ServiceHandler>>>,
}

impl fmt::Debug for MemoryPubSub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPubSub")
            .field("capacity", &self.inner.capacity)
            .field("topics", &self.inner.topics.lock().len())
            .field("services", &self.inner.services.read().len())
            .finish()
    }
}

impl MemoryPubSub {
    /// Creates a bus whose topics buffer up to `capacity` messages per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::with_settings(capacity, 64, DEFAULT_SERVICE_TIMEOUT)
    }

    /// Creates a bus with explicit backlog size and default service timeout.
    #[must_use]
    pub fn with_settings(capacity: usize, backlog: usize, service_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                capacity: capacity.max(1),
                backlog_limit: backlog,
                service_timeout,
                seq: AtomicU64::new(0),
                topics: Mutex::new(HashMap::new()),
                backlog: Mutex::new(VecDeque::with_capacity(backlog)),
                services: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Recent messages across all topics, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Envelope> {
        self.inner.backlog.lock().iter().cloned().collect()
    }

    /// Recent messages on one topic, oldest first.
    #[must_use]
    pub fn snapshot_topic(&self, topic: &str) -> Vec<Envelope> {
        self.inner
            .backlog
            .lock()
            .iter()
            .filter(|envelope| envelope.topic == topic)
            .cloned()
            .collect()
    }

    /// Removes a service binding, returning whether one existed.
    pub fn withdraw_service(&self, name: &str) -> bool {
        self.inner.services.write().remove(name).is_some()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Envelope> {
        self.inner
            .topics
            .lock()
            .entry(topic.to_owned())
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
            .clone()
    }

    fn remember(&self, envelope: &Envelope) {
        if self.inner.backlog_limit == 0 {
            return;
        }
        let mut backlog = self.inner.backlog.lock();
        if backlog.len() == self.inner.backlog_limit {
            backlog.pop_front();
        }
        backlog.push_back(envelope.clone());
    }
}

#[async_trait]
impl PubSubService for MemoryPubSub {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), PubSubError> {
        let envelope = Envelope {
            id: Uuid::new_v4(),
            seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
            topic: topic.to_owned(),
            timestamp: Utc::now(),
            payload,
        };
        self.remember(&envelope);
        trace!(topic, seq = envelope.seq, "publish");
        // No receivers is not an error: the topic simply has no listeners yet.
        let _ = self.sender(topic).send(envelope);
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: MessageCallback,
    ) -> Result<Subscription, PubSubError> {
        let mut receiver = self.sender(topic).subscribe();
        let name = topic.to_owned();
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(envelope) => handler(envelope),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(topic = %name, skipped, "subscriber lagged; messages dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        debug!(topic, "subscription started");
        Ok(Subscription {
            topic: topic.to_owned(),
            task,
        })
    }

    async fn subscribe_channel(
        &self,
        topic: &str,
    ) -> Result<broadcast::Receiver<Envelope>, PubSubError> {
        Ok(self.sender(topic).subscribe())
    }

    async fn advertise_service(
        &self,
        name: &str,
        handler: Arc<dyn ServiceHandler>,
    ) -> Result<(), PubSubError> {
        let mut services = self.inner.services.write();
        if services.contains_key(name) {
            return Err(PubSubError::ServiceAlreadyAdvertised(name.to_owned()));
        }
        services.insert(name.to_owned(), handler);
        debug!(service = name, "service advertised");
        Ok(())
    }

    async fn call_service_with_timeout(
        &self,
        name: &str,
        request: Value,
        timeout: Duration,
    ) -> Result<Value, PubSubError> {
        let handler = self.inner.services.read().get(name).cloned();
        let Some(handler) = handler else {
            return Err(PubSubError::ServiceUnavailable(name.to_owned()));
        };
        match tokio::time::timeout(timeout, handler.handle(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(reason)) => Err(PubSubError::ServiceFailed {
                service: name.to_owned(),
                reason,
            }),
            Err(_) => {
                warn!(service = name, ?timeout, "service call timed out");
                Err(PubSubError::TransportTimeout {
                    service: name.to_owned(),
                    after: timeout,
                })
            }
        }
    }

    async fn call_service(&self, name: &str, request: Value) -> Result<Value, PubSubError> {
        self.call_service_with_timeout(name, request, self.inner.service_timeout)
            .await
    }
}
