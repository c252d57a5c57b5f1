//! Replays DSRC comms traffic as an on-board radio driver would publish it.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared_pubsub::{publish_json, Envelope, PubSubService, ServiceHandler, Subscription};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    driver::{DriverError, MockDriver, ReplaySample},
    payload::{decode_hex_payload, STATIC_BSM_PAYLOADS},
};

const INBOUND_TOPIC: &str = "comms/inbound_binary_msg";
const OUTBOUND_TOPIC: &str = "comms/outbound_binary_msg";
const SEND_SERVICE: &str = "comms/send";

/// Where published bytes come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadMode {
    /// Rotate through the recorded BSMs, one per simulated vehicle.
    #[default]
    StaticVehicles,
    /// Publish each sample's own bytes.
    Recorded,
}

/// Driver settings, read from the `[mock_driver]` config section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DsrcSettings {
    /// Prefix for every channel name.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Simulated vehicles sharing the publish period.
    #[serde(default = "default_vehicle_count")]
    pub vehicle_count: u32,
    /// Time between two messages from the same vehicle.
    #[serde(default = "default_publish_period_ms")]
    pub publish_period_ms: u64,
    /// Half period of the first vehicle's on/off pattern.
    #[serde(default = "default_pause_length_ms")]
    pub pause_length_ms: u64,
    /// Payload source.
    #[serde(default)]
    pub payload_mode: PayloadMode,
}

impl Default for DsrcSettings {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            vehicle_count: default_vehicle_count(),
            publish_period_ms: default_publish_period_ms(),
            pause_length_ms: default_pause_length_ms(),
            payload_mode: PayloadMode::default(),
        }
    }
}

impl DsrcSettings {
    fn channel(&self, name: &str) -> String {
        if self.namespace.is_empty() {
            name.to_string()
        } else {
            format!("{}/{name}", self.namespace.trim_end_matches('/'))
        }
    }
}

fn default_namespace() -> String {
    "mock_driver".into()
}

const fn default_vehicle_count() -> u32 {
    3
}

const fn default_publish_period_ms() -> u64 {
    1000
}

const fn default_pause_length_ms() -> u64 {
    4000
}

/// Header stamped on every inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Radio frame id.
    pub frame_id: String,
    /// Sample sequence number.
    pub seq: u32,
    /// Publication time.
    pub stamp: DateTime<Utc>,
}

/// Raw comms message as received over the air.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryMessage {
    /// Message header.
    pub header: MessageHeader,
    /// Message type label, e.g. `BSM`.
    pub message_type: String,
    /// Payload bytes, hex encoded on the wire.
    #[serde(with = "hex::serde")]
    pub content: Vec<u8>,
}

struct SendHandler {
    service: String,
}

#[async_trait]
impl ServiceHandler for SendHandler {
    async fn handle(&self, request: Value) -> Result<Value, String> {
        info!(service = %self.service, %request, "send request received");
        Ok(json!({ "accepted": true }))
    }
}

/// Mock DSRC radio: publishes inbound BSMs, listens to outbound traffic and
/// acknowledges send requests.
pub struct DsrcReplayDriver {
    settings: DsrcSettings,
    pubsub: Arc<dyn PubSubService>,
    started: Instant,
    next_vehicle: AtomicUsize,
    published: AtomicU64,
    outbound: Mutex<Option<Subscription>>,
}

impl fmt::Debug for DsrcReplayDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DsrcReplayDriver")
            .field("settings", &self.settings)
            .field("published", &self.published.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl DsrcReplayDriver {
    /// Subscribes to outbound traffic and advertises the send service.
    pub async fn start(
        settings: DsrcSettings,
        pubsub: Arc<dyn PubSubService>,
    ) -> Result<Self, DriverError> {
        let outbound_topic = settings.channel(OUTBOUND_TOPIC);
        let listener = outbound_topic.clone();
        let subscription = pubsub
            .subscribe(
                &outbound_topic,
                Arc::new(move |envelope: Envelope| {
                    let kind = envelope
                        .payload
                        .get("message_type")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string();
                    debug!(topic = %listener, message_type = %kind, "outbound message received");
                }),
            )
            .await?;
        let service = settings.channel(SEND_SERVICE);
        pubsub
            .advertise_service(&service, Arc::new(SendHandler { service: service.clone() }))
            .await?;
        info!(namespace = %settings.namespace, vehicles = settings.vehicle_count, "dsrc mock driver started");
        Ok(Self {
            settings,
            pubsub,
            started: Instant::now(),
            next_vehicle: AtomicUsize::new(0),
            published: AtomicU64::new(0),
            outbound: Mutex::new(Some(subscription)),
        })
    }

    /// Topic inbound messages are published on.
    #[must_use]
    pub fn inbound_topic(&self) -> String {
        self.settings.channel(INBOUND_TOPIC)
    }

    /// Topic the driver listens to for outbound messages.
    #[must_use]
    pub fn outbound_topic(&self) -> String {
        self.settings.channel(OUTBOUND_TOPIC)
    }

    /// Service acknowledging send requests.
    #[must_use]
    pub fn send_service(&self) -> String {
        self.settings.channel(SEND_SERVICE)
    }

    /// Messages published so far.
    #[must_use]
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Stops listening to outbound traffic.
    pub fn stop(&self) {
        if let Some(subscription) = self.outbound.lock().take() {
            subscription.unsubscribe();
        }
    }

    /// Whether the first vehicle is currently transmitting.
    fn pause_window_open(&self) -> bool {
        let pause = self.settings.pause_length_ms.max(1);
        let elapsed = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        elapsed % (pause * 2) < pause
    }

    fn payload_for<'a>(&self, sample: &'a ReplaySample) -> (&'a str, bool) {
        match self.settings.payload_mode {
            PayloadMode::Recorded => (sample.raw.as_str(), false),
            PayloadMode::StaticVehicles => {
                let vehicles = usize::try_from(self.settings.vehicle_count)
                    .unwrap_or(STATIC_BSM_PAYLOADS.len())
                    .clamp(1, STATIC_BSM_PAYLOADS.len());
                let vehicle = self.next_vehicle.fetch_add(1, Ordering::Relaxed) % vehicles;
                (STATIC_BSM_PAYLOADS[vehicle], vehicle == 0)
            }
        }
    }
}

#[async_trait]
impl MockDriver for DsrcReplayDriver {
    fn driver_types(&self) -> Vec<String> {
        vec!["comms".into()]
    }

    fn driver_api(&self) -> Vec<String> {
        vec![self.inbound_topic(), self.outbound_topic(), self.send_service()]
    }

    fn publish_delay(&self) -> Duration {
        let per_vehicle =
            self.settings.publish_period_ms / u64::from(self.settings.vehicle_count.max(1));
        Duration::from_millis(per_vehicle.max(1))
    }

    async fn publish_samples(&self, samples: &[ReplaySample]) -> Result<usize, DriverError> {
        let topic = self.inbound_topic();
        let mut sent = 0;
        for sample in samples {
            let (raw, pause_controlled) = self.payload_for(sample);
            let content = match decode_hex_payload(raw) {
                Ok(content) => content,
                Err(err) => {
                    warn!(sample = sample.sample_id, %err, "undecodable payload skipped");
                    continue;
                }
            };
            if pause_controlled && !self.pause_window_open() {
                debug!(sample = sample.sample_id, "paused vehicle stays silent");
                continue;
            }
            let message = BinaryMessage {
                header: MessageHeader {
                    frame_id: "0".into(),
                    seq: sample.sample_id,
                    stamp: Utc::now(),
                },
                message_type: sample.message_type.clone(),
                content,
            };
            publish_json(self.pubsub.as_ref(), &topic, &message).await?;
            self.published.fetch_add(1, Ordering::Relaxed);
            sent += 1;
        }
        Ok(sent)
    }
}
