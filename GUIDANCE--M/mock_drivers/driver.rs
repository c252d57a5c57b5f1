use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared_pubsub::PubSubError;
use thiserror::Error;
use tokio::{
    sync::watch,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info};

/// Failures raised while replaying.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The capability layer refused an operation.
    #[error(transparent)]
    Transport(#[from] PubSubError),
    /// Nothing to replay.
    #[error("no samples to replay")]
    NoSamples,
}

/// One recorded row: sample id, message type and raw hex bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaySample {
    /// Sequence number stamped on the published header.
    pub sample_id: u32,
    /// Message type label, e.g. `BSM`.
    pub message_type: String,
    /// Loosely formatted hex bytes.
    pub raw: String,
}

impl ReplaySample {
    /// Creates a sample.
    #[must_use]
    pub fn new(sample_id: u32, message_type: impl Into<String>, raw: impl Into<String>) -> Self {
        Self {
            sample_id,
            message_type: message_type.into(),
            raw: raw.into(),
        }
    }
}

/// Simulated hardware driver publishing through the capability layer.
#[async_trait]
pub trait MockDriver: Send + Sync {
    /// Driver categories this mock stands in for.
    fn driver_types(&self) -> Vec<String>;

    /// Channel names the driver exposes.
    fn driver_api(&self) -> Vec<String>;

    /// Delay between consecutive samples.
    fn publish_delay(&self) -> Duration;

    /// Publishes a batch of samples, returning how many messages went out.
    async fn publish_samples(&self, samples: &[ReplaySample]) -> Result<usize, DriverError>;

    /// Replays `samples` in a loop, one per [`MockDriver::publish_delay`], until
    /// `shutdown` flips to `true` or its sender is dropped. Returns the messages published.
    async fn run(
        &self,
        samples: Vec<ReplaySample>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<u64, DriverError> {
        if samples.is_empty() {
            return Err(DriverError::NoSamples);
        }
        let mut ticker = interval(self.publish_delay());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut published = 0_u64;
        info!(types = ?self.driver_types(), samples = samples.len(), "replay started");
        let mut replay = samples.iter().cycle();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }
            let Some(sample) = replay.next() else {
                break;
            };
            let sent = self.publish_samples(std::slice::from_ref(sample)).await?;
            published += u64::try_from(sent).unwrap_or(u64::MAX);
        }
        debug!(published, "replay stopped");
        Ok(published)
    }
}
