use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::GuidanceError;

/// Complete configuration for one guidance node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuidanceConfig {
    /// Cycle timing and decision publication.
    #[serde(default)]
    pub arbitration: ArbitrationConfig,
    /// In-process transport sizing.
    #[serde(default)]
    pub pubsub: PubSubConfig,
    /// Structured logging and event publication.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl GuidanceConfig {
    /// Loads and validates a TOML file. Relative paths resolve against its directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading guidance config {}", path.display()))?;
        let base_dir = path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Self::from_toml_str(&raw, &base_dir).with_context(|| format!("loading {}", path.display()))
    }

    /// Parses and validates TOML text, resolving relative paths against `base_dir`.
    pub fn from_toml_str(raw: &str, base_dir: &Path) -> Result<Self> {
        let mut config: Self = toml::from_str(raw).context("parsing guidance config")?;
        if let Some(log_path) = config.telemetry.log_path.as_mut() {
            if log_path.is_relative() {
                *log_path = base_dir.join(&*log_path);
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Checks every section.
    pub fn validate(&self) -> Result<()> {
        self.arbitration.validate()?;
        if self.pubsub.channel_capacity == 0 {
            bail!("pubsub.channel_capacity must be greater than zero");
        }
        if self.pubsub.service_timeout_ms == 0 {
            bail!("pubsub.service_timeout_ms must be greater than zero");
        }
        if self.telemetry.module.trim().is_empty() {
            bail!("telemetry.module must not be empty");
        }
        if matches!(&self.telemetry.events_topic, Some(topic) if topic.trim().is_empty()) {
            bail!("telemetry.events_topic must not be empty when set");
        }
        Ok(())
    }
}

/// Cycle timing and miss policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArbitrationConfig {
    /// Fixed control cycle period.
    #[serde(default = "default_cycle_period_ms")]
    pub cycle_period_ms: u64,
    /// Time each plugin gets to answer a solicitation.
    #[serde(default = "default_proposal_timeout_ms")]
    pub proposal_timeout_ms: u64,
    /// Consecutive misses that fault a plugin.
    #[serde(default = "default_miss_threshold")]
    pub miss_threshold: u32,
    /// Topic decisions are published on.
    #[serde(default = "default_decision_topic")]
    pub decision_topic: String,
}

impl Default for ArbitrationConfig {
    fn default() -> Self {
        Self {
            cycle_period_ms: default_cycle_period_ms(),
            proposal_timeout_ms: default_proposal_timeout_ms(),
            miss_threshold: default_miss_threshold(),
            decision_topic: default_decision_topic(),
        }
    }
}

impl ArbitrationConfig {
    /// Control cycle period.
    #[must_use]
    pub const fn cycle_period(&self) -> Duration {
        Duration::from_millis(self.cycle_period_ms)
    }

    /// Per-plugin proposal deadline.
    #[must_use]
    pub const fn proposal_timeout(&self) -> Duration {
        Duration::from_millis(self.proposal_timeout_ms)
    }

    /// Rejects timings that would let a cycle wait forever or outlast its period.
    pub fn validate(&self) -> Result<(), GuidanceError> {
        if self.cycle_period_ms == 0 {
            return Err(GuidanceError::Config(
                "arbitration.cycle_period_ms must be greater than zero".into(),
            ));
        }
        if self.proposal_timeout_ms == 0 {
            return Err(GuidanceError::Config(
                "arbitration.proposal_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.proposal_timeout_ms >= self.cycle_period_ms {
            return Err(GuidanceError::Config(format!(
                "arbitration.proposal_timeout_ms ({}) must be shorter than cycle_period_ms ({})",
                self.proposal_timeout_ms, self.cycle_period_ms
            )));
        }
        if self.miss_threshold == 0 {
            return Err(GuidanceError::Config(
                "arbitration.miss_threshold must be at least 1".into(),
            ));
        }
        if self.decision_topic.trim().is_empty() {
            return Err(GuidanceError::Config(
                "arbitration.decision_topic must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Sizing for the in-process transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubSubConfig {
    /// Per-topic broadcast capacity.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Messages retained for inspection.
    #[serde(default = "default_backlog")]
    pub backlog: usize,
    /// Default `call_service` timeout.
    #[serde(default = "default_service_timeout_ms")]
    pub service_timeout_ms: u64,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            backlog: default_backlog(),
            service_timeout_ms: default_service_timeout_ms(),
        }
    }
}

impl PubSubConfig {
    /// Default `call_service` timeout.
    #[must_use]
    pub const fn service_timeout(&self) -> Duration {
        Duration::from_millis(self.service_timeout_ms)
    }
}

/// Where structured records go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Module name stamped on every record.
    #[serde(default = "default_module")]
    pub module: String,
    /// JSON-lines log file.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// Topic fault, rejection and overrun events are published on.
    #[serde(default = "default_events_topic")]
    pub events_topic: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            module: default_module(),
            log_path: None,
            events_topic: default_events_topic(),
        }
    }
}

const fn default_cycle_period_ms() -> u64 {
    100
}

const fn default_proposal_timeout_ms() -> u64 {
    40
}

const fn default_miss_threshold() -> u32 {
    3
}

fn default_decision_topic() -> String {
    "guidance/arbitration/decision".into()
}

const fn default_channel_capacity() -> usize {
    256
}

const fn default_backlog() -> usize {
    64
}

const fn default_service_timeout_ms() -> u64 {
    500
}

fn default_module() -> String {
    "guidance.arbitration".into()
}

#[allow(clippy::unnecessary_wraps)]
fn default_events_topic() -> Option<String> {
    Some("guidance/events".into())
}
