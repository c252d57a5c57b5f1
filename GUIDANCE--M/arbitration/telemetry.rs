use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared_logging::{JsonLogger, LogLevel, LogRecord, LogSink};
use shared_pubsub::PubSubService;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::{
    arbitration::decision::RejectionReason,
    plugin::{FaultCause, PluginIdentity, PluginState},
};

/// Structured observability record emitted by the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GuidanceEvent {
    /// A plugin was faulted.
    PluginFault {
        /// Faulted plugin.
        plugin: PluginIdentity,
        /// Reason code.
        cause: FaultCause,
        /// Cycle during or after which the fault was reported.
        cycle: u64,
    },
    /// A plugin's proposal (or its absence) lost arbitration.
    ProposalRejected {
        /// Rejected plugin.
        plugin: PluginIdentity,
        /// Reason code.
        reason: RejectionReason,
        /// Human readable explanation.
        detail: String,
        /// Cycle index.
        cycle: u64,
    },
    /// No usable proposal; the fail-safe decision was issued.
    FailSafeIssued {
        /// Cycle index.
        cycle: u64,
        /// Plugins solicited this cycle.
        solicited: usize,
    },
    /// A cycle outlasted its period and later ticks were merged into it.
    CycleOverrun {
        /// Cycle index.
        cycle: u64,
        /// Ticks skipped because of the overrun.
        skipped_ticks: u64,
    },
    /// A lifecycle state change was applied.
    LifecycleTransition {
        /// Plugin whose state changed.
        plugin: PluginIdentity,
        /// Previous state.
        from: PluginState,
        /// New state.
        to: PluginState,
        /// Cycle reference at the time of the change.
        cycle: u64,
        /// Whether the change waited for a cycle boundary.
        deferred: bool,
    },
}

impl GuidanceEvent {
    /// Dotted event name used for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::PluginFault { .. } => "plugin.fault",
            Self::ProposalRejected { .. } => "proposal.rejected",
            Self::FailSafeIssued { .. } => "arbitration.fail_safe",
            Self::CycleOverrun { .. } => "cycle.overrun",
            Self::LifecycleTransition { .. } => "plugin.transition",
        }
    }

    /// Severity used when the event is logged.
    #[must_use]
    pub const fn level(&self) -> LogLevel {
        match self {
            Self::PluginFault { .. } | Self::FailSafeIssued { .. } | Self::CycleOverrun { .. } => {
                LogLevel::Warn
            }
            Self::LifecycleTransition { .. } => LogLevel::Info,
            Self::ProposalRejected { .. } => LogLevel::Debug,
        }
    }

    /// Cycle index carried by the event.
    #[must_use]
    pub const fn cycle(&self) -> u64 {
        match self {
            Self::PluginFault { cycle, .. }
            | Self::ProposalRejected { cycle, .. }
            | Self::FailSafeIssued { cycle, .. }
            | Self::CycleOverrun { cycle, .. }
            | Self::LifecycleTransition { cycle, .. } => *cycle,
        }
    }
}

/// Builder for [`GuidanceTelemetry`].
pub struct GuidanceTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    log_sink: Option<Arc<dyn LogSink>>,
    events: Option<(Arc<dyn PubSubService>, String)>,
}

impl GuidanceTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            log_sink: None,
            events: None,
        }
    }

    /// Writes records as JSON lines to `path`.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Sends records to a custom sink. Takes precedence over [`Self::log_path`].
    #[must_use]
    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    /// Publishes events on `topic`.
    #[must_use]
    pub fn event_topic(mut self, publisher: Arc<dyn PubSubService>, topic: impl Into<String>) -> Self {
        self.events = Some((publisher, topic.into()));
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<GuidanceTelemetry> {
        let sink = match (self.log_sink, self.log_path) {
            (Some(sink), _) => Some(sink),
            (None, Some(path)) => Some(Arc::new(JsonLogger::new(path)?) as Arc<dyn LogSink>),
            (None, None) => None,
        };
        Ok(GuidanceTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                sink,
                events: self
                    .events
                    .map(|(publisher, topic)| EventHandle { publisher, topic }),
            }),
        })
    }
}

/// Telemetry handle shared by the registry, arbitrator and scheduler.
#[derive(Clone)]
pub struct GuidanceTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for GuidanceTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuidanceTelemetry")
            .field("module", &self.inner.module)
            .field("sink", &self.inner.sink.is_some())
            .field(
                "events_topic",
                &self.inner.events.as_ref().map(|handle| &handle.topic),
            )
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    sink: Option<Arc<dyn LogSink>>,
    events: Option<EventHandle>,
}

struct EventHandle {
    publisher: Arc<dyn PubSubService>,
    topic: String,
}

impl EventHandle {
    fn publish(&self, payload: Value) {
        let publisher = Arc::clone(&self.publisher);
        let topic = self.topic.clone();
        if let Ok(handle) = Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = publisher.publish(&topic, payload).await {
                    warn!(%topic, %err, "telemetry event publish failed");
                }
            });
        } else if let Err(err) = futures::executor::block_on(publisher.publish(&topic, payload)) {
            warn!(%topic, %err, "telemetry event publish failed");
        }
    }
}

impl GuidanceTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> GuidanceTelemetryBuilder {
        GuidanceTelemetryBuilder::new(module)
    }

    /// Writes a free-form record to the sink. Failures are logged, never returned.
    pub fn log(&self, level: LogLevel, message: &str, cycle: Option<u64>, metadata: Value) {
        if let Some(sink) = &self.inner.sink {
            let mut record = LogRecord::new(&self.inner.module, level, message).with_metadata(metadata);
            record.cycle = cycle;
            if let Err(err) = sink.log(&record) {
                warn!(%err, message, "telemetry log write failed");
            }
        }
    }

    /// Fans an event out to tracing, the log sink and the events topic.
    pub fn emit(&self, event: &GuidanceEvent) {
        let payload = match serde_json::to_value(event) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%err, "unserializable telemetry event");
                return;
            }
        };
        match event.level() {
            LogLevel::Error | LogLevel::Warn => {
                warn!(module = %self.inner.module, event = event.name(), cycle = event.cycle(), %payload);
            }
            LogLevel::Info => {
                info!(module = %self.inner.module, event = event.name(), cycle = event.cycle(), %payload);
            }
            LogLevel::Debug => {
                debug!(module = %self.inner.module, event = event.name(), cycle = event.cycle(), %payload);
            }
        }
        self.log(event.level(), event.name(), Some(event.cycle()), payload.clone());
        if let Some(handle) = &self.inner.events {
            handle.publish(payload);
        }
    }
}
