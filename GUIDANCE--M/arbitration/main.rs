//! Runtime entrypoints wiring the transport, registry, arbitrator and scheduler.

use std::{fmt, sync::Arc};

use anyhow::{Context, Result};
use shared_pubsub::{MemoryPubSub, PubSubService};
use tracing::info;

use crate::{
    arbitration::{decision::ArbitrationDecision, Arbitrator},
    config::GuidanceConfig,
    cycle::{maker::CycleSchedulerBuilder, CycleScheduler, SchedulerHandle},
    error::GuidanceError,
    locator::{GuidancePlatform, PluginServiceLocator},
    plugin::{
        registry::{PluginRegistry, PluginStatus},
        FaultCause, GuidancePlugin, PluginDescriptor, PluginId,
    },
    telemetry::GuidanceTelemetry,
};

/// Fully wired guidance core ready to arbitrate.
#[derive(Clone)]
pub struct GuidanceRuntime {
    config: GuidanceConfig,
    pubsub: Arc<dyn PubSubService>,
    telemetry: GuidanceTelemetry,
    platform: GuidancePlatform,
}

impl fmt::Debug for GuidanceRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuidanceRuntime")
            .field("config", &self.config)
            .field("telemetry", &self.telemetry)
            .field("platform", &self.platform)
            .finish_non_exhaustive()
    }
}

impl GuidanceRuntime {
    /// Bootstraps the runtime on the in-process transport.
    pub fn bootstrap(config: GuidanceConfig) -> Result<Self> {
        let bus = MemoryPubSub::with_settings(
            config.pubsub.channel_capacity,
            config.pubsub.backlog,
            config.pubsub.service_timeout(),
        );
        Self::bootstrap_with_transport(config, Arc::new(bus))
    }

    /// Bootstraps the runtime on a caller supplied transport.
    pub fn bootstrap_with_transport(
        config: GuidanceConfig,
        pubsub: Arc<dyn PubSubService>,
    ) -> Result<Self> {
        config.validate()?;

        let mut telemetry = GuidanceTelemetry::builder(config.telemetry.module.clone());
        if let Some(path) = &config.telemetry.log_path {
            telemetry = telemetry.log_path(path);
        }
        if let Some(topic) = &config.telemetry.events_topic {
            telemetry = telemetry.event_topic(Arc::clone(&pubsub), topic.clone());
        }
        let telemetry = telemetry.build().context("building guidance telemetry")?;

        let registry = Arc::new(PluginRegistry::new().with_telemetry(telemetry.clone()));
        let arbitrator = Arc::new(
            Arbitrator::new(
                Arc::clone(&registry),
                Arc::clone(&pubsub),
                config.arbitration.clone(),
            )?
            .with_telemetry(telemetry.clone()),
        );
        let platform = GuidancePlatform::new(registry, arbitrator, Arc::clone(&pubsub));
        info!(
            period_ms = config.arbitration.cycle_period_ms,
            timeout_ms = config.arbitration.proposal_timeout_ms,
            miss_threshold = config.arbitration.miss_threshold,
            "guidance runtime ready"
        );

        Ok(Self {
            config,
            pubsub,
            telemetry,
            platform,
        })
    }

    /// Builds a plugin from its locator and registers it.
    pub fn install_plugin<P, F>(
        &self,
        descriptor: PluginDescriptor,
        factory: F,
    ) -> Result<PluginId, GuidanceError>
    where
        P: GuidancePlugin + 'static,
        F: FnOnce(PluginServiceLocator) -> P,
    {
        self.platform.install(descriptor, factory)
    }

    /// Requests activation of a plugin.
    pub fn activate(&self, id: PluginId) -> Result<(), GuidanceError> {
        self.registry().activate(id)
    }

    /// Requests a graceful stop of a plugin.
    pub fn deactivate(&self, id: PluginId) -> Result<(), GuidanceError> {
        self.registry().deactivate(id)
    }

    /// Faults a plugin on behalf of an operator or monitor.
    pub fn report_fault(&self, id: PluginId, cause: FaultCause) -> Result<(), GuidanceError> {
        self.registry().report_fault(id, cause)
    }

    /// Operator reset of a faulted plugin.
    pub fn reset(&self, id: PluginId) -> Result<(), GuidanceError> {
        self.registry().reset(id)
    }

    /// Runs a single control cycle outside the scheduler.
    pub async fn run_cycle(&self) -> Result<Arc<ArbitrationDecision>, GuidanceError> {
        self.arbitrator().run_cycle().await
    }

    /// Scheduler builder preloaded with the configured period and telemetry.
    #[must_use]
    pub fn scheduler(&self) -> CycleSchedulerBuilder {
        CycleScheduler::builder(Arc::clone(self.arbitrator())).telemetry(self.telemetry.clone())
    }

    /// Starts the fixed-period loop, optionally stopping after `max_cycles`.
    #[must_use]
    pub fn spawn_scheduler(&self, max_cycles: Option<u64>) -> SchedulerHandle {
        let builder = self.scheduler();
        match max_cycles {
            Some(max) => builder.max_cycles(max),
            None => builder,
        }
        .build()
        .spawn()
    }

    /// Health of every registered plugin.
    #[must_use]
    pub fn statuses(&self) -> Vec<PluginStatus> {
        self.registry().statuses()
    }

    /// Capability layer shared with plugins.
    #[must_use]
    pub fn pubsub(&self) -> Arc<dyn PubSubService> {
        Arc::clone(&self.pubsub)
    }

    /// Plugin registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<PluginRegistry> {
        self.platform.registry()
    }

    /// Arbitrator.
    #[must_use]
    pub const fn arbitrator(&self) -> &Arc<Arbitrator> {
        self.platform.arbitrator()
    }

    /// Platform handing out plugin locators.
    #[must_use]
    pub const fn platform(&self) -> &GuidancePlatform {
        &self.platform
    }

    /// Effective configuration.
    #[must_use]
    pub const fn config(&self) -> &GuidanceConfig {
        &self.config
    }

    /// Telemetry handle.
    #[must_use]
    pub const fn telemetry(&self) -> &GuidanceTelemetry {
        &self.telemetry
    }
}
