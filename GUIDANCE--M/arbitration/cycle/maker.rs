use std::{sync::Arc, time::Duration};

use crate::{arbitration::Arbitrator, telemetry::GuidanceTelemetry};

use super::{CycleScheduler, MIN_PERIOD};

/// Builder used to configure a [`CycleScheduler`].
#[derive(Debug, Clone)]
pub struct CycleSchedulerBuilder {
    arbitrator: Arc<Arbitrator>,
    period: Duration,
    max_cycles: Option<u64>,
    telemetry: Option<GuidanceTelemetry>,
}

impl CycleSchedulerBuilder {
    /// Creates a builder using the arbitrator's configured period.
    #[must_use]
    pub fn new(arbitrator: Arc<Arbitrator>) -> Self {
        let period = arbitrator.config().cycle_period();
        Self {
            arbitrator,
            period,
            max_cycles: None,
            telemetry: None,
        }
    }

    /// Overrides the cycle period. Clamped to at least one millisecond.
    #[must_use]
    pub fn period(mut self, period: Duration) -> Self {
        self.period = period.max(MIN_PERIOD);
        self
    }

    /// Stops after this many executed cycles.
    #[must_use]
    pub const fn max_cycles(mut self, max_cycles: u64) -> Self {
        self.max_cycles = Some(max_cycles);
        self
    }

    /// Attaches telemetry used for overrun events.
    #[must_use]
    pub fn telemetry(mut self, telemetry: GuidanceTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Finalizes the configuration.
    #[must_use]
    pub fn build(self) -> CycleScheduler {
        let mut scheduler = CycleScheduler::new(self.arbitrator, self.period);
        scheduler.max_cycles = self.max_cycles;
        if let Some(tel) = self.telemetry {
            scheduler = scheduler.with_telemetry(tel);
        }
        scheduler
    }
}
