//! Fixed-period control loop driving the arbitrator.

/// Builder utilities for the scheduler.
pub mod maker;

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use maker::CycleSchedulerBuilder;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval, Instant, MissedTickBehavior},
};
use tracing::{info, warn};

use crate::{
    arbitration::Arbitrator,
    telemetry::{GuidanceEvent, GuidanceTelemetry},
};

/// Counters kept by the control loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerMetrics {
    /// Cycles that produced a decision.
    pub cycles_run: u64,
    /// Of those, cycles that ended in the fail-safe decision.
    pub fail_safe_cycles: u64,
    /// Cycles that outlasted the period.
    pub overruns: u64,
    /// Ticks merged into overrunning cycles.
    pub skipped_ticks: u64,
    /// Wall time of the last cycle.
    pub last_cycle_duration_ms: u64,
    /// Index of the last cycle.
    pub last_cycle: Option<u64>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self {
            cycles_run: 0,
            fail_safe_cycles: 0,
            overruns: 0,
            skipped_ticks: 0,
            last_cycle_duration_ms: 0,
            last_cycle: None,
            updated_at: Utc::now(),
        }
    }
}

pub(crate) const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Runs [`Arbitrator::run_cycle`] once per period on a single task.
///
/// A cycle that outlasts its period is never overlapped: the ticks that fell due while
/// it ran are skipped and the next cycle starts on the following tick.
#[derive(Debug, Clone)]
pub struct CycleScheduler {
    arbitrator: Arc<Arbitrator>,
    period: Duration,
    max_cycles: Option<u64>,
    metrics: Arc<RwLock<SchedulerMetrics>>,
    telemetry: Option<GuidanceTelemetry>,
}

impl CycleScheduler {
    /// Creates a scheduler that runs until shut down. The period is clamped to
    /// at least one millisecond.
    #[must_use]
    pub fn new(arbitrator: Arc<Arbitrator>, period: Duration) -> Self {
        Self {
            arbitrator,
            period: period.max(MIN_PERIOD),
            max_cycles: None,
            metrics: Arc::new(RwLock::new(SchedulerMetrics::default())),
            telemetry: None,
        }
    }

    /// Returns a builder for the scheduler.
    #[must_use]
    pub fn builder(arbitrator: Arc<Arbitrator>) -> CycleSchedulerBuilder {
        CycleSchedulerBuilder::new(arbitrator)
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: GuidanceTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Cycle period.
    #[must_use]
    pub const fn period(&self) -> Duration {
        self.period
    }

    /// Latest metrics snapshot.
    #[must_use]
    pub fn metrics(&self) -> SchedulerMetrics {
        self.metrics.read().clone()
    }

    /// Runs until `shutdown` flips to `true`, its sender is dropped, or the cycle limit
    /// is reached. A shutdown request lets the running cycle finish.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> SchedulerMetrics {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(period_ms = duration_ms(self.period), max_cycles = ?self.max_cycles, "cycle scheduler started");

        loop {
            if *shutdown.borrow() || self.limit_reached() {
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

            let started = Instant::now();
            let outcome = self.arbitrator.run_cycle().await;
            let elapsed = started.elapsed();
            match outcome {
                Ok(decision) => {
                    let mut metrics = self.metrics.write();
                    metrics.cycles_run += 1;
                    if decision.is_fail_safe() {
                        metrics.fail_safe_cycles += 1;
                    }
                    metrics.last_cycle = Some(decision.cycle);
                    metrics.last_cycle_duration_ms = duration_ms(elapsed);
                    metrics.updated_at = Utc::now();
                }
                Err(err) => warn!(%err, "cycle skipped"),
            }
            if elapsed > self.period {
                self.record_overrun(elapsed);
            }
        }

        let snapshot = self.metrics();
        info!(
            cycles = snapshot.cycles_run,
            overruns = snapshot.overruns,
            "cycle scheduler stopped"
        );
        snapshot
    }

    /// Moves the loop onto its own task.
    #[must_use]
    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown, rx) = watch::channel(false);
        let metrics = Arc::clone(&self.metrics);
        let task = tokio::spawn(async move { self.run(rx).await });
        SchedulerHandle {
            shutdown,
            metrics,
            task,
        }
    }

    fn limit_reached(&self) -> bool {
        self.max_cycles
            .is_some_and(|max| self.metrics.read().cycles_run >= max)
    }

    fn record_overrun(&self, elapsed: Duration) {
        let skipped = u64::try_from(elapsed.as_nanos() / self.period.as_nanos().max(1))
            .unwrap_or(u64::MAX);
        let cycle = {
            let mut metrics = self.metrics.write();
            metrics.overruns += 1;
            metrics.skipped_ticks = metrics.skipped_ticks.saturating_add(skipped);
            metrics.last_cycle.unwrap_or_default()
        };
        warn!(
            cycle,
            elapsed_ms = duration_ms(elapsed),
            skipped,
            "cycle overran its period"
        );
        if let Some(telemetry) = &self.telemetry {
            telemetry.emit(&GuidanceEvent::CycleOverrun {
                cycle,
                skipped_ticks: skipped,
            });
        }
    }
}

/// Handle to a spawned scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    metrics: Arc<RwLock<SchedulerMetrics>>,
    task: JoinHandle<SchedulerMetrics>,
}

impl SchedulerHandle {
    /// Asks the loop to stop at the next cycle boundary.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Live metrics.
    #[must_use]
    pub fn metrics(&self) -> SchedulerMetrics {
        self.metrics.read().clone()
    }

    /// Whether the loop has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the loop to exit on its own.
    pub async fn wait(self) -> SchedulerMetrics {
        let fallback = Arc::clone(&self.metrics);
        match self.task.await {
            Ok(metrics) => metrics,
            Err(err) => {
                warn!(%err, "scheduler task ended abnormally");
                let metrics = fallback.read().clone();
                metrics
            }
        }
    }

    /// Requests shutdown and waits for the loop to exit.
    pub async fn stop(self) -> SchedulerMetrics {
        self.shutdown();
        self.wait().await
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
