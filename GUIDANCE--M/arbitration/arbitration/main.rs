//! Per-cycle solicitation, screening and selection of maneuver proposals.

/// Decision, rejection and reason types.
pub mod decision;
/// Proposal value objects.
pub mod proposal;
/// Deterministic winner selection.
pub mod selection;

use std::{
    any::Any,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use decision::{ArbitrationDecision, Rejection, RejectionReason, Selection};
use futures::future::join_all;
use parking_lot::RwLock;
use proposal::{Proposal, ProposalRequest};
use selection::{select_winner, Candidate};
use serde_json::json;
use shared_logging::LogLevel;
use shared_pubsub::{publish_json, PubSubService};
use tokio::{sync::Mutex, task::JoinError, time::timeout};
use tracing::{debug, info, instrument, warn};

use crate::{
    config::ArbitrationConfig,
    error::GuidanceError,
    plugin::{
        registry::{ActivePlugin, PluginRegistry},
        FaultCause, PluginError, PluginId,
    },
    telemetry::{GuidanceEvent, GuidanceTelemetry},
};

/// What came back from one plugin within the deadline.
enum Response {
    Delivered(Option<Proposal>),
    Failed(PluginError),
    Panicked(String),
    TimedOut,
}

enum Screened {
    Candidate(Candidate),
    Rejected(Rejection),
}

/// Runs one arbitration at a time over the registry's running plugins.
pub struct Arbitrator {
    registry: Arc<PluginRegistry>,
    pubsub: Arc<dyn PubSubService>,
    config: ArbitrationConfig,
    telemetry: Option<GuidanceTelemetry>,
    next_cycle: AtomicU64,
    current: RwLock<Option<Arc<ArbitrationDecision>>>,
    cycle_guard: Mutex<()>,
}

impl fmt::Debug for Arbitrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arbitrator")
            .field("config", &self.config)
            .field("next_cycle", &self.next_cycle.load(Ordering::SeqCst))
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Arbitrator {
    /// Creates an arbitrator; the first cycle is numbered 1.
    pub fn new(
        registry: Arc<PluginRegistry>,
        pubsub: Arc<dyn PubSubService>,
        config: ArbitrationConfig,
    ) -> Result<Self, GuidanceError> {
        config.validate()?;
        Ok(Self {
            registry,
            pubsub,
            config,
            telemetry: None,
            next_cycle: AtomicU64::new(1),
            current: RwLock::new(None),
            cycle_guard: Mutex::new(()),
        })
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: GuidanceTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Most recently issued decision.
    #[must_use]
    pub fn current_decision(&self) -> Option<Arc<ArbitrationDecision>> {
        self.current.read().clone()
    }

    /// Index of the most recently completed cycle.
    #[must_use]
    pub fn current_cycle(&self) -> Option<u64> {
        self.current.read().as_ref().map(|decision| decision.cycle)
    }

    /// Topic decisions are published on.
    #[must_use]
    pub fn decision_topic(&self) -> &str {
        &self.config.decision_topic
    }

    /// Arbitration settings in use.
    #[must_use]
    pub const fn config(&self) -> &ArbitrationConfig {
        &self.config
    }

    /// Runs one control cycle and returns its decision.
    ///
    /// Always yields a decision unless another cycle is still running, in which case
    /// [`GuidanceError::CycleInProgress`] is returned and nothing is solicited.
    #[instrument(skip(self), fields(cycle = tracing::field::Empty))]
    pub async fn run_cycle(&self) -> Result<Arc<ArbitrationDecision>, GuidanceError> {
        let Ok(_guard) = self.cycle_guard.try_lock() else {
            let busy = self
                .registry
                .cycle_in_flight()
                .unwrap_or_else(|| self.next_cycle.load(Ordering::SeqCst).saturating_sub(1));
            return Err(GuidanceError::CycleInProgress(busy));
        };
        let cycle = self.next_cycle.fetch_add(1, Ordering::SeqCst);
        tracing::Span::current().record("cycle", cycle);

        let boundary = self.registry.begin_cycle(cycle);
        let request = ProposalRequest {
            cycle,
            deadline: self.config.proposal_timeout(),
            previous: self.current_decision(),
        };
        let responses = solicit(boundary.active(), &request).await;

        let mut candidates = Vec::new();
        let mut rejected: Vec<(PluginId, Rejection)> = Vec::new();
        for (plugin, response) in boundary.active().iter().zip(responses) {
            match self.screen(plugin, response, cycle) {
                Screened::Candidate(candidate) => candidates.push(candidate),
                Screened::Rejected(rejection) => rejected.push((plugin.id, rejection)),
            }
        }

        let decision = match select_winner(candidates) {
            Some((winner, outranked)) => {
                for loser in outranked {
                    let detail = format!(
                        "lost to {} (priority {}, confidence {})",
                        winner.plugin, winner.proposal.priority, winner.proposal.confidence
                    );
                    rejected.push((
                        loser.id,
                        Rejection::new(loser.plugin, RejectionReason::Outranked, detail),
                    ));
                }
                rejected.sort_by_key(|(id, _)| *id);
                ArbitrationDecision::selected(
                    cycle,
                    Selection {
                        plugin: winner.plugin,
                        proposal: winner.proposal,
                    },
                    rejected.into_iter().map(|(_, rejection)| rejection).collect(),
                )
            }
            None => {
                // Every solicited plugin is listed; the detail keeps what went wrong.
                let rejections = rejected
                    .into_iter()
                    .map(|(_, rejection)| {
                        Rejection::new(
                            rejection.plugin,
                            RejectionReason::NoValidProposal,
                            format!("{}: {}", rejection.reason, rejection.detail),
                        )
                    })
                    .collect();
                ArbitrationDecision::fail_safe(cycle, rejections)
            }
        };
        let solicited = boundary.active().len();
        drop(boundary);

        let decision = Arc::new(decision);
        *self.current.write() = Some(Arc::clone(&decision));
        self.report(&decision, solicited);

        if let Err(err) =
            publish_json(self.pubsub.as_ref(), &self.config.decision_topic, decision.as_ref()).await
        {
            warn!(%err, cycle, topic = %self.config.decision_topic, "decision publish failed");
        }
        Ok(decision)
    }

    fn screen(&self, plugin: &ActivePlugin, response: Response, cycle: u64) -> Screened {
        let identity = plugin.identity().clone();
        let rejected = |reason, detail: String| {
            Screened::Rejected(Rejection::new(identity.clone(), reason, detail))
        };
        match response {
            Response::Delivered(None) => {
                self.registry.record_response(plugin.id, cycle);
                rejected(RejectionReason::Abstained, "declined to propose".into())
            }
            Response::Delivered(Some(proposal)) => {
                self.registry.record_response(plugin.id, cycle);
                if let Err(detail) = proposal.check() {
                    self.fault(plugin, FaultCause::MalformedProposal(detail.clone()));
                    return rejected(RejectionReason::Malformed, detail);
                }
                if !proposal.validity.covers(cycle) {
                    return rejected(
                        RejectionReason::Expired,
                        format!(
                            "valid for cycles {}..={}, current cycle {cycle}",
                            proposal.validity.start_cycle, proposal.validity.end_cycle
                        ),
                    );
                }
                if !plugin.descriptor.capabilities.contains(&proposal.maneuver) {
                    return rejected(
                        RejectionReason::CapabilityMismatch,
                        format!("{} was not declared", proposal.maneuver),
                    );
                }
                Screened::Candidate(Candidate {
                    id: plugin.id,
                    plugin: identity.clone(),
                    proposal,
                })
            }
            Response::Failed(err) => {
                self.miss(plugin, cycle);
                rejected(RejectionReason::PluginFailure, err.to_string())
            }
            Response::TimedOut => {
                self.miss(plugin, cycle);
                rejected(
                    RejectionReason::PluginTimeout,
                    format!("no answer within {} ms", self.config.proposal_timeout_ms),
                )
            }
            Response::Panicked(detail) => {
                self.fault(plugin, FaultCause::Panicked(detail.clone()));
                rejected(RejectionReason::Malformed, format!("panicked: {detail}"))
            }
        }
    }

    fn miss(&self, plugin: &ActivePlugin, cycle: u64) {
        let streak = self.registry.record_miss(plugin.id);
        debug!(plugin = %plugin.identity(), cycle, streak, "proposal missed");
        if streak >= self.config.miss_threshold {
            self.fault(plugin, FaultCause::ConsecutiveMisses(streak));
        }
    }

    fn fault(&self, plugin: &ActivePlugin, cause: FaultCause) {
        // A fault may already be queued for this boundary.
        if let Err(err) = self.registry.report_fault(plugin.id, cause) {
            debug!(plugin = %plugin.identity(), %err, "fault not recorded");
        }
    }

    fn report(&self, decision: &ArbitrationDecision, solicited: usize) {
        match decision.contributor() {
            Some(plugin) => info!(
                cycle = decision.cycle,
                %plugin,
                maneuver = %decision.maneuver,
                rejected = decision.rejections.len(),
                "decision issued"
            ),
            None => warn!(cycle = decision.cycle, solicited, "fail-safe decision issued"),
        }
        let Some(telemetry) = &self.telemetry else {
            return;
        };
        for rejection in &decision.rejections {
            telemetry.emit(&GuidanceEvent::ProposalRejected {
                plugin: rejection.plugin.clone(),
                reason: rejection.reason,
                detail: rejection.detail.clone(),
                cycle: decision.cycle,
            });
        }
        if decision.is_fail_safe() {
            telemetry.emit(&GuidanceEvent::FailSafeIssued {
                cycle: decision.cycle,
                solicited,
            });
        }
        telemetry.log(
            LogLevel::Info,
            "arbitration.decision",
            Some(decision.cycle),
            json!({
                "maneuver": decision.maneuver.to_string(),
                "contributor": decision.contributor().map(ToString::to_string),
                "rejections": decision.rejections.len(),
                "solicited": solicited,
            }),
        );
    }
}

/// Asks every plugin concurrently; results come back in the order of `active`.
async fn solicit(active: &[ActivePlugin], request: &ProposalRequest) -> Vec<Response> {
    let deadline = request.deadline;
    let pending = active.iter().map(|entry| {
        let plugin = Arc::clone(&entry.plugin);
        let request = request.clone();
        let mut task = tokio::spawn(async move { plugin.propose(&request).await });
        async move {
            match timeout(deadline, &mut task).await {
                Ok(Ok(Ok(proposal))) => Response::Delivered(proposal),
                Ok(Ok(Err(err))) => Response::Failed(err),
                Ok(Err(err)) => Response::Panicked(describe_join_error(err)),
                Err(_) => {
                    task.abort();
                    Response::TimedOut
                }
            }
        }
    });
    join_all(pending).await
}

fn describe_join_error(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload: Box<dyn Any + Send> = err.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{
        GuidancePlugin, ManeuverType, PluginDescriptor, PluginIdentity, PluginState,
    };
    use async_trait::async_trait;
    use proposal::{TrajectorySegment, ValidityWindow};
    use shared_logging::MemoryLogSink;
    use shared_pubsub::MemoryPubSub;
    use std::{sync::atomic::AtomicUsize, time::Duration};

    /// Proposes the same maneuver every cycle, valid for that cycle only.
    struct Steady {
        maneuver: ManeuverType,
        priority: i32,
        confidence: f64,
    }

    #[async_trait]
    impl GuidancePlugin for Steady {
        async fn propose(
            &self,
            request: &ProposalRequest,
        ) -> Result<Option<Proposal>, PluginError> {
            Ok(Some(
                Proposal::new(
                    self.maneuver.clone(),
                    TrajectorySegment::new(20.0, 0, 60.0),
                    ValidityWindow::single(request.cycle),
                )
                .with_priority(self.priority)
                .with_confidence(self.confidence),
            ))
        }
    }

    /// Answers with whatever the closure returns.
    struct Scripted<F>(F);

    #[async_trait]
    impl<F> GuidancePlugin for Scripted<F>
    where
        F: Fn(&ProposalRequest) -> Result<Option<Proposal>, PluginError> + Send + Sync,
    {
        async fn propose(
            &self,
            request: &ProposalRequest,
        ) -> Result<Option<Proposal>, PluginError> {
            (self.0)(request)
        }
    }

    struct Sleepy(Duration);

    #[async_trait]
    impl GuidancePlugin for Sleepy {
        async fn propose(
            &self,
            _request: &ProposalRequest,
        ) -> Result<Option<Proposal>, PluginError> {
            tokio::time::sleep(self.0).await;
            Ok(None)
        }
    }

    struct Panicky;

    #[async_trait]
    impl GuidancePlugin for Panicky {
        async fn propose(
            &self,
            _request: &ProposalRequest,
        ) -> Result<Option<Proposal>, PluginError> {
            panic!("lidar frame missing");
        }
    }

    struct Harness {
        registry: Arc<PluginRegistry>,
        bus: Arc<MemoryPubSub>,
        arbitrator: Arbitrator,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(ArbitrationConfig::default())
        }

        fn with_config(config: ArbitrationConfig) -> Self {
            let registry = Arc::new(PluginRegistry::new());
            let bus = Arc::new(MemoryPubSub::new(32));
            let arbitrator =
                Arbitrator::new(Arc::clone(&registry), bus.clone(), config).unwrap();
            Self {
                registry,
                bus,
                arbitrator,
            }
        }

        fn add(&self, name: &str, plugin: impl GuidancePlugin + 'static) -> PluginId {
            let descriptor = PluginDescriptor::new(name, "1.0")
                .with_capability(ManeuverType::LaneKeeping)
                .with_capability(ManeuverType::SpeedControl);
            let id = self.registry.register(descriptor, Arc::new(plugin)).unwrap();
            self.registry.activate(id).unwrap();
            id
        }
    }

    fn steady(priority: i32, confidence: f64) -> Steady {
        Steady {
            maneuver: ManeuverType::LaneKeeping,
            priority,
            confidence,
        }
    }

    #[tokio::test]
    async fn equal_proposals_go_to_earliest_registration() {
        let harness = Harness::new();
        harness.add("a", steady(5, 0.9));
        harness.add("b", steady(5, 0.9));

        let decision = harness.arbitrator.run_cycle().await.unwrap();
        assert_eq!(decision.contributor().unwrap().name, "a");
        let b = decision.rejections.iter().find(|r| r.plugin.name == "b").unwrap();
        assert_eq!(b.reason, RejectionReason::Outranked);

        let again = harness.arbitrator.run_cycle().await.unwrap();
        assert_eq!(again.contributor(), decision.contributor());
    }

    #[tokio::test]
    async fn priority_then_confidence_decide() {
        let harness = Harness::new();
        harness.add("low", steady(1, 1.0));
        harness.add("high_unsure", steady(7, 0.3));
        harness.add("high_sure", steady(7, 0.8));

        let decision = harness.arbitrator.run_cycle().await.unwrap();
        assert_eq!(decision.contributor().unwrap().name, "high_sure");
        let names: Vec<&str> = decision
            .rejections
            .iter()
            .map(|r| r.plugin.name.as_str())
            .collect();
        assert_eq!(names, vec!["low", "high_unsure"]);
    }

    #[tokio::test]
    async fn expired_proposal_is_excluded() {
        let harness = Harness::new();
        harness.add(
            "stale",
            Scripted(|request: &ProposalRequest| {
                let end = request.cycle - 1;
                Ok(Some(
                    Proposal::new(
                        ManeuverType::LaneKeeping,
                        TrajectorySegment::new(30.0, 0, 90.0),
                        ValidityWindow::new(0, end),
                    )
                    .with_priority(100),
                ))
            }),
        );
        harness.add("fresh", steady(1, 0.5));

        let decision = harness.arbitrator.run_cycle().await.unwrap();
        assert_eq!(decision.contributor().unwrap().name, "fresh");
        let stale = decision.rejections.iter().find(|r| r.plugin.name == "stale").unwrap();
        assert_eq!(stale.reason, RejectionReason::Expired);
    }

    #[tokio::test]
    async fn undeclared_maneuver_is_a_capability_mismatch() {
        let harness = Harness::new();
        let rogue = harness.add(
            "rogue",
            Steady {
                maneuver: ManeuverType::LaneChange,
                priority: 9,
                confidence: 1.0,
            },
        );

        let decision = harness.arbitrator.run_cycle().await.unwrap();
        assert!(decision.is_fail_safe());
        let rejection = &decision.rejections[0];
        assert_eq!(rejection.reason, RejectionReason::NoValidProposal);
        assert!(rejection.detail.starts_with("capability_mismatch"));
        assert_eq!(harness.registry.state(rogue).unwrap(), PluginState::Running);

        let good = harness.add("good", steady(1, 0.5));
        let decision = harness.arbitrator.run_cycle().await.unwrap();
        assert_eq!(decision.contributor().unwrap().name, "good");
        let rejection = decision
            .rejection_for(&PluginIdentity::new("rogue", "1.0"))
            .unwrap();
        assert_eq!(rejection.reason, RejectionReason::CapabilityMismatch);
        assert_eq!(decision.rejections.len(), 1);
        assert_eq!(harness.registry.state(rogue).unwrap(), PluginState::Running);
        assert_eq!(harness.registry.state(good).unwrap(), PluginState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn fail_safe_lists_every_active_plugin() {
        let harness = Harness::new();
        harness.add("quiet", Scripted(|_: &ProposalRequest| Ok(None)));
        harness.add("slow", Sleepy(Duration::from_secs(5)));
        harness.add(
            "broken",
            Scripted(|_: &ProposalRequest| Err(PluginError::Unavailable("no map".into()))),
        );

        let decision = harness.arbitrator.run_cycle().await.unwrap();
        assert!(decision.is_fail_safe());
        assert_eq!(decision.maneuver, ManeuverType::MinimalRisk);
        assert_eq!(decision.trajectory, TrajectorySegment::hold());
        let listed: Vec<(&str, RejectionReason)> = decision
            .rejections
            .iter()
            .map(|r| (r.plugin.name.as_str(), r.reason))
            .collect();
        assert_eq!(
            listed,
            vec![
                ("quiet", RejectionReason::NoValidProposal),
                ("slow", RejectionReason::NoValidProposal),
                ("broken", RejectionReason::NoValidProposal),
            ]
        );
        assert!(decision.rejections[1].detail.starts_with("plugin_timeout"));
        assert!(decision.rejections[2].detail.contains("no map"));
    }

    #[tokio::test]
    async fn empty_registry_still_yields_a_decision() {
        let harness = Harness::new();
        let decision = harness.arbitrator.run_cycle().await.unwrap();
        assert!(decision.is_fail_safe());
        assert!(decision.rejections.is_empty());
        assert_eq!(decision.cycle, 1);
        assert_eq!(harness.arbitrator.current_cycle(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn misses_fault_only_at_threshold() {
        let harness = Harness::new();
        let slow = harness.add("slow", Sleepy(Duration::from_secs(1)));
        harness.add("steady", steady(1, 0.5));

        for _ in 0..2 {
            harness.arbitrator.run_cycle().await.unwrap();
        }
        let status = harness.registry.status(slow).unwrap();
        assert_eq!(status.state, PluginState::Running);
        assert_eq!(status.consecutive_misses, 2);

        harness.arbitrator.run_cycle().await.unwrap();
        let status = harness.registry.status(slow).unwrap();
        assert_eq!(status.state, PluginState::Faulted);
        assert_eq!(status.fault, Some(FaultCause::ConsecutiveMisses(3)));

        let next = harness.arbitrator.run_cycle().await.unwrap();
        assert!(next.rejection_for(&status.identity).is_none());
        assert_eq!(harness.registry.list_active().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn any_answer_resets_the_miss_streak() {
        let config = ArbitrationConfig {
            miss_threshold: 2,
            ..ArbitrationConfig::default()
        };
        let harness = Harness::with_config(config);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let flaky = harness.add(
            "flaky",
            Scripted(move |_: &ProposalRequest| {
                // Fails every other cycle, answers in between.
                if counter.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                    Err(PluginError::Internal("glitch".into()))
                } else {
                    Ok(None)
                }
            }),
        );
        for _ in 0..6 {
            harness.arbitrator.run_cycle().await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(harness.registry.state(flaky).unwrap(), PluginState::Running);
    }

    #[tokio::test]
    async fn panics_and_malformed_proposals_are_isolated() {
        let harness = Harness::new();
        let panicky = harness.add("panicky", Panicky);
        let sloppy = harness.add("sloppy", steady(3, 7.5));
        harness.add("good", steady(1, 0.6));

        let decision = harness.arbitrator.run_cycle().await.unwrap();
        assert_eq!(decision.contributor().unwrap().name, "good");
        let panic = decision.rejections.iter().find(|r| r.plugin.name == "panicky").unwrap();
        assert_eq!(panic.reason, RejectionReason::Malformed);
        assert!(panic.detail.contains("lidar frame missing"));

        assert_eq!(harness.registry.state(panicky).unwrap(), PluginState::Faulted);
        let sloppy_status = harness.registry.status(sloppy).unwrap();
        assert_eq!(sloppy_status.state, PluginState::Faulted);
        assert!(matches!(
            sloppy_status.fault,
            Some(FaultCause::MalformedProposal(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_cycles_are_refused() {
        let harness = Harness::new();
        harness.add("thinker", Sleepy(Duration::from_millis(20)));

        let (first, second) =
            tokio::join!(harness.arbitrator.run_cycle(), harness.arbitrator.run_cycle());
        assert!(first.is_ok());
        assert!(matches!(second, Err(GuidanceError::CycleInProgress(1))));
        assert_eq!(harness.arbitrator.run_cycle().await.unwrap().cycle, 2);
    }

    #[tokio::test]
    async fn decisions_are_published_and_fed_back() {
        let harness = Harness::new();
        let mut rx = harness
            .bus
            .subscribe_channel(harness.arbitrator.decision_topic())
            .await
            .unwrap();
        let seen = Arc::new(AtomicU64::new(0));
        let witness = Arc::clone(&seen);
        harness.add(
            "observer",
            Scripted(move |request: &ProposalRequest| {
                if let Some(previous) = &request.previous {
                    witness.store(previous.cycle, Ordering::SeqCst);
                }
                Ok(None)
            }),
        );
        harness.add("cruise", steady(2, 0.7));

        harness.arbitrator.run_cycle().await.unwrap();
        harness.arbitrator.run_cycle().await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        let first: ArbitrationDecision = rx.recv().await.unwrap().decode().unwrap();
        assert_eq!(first.cycle, 1);
        assert_eq!(first.contributor().unwrap().name, "cruise");
        assert_eq!(
            harness.arbitrator.current_decision().unwrap().cycle,
            2
        );
    }

    #[tokio::test]
    async fn rejections_and_fail_safe_reach_telemetry() {
        let sink = Arc::new(MemoryLogSink::new(64));
        let telemetry = GuidanceTelemetry::builder("arbitration-test")
            .log_sink(sink.clone())
            .build()
            .unwrap();
        let registry = Arc::new(PluginRegistry::new());
        let bus = Arc::new(MemoryPubSub::new(8));
        let arbitrator =
            Arbitrator::new(Arc::clone(&registry), bus, ArbitrationConfig::default())
                .unwrap()
                .with_telemetry(telemetry);
        let id = registry
            .register(
                PluginDescriptor::new("idle", "0.1").with_capability(ManeuverType::Stop),
                Arc::new(Scripted(|_: &ProposalRequest| Ok(None))),
            )
            .unwrap();
        registry.activate(id).unwrap();

        arbitrator.run_cycle().await.unwrap();
        let rejected = sink.find("proposal.rejected");
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].cycle, Some(1));
        assert_eq!(rejected[0].metadata["reason"], "no_valid_proposal");
        assert_eq!(sink.find("arbitration.fail_safe").len(), 1);
        assert_eq!(sink.find("arbitration.decision").len(), 1);
    }

    #[test]
    fn invalid_config_is_refused() {
        let config = ArbitrationConfig {
            proposal_timeout_ms: 500,
            ..ArbitrationConfig::default()
        };
        let result = Arbitrator::new(
            Arc::new(PluginRegistry::new()),
            Arc::new(MemoryPubSub::new(4)),
            config,
        );
        assert!(matches!(result, Err(GuidanceError::Config(_))));
    }
}
