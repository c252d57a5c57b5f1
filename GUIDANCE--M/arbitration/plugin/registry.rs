use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    lifecycle::{next_state, Deferred, LifecycleAction},
    CapabilitySet, FaultCause, GuidancePlugin, PluginDescriptor, PluginId, PluginIdentity,
    PluginState,
};
use crate::{
    error::GuidanceError,
    telemetry::{GuidanceEvent, GuidanceTelemetry},
};

/// Plugin taking part in the current cycle.
#[derive(Clone)]
pub struct ActivePlugin {
    /// Registry id; orders plugins by registration.
    pub id: PluginId,
    /// Identity and declared capabilities.
    pub descriptor: Arc<PluginDescriptor>,
    pub(crate) plugin: Arc<dyn GuidancePlugin>,
}

impl ActivePlugin {
    /// Shorthand for the descriptor identity.
    #[must_use]
    pub fn identity(&self) -> &PluginIdentity {
        &self.descriptor.identity
    }
}

impl fmt::Debug for ActivePlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivePlugin")
            .field("id", &self.id)
            .field("identity", &self.descriptor.identity)
            .finish_non_exhaustive()
    }
}

/// Health and lifecycle view of one plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginStatus {
    /// Registry id.
    pub id: PluginId,
    /// Name and version.
    pub identity: PluginIdentity,
    /// Declared maneuvers.
    pub capabilities: CapabilitySet,
    /// Current lifecycle state.
    pub state: PluginState,
    /// State the plugin will move to at the end of the in-flight cycle.
    pub pending: Option<PluginState>,
    /// Proposal deadlines missed in a row.
    pub consecutive_misses: u32,
    /// Last cycle in which the plugin answered in time.
    pub last_response_cycle: Option<u64>,
    /// Reason for the most recent fault.
    pub fault: Option<FaultCause>,
    /// Registration time.
    pub registered_at: DateTime<Utc>,
}

struct PluginEntry {
    id: PluginId,
    descriptor: Arc<PluginDescriptor>,
    plugin: Arc<dyn GuidancePlugin>,
    state: PluginState,
    deferred: Option<Deferred>,
    consecutive_misses: u32,
    last_response_cycle: Option<u64>,
    fault: Option<FaultCause>,
    registered_at: DateTime<Utc>,
}

impl PluginEntry {
    fn effective_state(&self) -> PluginState {
        self.deferred
            .as_ref()
            .map_or(self.state, Deferred::target)
    }

    fn status(&self) -> PluginStatus {
        PluginStatus {
            id: self.id,
            identity: self.descriptor.identity.clone(),
            capabilities: self.descriptor.capabilities.clone(),
            state: self.state,
            pending: self.deferred.as_ref().map(Deferred::target),
            consecutive_misses: self.consecutive_misses,
            last_response_cycle: self.last_response_cycle,
            fault: self.fault.clone(),
            registered_at: self.registered_at,
        }
    }

    fn active(&self) -> ActivePlugin {
        ActivePlugin {
            id: self.id,
            descriptor: Arc::clone(&self.descriptor),
            plugin: Arc::clone(&self.plugin),
        }
    }

    fn commit(&mut self, to: PluginState, cycle: u64, deferred: bool) -> GuidanceEvent {
        let from = self.state;
        self.state = to;
        GuidanceEvent::LifecycleTransition {
            plugin: self.descriptor.identity.clone(),
            from,
            to,
            cycle,
            deferred,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    next_sequence: u64,
    entries: IndexMap<PluginId, PluginEntry>,
    in_flight: Option<u64>,
    last_cycle: u64,
}

impl RegistryState {
    const fn reference_cycle(&self) -> u64 {
        match self.in_flight {
            Some(cycle) => cycle,
            None => self.last_cycle,
        }
    }
}

/// Owns every plugin and its lifecycle state.
///
/// Deactivations and faults requested while a cycle is in flight are validated at once
/// but only applied when the cycle ends, so the snapshot taken by
/// [`PluginRegistry::begin_cycle`] never changes under the arbitrator.
#[derive(Default)]
pub struct PluginRegistry {
    state: RwLock<RegistryState>,
    telemetry: Option<GuidanceTelemetry>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("PluginRegistry")
            .field("plugins", &state.entries.len())
            .field("in_flight", &state.in_flight)
            .finish()
    }
}

impl PluginRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches telemetry for lifecycle and fault events.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: GuidanceTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Adds a plugin in the `Registered` state.
    pub fn register(
        &self,
        descriptor: PluginDescriptor,
        plugin: Arc<dyn GuidancePlugin>,
    ) -> Result<PluginId, GuidanceError> {
        let mut state = self.state.write();
        if state
            .entries
            .values()
            .any(|entry| entry.descriptor.identity == descriptor.identity)
        {
            return Err(GuidanceError::DuplicateIdentity(descriptor.identity));
        }
        let id = PluginId::from_sequence(state.next_sequence);
        state.next_sequence += 1;
        debug!(plugin = %descriptor.identity, %id, "plugin registered");
        state.entries.insert(
            id,
            PluginEntry {
                id,
                descriptor: Arc::new(descriptor),
                plugin,
                state: PluginState::Registered,
                deferred: None,
                consecutive_misses: 0,
                last_response_cycle: None,
                fault: None,
                registered_at: Utc::now(),
            },
        );
        Ok(id)
    }

    /// Looks up the id registered for an identity.
    #[must_use]
    pub fn id_of(&self, identity: &PluginIdentity) -> Option<PluginId> {
        self.state
            .read()
            .entries
            .values()
            .find(|entry| &entry.descriptor.identity == identity)
            .map(|entry| entry.id)
    }

    /// Requests activation; the plugin starts running at the next cycle boundary.
    pub fn activate(&self, id: PluginId) -> Result<(), GuidanceError> {
        self.transition(id, LifecycleAction::Activate, None)
    }

    /// Requests a graceful stop.
    pub fn deactivate(&self, id: PluginId) -> Result<(), GuidanceError> {
        self.transition(id, LifecycleAction::Deactivate, None)
    }

    /// Moves a plugin to `Faulted` and emits a fault event.
    pub fn report_fault(&self, id: PluginId, cause: FaultCause) -> Result<(), GuidanceError> {
        self.transition(id, LifecycleAction::Fault, Some(cause))
    }

    /// Operator action returning a faulted plugin to `Registered`.
    pub fn reset(&self, id: PluginId) -> Result<(), GuidanceError> {
        self.transition(id, LifecycleAction::Reset, None)
    }

    /// Running plugins in registration order.
    #[must_use]
    pub fn list_active(&self) -> Vec<ActivePlugin> {
        self.state
            .read()
            .entries
            .values()
            .filter(|entry| entry.state == PluginState::Running)
            .map(PluginEntry::active)
            .collect()
    }

    /// Current lifecycle state.
    pub fn state(&self, id: PluginId) -> Result<PluginState, GuidanceError> {
        self.status(id).map(|status| status.state)
    }

    /// Lifecycle and health view of one plugin.
    pub fn status(&self, id: PluginId) -> Result<PluginStatus, GuidanceError> {
        self.state
            .read()
            .entries
            .get(&id)
            .map(PluginEntry::status)
            .ok_or_else(|| GuidanceError::UnknownPlugin(id.to_string()))
    }

    /// Status of every plugin in registration order.
    #[must_use]
    pub fn statuses(&self) -> Vec<PluginStatus> {
        self.state
            .read()
            .entries
            .values()
            .map(PluginEntry::status)
            .collect()
    }

    /// Number of registered plugins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    /// Cycle currently being arbitrated, if any.
    #[must_use]
    pub fn cycle_in_flight(&self) -> Option<u64> {
        self.state.read().in_flight
    }

    /// Notes a timely answer, clearing the miss streak.
    pub fn record_response(&self, id: PluginId, cycle: u64) {
        if let Some(entry) = self.state.write().entries.get_mut(&id) {
            entry.consecutive_misses = 0;
            entry.last_response_cycle = Some(cycle);
        }
    }

    /// Notes a missed deadline and returns the current streak.
    pub fn record_miss(&self, id: PluginId) -> u32 {
        self.state
            .write()
            .entries
            .get_mut(&id)
            .map_or(0, |entry| {
                entry.consecutive_misses = entry.consecutive_misses.saturating_add(1);
                entry.consecutive_misses
            })
    }

    /// Opens a cycle boundary: activated plugins start running and the running set is
    /// frozen until [`CycleBoundary`] is dropped.
    pub fn begin_cycle(&self, cycle: u64) -> CycleBoundary<'_> {
        let mut events = Vec::new();
        let active = {
            let mut state = self.state.write();
            state.in_flight = Some(cycle);
            for entry in state.entries.values_mut() {
                if entry.state == PluginState::Activated {
                    events.push(entry.commit(PluginState::Running, cycle, false));
                }
            }
            state
                .entries
                .values()
                .filter(|entry| entry.state == PluginState::Running)
                .map(PluginEntry::active)
                .collect()
        };
        self.emit(&events);
        CycleBoundary {
            registry: self,
            cycle,
            active,
        }
    }

    fn end_cycle(&self, cycle: u64) {
        let mut events = Vec::new();
        {
            let mut state = self.state.write();
            for entry in state.entries.values_mut() {
                if let Some(deferred) = entry.deferred.take() {
                    let to = deferred.target();
                    if let Deferred::Fault(cause) = deferred {
                        entry.fault = Some(cause);
                    }
                    events.push(entry.commit(to, cycle, true));
                }
            }
            state.in_flight = None;
            state.last_cycle = cycle;
        }
        self.emit(&events);
    }

    fn transition(
        &self,
        id: PluginId,
        action: LifecycleAction,
        cause: Option<FaultCause>,
    ) -> Result<(), GuidanceError> {
        let mut events = Vec::new();
        {
            let mut state = self.state.write();
            let cycle = state.reference_cycle();
            let in_flight = state.in_flight.is_some();
            let entry = state
                .entries
                .get_mut(&id)
                .ok_or_else(|| GuidanceError::UnknownPlugin(id.to_string()))?;
            let from = entry.effective_state();
            let invalid = |entry: &PluginEntry| GuidanceError::InvalidTransition {
                plugin: entry.descriptor.identity.clone(),
                from,
                action,
            };
            let Some(to) = next_state(from, action) else {
                return Err(invalid(&*entry));
            };
            // Only faults may override a transition already waiting for the boundary.
            if entry.deferred.is_some() && action != LifecycleAction::Fault {
                return Err(invalid(&*entry));
            }

            if let Some(cause) = &cause {
                events.push(GuidanceEvent::PluginFault {
                    plugin: entry.descriptor.identity.clone(),
                    cause: cause.clone(),
                    cycle,
                });
            }

            if in_flight && entry.state == PluginState::Running {
                entry.deferred = Some(match cause {
                    Some(cause) => Deferred::Fault(cause),
                    None => Deferred::Deactivate,
                });
                debug!(plugin = %entry.descriptor.identity, %action, "transition deferred to cycle boundary");
            } else {
                match action {
                    LifecycleAction::Fault => entry.fault = cause,
                    LifecycleAction::Reset | LifecycleAction::Activate => {
                        entry.consecutive_misses = 0;
                    }
                    LifecycleAction::Start | LifecycleAction::Deactivate => {}
                }
                events.push(entry.commit(to, cycle, false));
            }
        }
        self.emit(&events);
        Ok(())
    }

    fn emit(&self, events: &[GuidanceEvent]) {
        if let Some(telemetry) = &self.telemetry {
            for event in events {
                telemetry.emit(event);
            }
        }
    }
}

/// Frozen running set for one cycle. Deferred transitions apply when it is dropped.
pub struct CycleBoundary<'a> {
    registry: &'a PluginRegistry,
    cycle: u64,
    active: Vec<ActivePlugin>,
}

impl CycleBoundary<'_> {
    /// Cycle index this boundary belongs to.
    #[must_use]
    pub const fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Running plugins captured at the start of the cycle, in registration order.
    #[must_use]
    pub fn active(&self) -> &[ActivePlugin] {
        &self.active
    }
}

impl fmt::Debug for CycleBoundary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CycleBoundary")
            .field("cycle", &self.cycle)
            .field("active", &self.active.len())
            .finish()
    }
}

impl Drop for CycleBoundary<'_> {
    fn drop(&mut self) {
        self.registry.end_cycle(self.cycle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        arbitration::proposal::{Proposal, ProposalRequest},
        plugin::{ManeuverType, PluginError},
    };
    use async_trait::async_trait;
    use shared_logging::MemoryLogSink;

    struct Idle;

    #[async_trait]
    impl GuidancePlugin for Idle {
        async fn propose(
            &self,
            _request: &ProposalRequest,
        ) -> Result<Option<Proposal>, PluginError> {
            Ok(None)
        }
    }

    fn descriptor(name: &str) -> PluginDescriptor {
        PluginDescriptor::new(name, "1.0").with_capability(ManeuverType::LaneKeeping)
    }

    fn running(registry: &PluginRegistry, name: &str) -> PluginId {
        let id = registry.register(descriptor(name), Arc::new(Idle)).unwrap();
        registry.activate(id).unwrap();
        drop(registry.begin_cycle(0));
        id
    }

    #[test]
    fn duplicate_identity_is_rejected_and_first_survives() {
        let registry = PluginRegistry::new();
        let first = registry.register(descriptor("cruise"), Arc::new(Idle)).unwrap();
        registry.activate(first).unwrap();
        let err = registry
            .register(descriptor("cruise"), Arc::new(Idle))
            .unwrap_err();
        assert!(matches!(err, GuidanceError::DuplicateIdentity(ref id) if id.name == "cruise"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.state(first).unwrap(), PluginState::Activated);
        // Same name, new version is a different plugin.
        registry
            .register(PluginDescriptor::new("cruise", "2.0"), Arc::new(Idle))
            .unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn activation_takes_effect_at_cycle_boundary() {
        let registry = PluginRegistry::new();
        let id = registry.register(descriptor("lane"), Arc::new(Idle)).unwrap();
        registry.activate(id).unwrap();
        assert!(registry.list_active().is_empty());
        let boundary = registry.begin_cycle(1);
        assert_eq!(boundary.active().len(), 1);
        assert_eq!(boundary.active()[0].id, id);
        drop(boundary);
        assert_eq!(registry.state(id).unwrap(), PluginState::Running);
    }

    #[test]
    fn unknown_and_faulted_plugins_cannot_activate() {
        let registry = PluginRegistry::new();
        let ghost = PluginId::from_sequence(42);
        assert!(matches!(
            registry.activate(ghost),
            Err(GuidanceError::UnknownPlugin(_))
        ));

        let id = running(&registry, "platoon");
        registry
            .report_fault(id, FaultCause::Operator("sensor check".into()))
            .unwrap();
        let err = registry.activate(id).unwrap_err();
        assert!(matches!(
            err,
            GuidanceError::InvalidTransition {
                from: PluginState::Faulted,
                action: LifecycleAction::Activate,
                ..
            }
        ));
    }

    #[test]
    fn second_deactivate_fails_without_changing_state() {
        let registry = PluginRegistry::new();
        let id = running(&registry, "cruise");
        registry.deactivate(id).unwrap();
        assert_eq!(registry.state(id).unwrap(), PluginState::Deactivated);
        let err = registry.deactivate(id).unwrap_err();
        assert!(matches!(
            err,
            GuidanceError::InvalidTransition {
                from: PluginState::Deactivated,
                ..
            }
        ));
        assert_eq!(registry.state(id).unwrap(), PluginState::Deactivated);
    }

    #[test]
    fn mid_cycle_requests_wait_for_the_boundary() {
        let registry = PluginRegistry::new();
        let keep = running(&registry, "a");
        let stop = running(&registry, "b");
        let fail = running(&registry, "c");

        let boundary = registry.begin_cycle(5);
        assert_eq!(boundary.active().len(), 3);
        registry.deactivate(stop).unwrap();
        registry
            .report_fault(fail, FaultCause::ConsecutiveMisses(3))
            .unwrap();
        // Snapshot and live state are untouched while the cycle runs.
        assert_eq!(registry.list_active().len(), 3);
        assert_eq!(registry.state(stop).unwrap(), PluginState::Running);
        assert_eq!(
            registry.status(stop).unwrap().pending,
            Some(PluginState::Deactivated)
        );
        // A second request against a deferred transition is refused.
        assert!(registry.deactivate(stop).is_err());
        drop(boundary);

        let active: Vec<PluginId> = registry.list_active().iter().map(|p| p.id).collect();
        assert_eq!(active, vec![keep]);
        assert_eq!(registry.state(stop).unwrap(), PluginState::Deactivated);
        let failed = registry.status(fail).unwrap();
        assert_eq!(failed.state, PluginState::Faulted);
        assert_eq!(failed.fault, Some(FaultCause::ConsecutiveMisses(3)));
    }

    #[test]
    fn fault_overrides_deferred_deactivation() {
        let registry = PluginRegistry::new();
        let id = running(&registry, "a");
        let boundary = registry.begin_cycle(1);
        registry.deactivate(id).unwrap();
        registry
            .report_fault(id, FaultCause::Panicked("boom".into()))
            .unwrap();
        drop(boundary);
        assert_eq!(registry.state(id).unwrap(), PluginState::Faulted);
    }

    #[test]
    fn reset_returns_faulted_plugin_to_registered() {
        let registry = PluginRegistry::new();
        let id = running(&registry, "a");
        registry.record_miss(id);
        registry
            .report_fault(id, FaultCause::Operator("manual".into()))
            .unwrap();
        assert!(registry.list_active().is_empty());
        registry.reset(id).unwrap();
        let status = registry.status(id).unwrap();
        assert_eq!(status.state, PluginState::Registered);
        assert_eq!(status.consecutive_misses, 0);
        assert!(registry.reset(id).is_err());
    }

    #[test]
    fn list_active_keeps_registration_order() {
        let registry = PluginRegistry::new();
        let ids: Vec<PluginId> = ["z", "m", "a"]
            .iter()
            .map(|name| registry.register(descriptor(name), Arc::new(Idle)).unwrap())
            .collect();
        for id in ids.iter().rev() {
            registry.activate(*id).unwrap();
        }
        drop(registry.begin_cycle(0));
        let active: Vec<PluginId> = registry.list_active().iter().map(|p| p.id).collect();
        assert_eq!(active, ids);
    }

    #[test]
    fn miss_streak_resets_on_response() {
        let registry = PluginRegistry::new();
        let id = running(&registry, "a");
        assert_eq!(registry.record_miss(id), 1);
        assert_eq!(registry.record_miss(id), 2);
        registry.record_response(id, 9);
        let status = registry.status(id).unwrap();
        assert_eq!(status.consecutive_misses, 0);
        assert_eq!(status.last_response_cycle, Some(9));
    }

    #[test]
    fn transitions_and_faults_are_reported() {
        let sink = Arc::new(MemoryLogSink::new(64));
        let telemetry = GuidanceTelemetry::builder("registry-test")
            .log_sink(sink.clone())
            .build()
            .unwrap();
        let registry = PluginRegistry::new().with_telemetry(telemetry);
        let id = running(&registry, "a");
        registry
            .report_fault(id, FaultCause::Operator("audit".into()))
            .unwrap();
        let faults = sink.find("plugin.fault");
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].metadata["plugin"]["name"], "a");
        // activate, start, fault
        assert_eq!(sink.find("plugin.transition").len(), 3);
    }
}
