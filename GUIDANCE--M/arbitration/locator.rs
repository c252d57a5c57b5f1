//! Capability-scoped access handed to each plugin at construction.

use std::{
    fmt,
    sync::{Arc, Weak},
};

use shared_pubsub::PubSubService;
use tracing::info;

use crate::{
    arbitration::{decision::ArbitrationDecision, Arbitrator},
    error::GuidanceError,
    plugin::{
        registry::{PluginRegistry, PluginStatus},
        GuidancePlugin, PluginDescriptor, PluginId, PluginIdentity, PluginState,
    },
};

// Services hold weak references: the registry owns the plugins that own the locators.

/// Read-only view of the arbitrator.
#[derive(Clone)]
pub struct ArbitratorService {
    arbitrator: Weak<Arbitrator>,
    decision_topic: String,
}

impl ArbitratorService {
    /// Most recently issued decision.
    #[must_use]
    pub fn current_decision(&self) -> Option<Arc<ArbitrationDecision>> {
        self.arbitrator
            .upgrade()
            .and_then(|arbitrator| arbitrator.current_decision())
    }

    /// Index of the most recently completed cycle.
    #[must_use]
    pub fn current_cycle(&self) -> Option<u64> {
        self.arbitrator
            .upgrade()
            .and_then(|arbitrator| arbitrator.current_cycle())
    }

    /// Topic decisions are published on.
    #[must_use]
    pub fn decision_topic(&self) -> &str {
        &self.decision_topic
    }
}

impl fmt::Debug for ArbitratorService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArbitratorService")
            .field("decision_topic", &self.decision_topic())
            .finish()
    }
}

/// Lifecycle access bound to the plugin that owns it.
#[derive(Clone)]
pub struct PluginManagementService {
    registry: Weak<PluginRegistry>,
    identity: PluginIdentity,
}

impl PluginManagementService {
    /// Identity this view is bound to.
    #[must_use]
    pub const fn identity(&self) -> &PluginIdentity {
        &self.identity
    }

    fn resolve(&self) -> Result<(Arc<PluginRegistry>, PluginId), GuidanceError> {
        let unknown = || GuidanceError::UnknownPlugin(self.identity.to_string());
        let registry = self.registry.upgrade().ok_or_else(unknown)?;
        let id = registry.id_of(&self.identity).ok_or_else(unknown)?;
        Ok((registry, id))
    }

    /// Own lifecycle state.
    pub fn state(&self) -> Result<PluginState, GuidanceError> {
        let (registry, id) = self.resolve()?;
        registry.state(id)
    }

    /// Own health record.
    pub fn status(&self) -> Result<PluginStatus, GuidanceError> {
        let (registry, id) = self.resolve()?;
        registry.status(id)
    }

    /// Asks to join arbitration from the next cycle.
    pub fn request_activation(&self) -> Result<(), GuidanceError> {
        let (registry, id) = self.resolve()?;
        registry.activate(id)
    }

    /// Asks to leave arbitration at the next cycle boundary.
    pub fn request_deactivation(&self) -> Result<(), GuidanceError> {
        let (registry, id) = self.resolve()?;
        registry.deactivate(id)
    }

    /// Identities of running peers, excluding this plugin.
    #[must_use]
    pub fn active_peers(&self) -> Vec<PluginIdentity> {
        self.registry
            .upgrade()
            .map(|registry| registry.list_active())
            .unwrap_or_default()
            .into_iter()
            .map(|active| active.identity().clone())
            .filter(|identity| identity != &self.identity)
            .collect()
    }
}

impl fmt::Debug for PluginManagementService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginManagementService")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// The only handle a plugin receives. Immutable once built.
#[derive(Clone)]
pub struct PluginServiceLocator {
    arbitrator: ArbitratorService,
    management: PluginManagementService,
    pubsub: Arc<dyn PubSubService>,
}

impl PluginServiceLocator {
    /// Arbitrator view.
    #[must_use]
    pub const fn arbitrator_service(&self) -> &ArbitratorService {
        &self.arbitrator
    }

    /// Lifecycle view bound to the owning plugin.
    #[must_use]
    pub const fn plugin_management_service(&self) -> &PluginManagementService {
        &self.management
    }

    /// Capability layer.
    #[must_use]
    pub fn pubsub_service(&self) -> Arc<dyn PubSubService> {
        Arc::clone(&self.pubsub)
    }
}

impl fmt::Debug for PluginServiceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginServiceLocator")
            .field("plugin", &self.management.identity)
            .finish_non_exhaustive()
    }
}

/// Platform-side owner of the services plugins are given.
#[derive(Clone)]
pub struct GuidancePlatform {
    registry: Arc<PluginRegistry>,
    arbitrator: Arc<Arbitrator>,
    pubsub: Arc<dyn PubSubService>,
}

impl GuidancePlatform {
    /// Creates the platform.
    #[must_use]
    pub fn new(
        registry: Arc<PluginRegistry>,
        arbitrator: Arc<Arbitrator>,
        pubsub: Arc<dyn PubSubService>,
    ) -> Self {
        Self {
            registry,
            arbitrator,
            pubsub,
        }
    }

    /// Registers a plugin built by `factory` from its own locator.
    ///
    /// The factory is not invoked when the identity is already taken.
    pub fn install<P, F>(
        &self,
        descriptor: PluginDescriptor,
        factory: F,
    ) -> Result<PluginId, GuidanceError>
    where
        P: GuidancePlugin + 'static,
        F: FnOnce(PluginServiceLocator) -> P,
    {
        if self.registry.id_of(&descriptor.identity).is_some() {
            return Err(GuidanceError::DuplicateIdentity(descriptor.identity));
        }
        let locator = self.locator_for(&descriptor.identity);
        let plugin = factory(locator);
        let identity = descriptor.identity.clone();
        let id = self.registry.register(descriptor, Arc::new(plugin))?;
        info!(plugin = %identity, %id, "plugin installed");
        Ok(id)
    }

    fn locator_for(&self, identity: &PluginIdentity) -> PluginServiceLocator {
        PluginServiceLocator {
            arbitrator: ArbitratorService {
                arbitrator: Arc::downgrade(&self.arbitrator),
                decision_topic: self.arbitrator.decision_topic().to_string(),
            },
            management: PluginManagementService {
                registry: Arc::downgrade(&self.registry),
                identity: identity.clone(),
            },
            pubsub: Arc::clone(&self.pubsub),
        }
    }

    /// Full registry access for platform code.
    #[must_use]
    pub const fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Arbitrator owned by the platform.
    #[must_use]
    pub const fn arbitrator(&self) -> &Arc<Arbitrator> {
        &self.arbitrator
    }

    /// Capability layer.
    #[must_use]
    pub fn pubsub(&self) -> Arc<dyn PubSubService> {
        Arc::clone(&self.pubsub)
    }
}

impl fmt::Debug for GuidancePlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuidancePlatform")
            .field("registry", &self.registry)
            .field("arbitrator", &self.arbitrator)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        arbitration::proposal::{Proposal, ProposalRequest, TrajectorySegment, ValidityWindow},
        config::ArbitrationConfig,
        plugin::{ManeuverType, PluginError},
    };
    use async_trait::async_trait;
    use serde_json::json;
    use shared_pubsub::MemoryPubSub;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Keeps its locator and echoes the previous decision's speed.
    struct Follower {
        locator: PluginServiceLocator,
    }

    #[async_trait]
    impl GuidancePlugin for Follower {
        async fn propose(
            &self,
            request: &ProposalRequest,
        ) -> Result<Option<Proposal>, PluginError> {
            let speed = self
                .locator
                .arbitrator_service()
                .current_decision()
                .map_or(10.0, |decision| decision.trajectory.target_speed_mps + 1.0);
            self.locator
                .pubsub_service()
                .publish("follower/speed", json!(speed))
                .await
                .map_err(|err| PluginError::Internal(err.to_string()))?;
            Ok(Some(Proposal::new(
                ManeuverType::SpeedControl,
                TrajectorySegment::new(speed, 0, 40.0),
                ValidityWindow::single(request.cycle),
            )))
        }
    }

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

    fn platform() -> (GuidancePlatform, Arc<MemoryPubSub>) {
        let registry = Arc::new(PluginRegistry::new());
        let bus = Arc::new(MemoryPubSub::new(16));
        let arbitrator = Arc::new(
            Arbitrator::new(Arc::clone(&registry), bus.clone(), ArbitrationConfig::default())
                .unwrap(),
        );
        (GuidancePlatform::new(registry, arbitrator, bus.clone()), bus)
    }

    fn follower() -> PluginDescriptor {
        PluginDescriptor::new("follower", "1.0").with_capability(ManeuverType::SpeedControl)
    }

    #[tokio::test]
    async fn plugin_drives_itself_through_its_locator() {
        let (platform, bus) = platform();
        let mut kept = None;
        platform
            .install(follower(), |locator| {
                kept = Some(locator.clone());
                Follower { locator }
            })
            .unwrap();
        let locator = kept.unwrap();
        let management = locator.plugin_management_service();
        assert_eq!(management.state().unwrap(), PluginState::Registered);
        management.request_activation().unwrap();

        platform.arbitrator().run_cycle().await.unwrap();
        let second = platform.arbitrator().run_cycle().await.unwrap();
        assert!((second.trajectory.target_speed_mps - 11.0).abs() < f64::EPSILON);
        assert_eq!(locator.arbitrator_service().current_cycle(), Some(2));
        assert_eq!(bus.snapshot_topic("follower/speed").len(), 2);

        management.request_deactivation().unwrap();
        assert_eq!(management.state().unwrap(), PluginState::Deactivated);
        assert!(management.request_deactivation().is_err());
    }

    #[test]
    fn peers_are_visible_by_identity_only() {
        let (platform, _) = platform();
        let mut kept = None;
        platform
            .install(PluginDescriptor::new("a", "1"), |locator| {
                kept = Some(locator);
                Idle
            })
            .unwrap();
        let other = platform
            .install(PluginDescriptor::new("b", "1"), |_| Idle)
            .unwrap();
        let a = kept.unwrap();
        a.plugin_management_service().request_activation().unwrap();
        platform.registry().activate(other).unwrap();
        drop(platform.registry().begin_cycle(1));

        let peers = a.plugin_management_service().active_peers();
        assert_eq!(peers, vec![PluginIdentity::new("b", "1")]);
        assert_eq!(
            a.plugin_management_service().identity(),
            &PluginIdentity::new("a", "1")
        );
    }

    #[test]
    fn duplicate_install_never_builds_the_plugin() {
        let (platform, _) = platform();
        platform.install(follower(), |_| Idle).unwrap();
        let built = AtomicBool::new(false);
        let err = platform
            .install(follower(), |_| {
                built.store(true, Ordering::SeqCst);
                Idle
            })
            .unwrap_err();
        assert!(matches!(err, GuidanceError::DuplicateIdentity(_)));
        assert!(!built.load(Ordering::SeqCst));
    }
}
