//! Plugin identity, capability declarations and the proposal interface.

/// Lifecycle state machine.
pub mod lifecycle;
/// Registry owning every plugin instance.
pub mod registry;

use std::{collections::BTreeSet, fmt};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::arbitration::proposal::{Proposal, ProposalRequest};

/// Unique plugin identity: name plus version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PluginIdentity {
    /// Plugin name.
    pub name: String,
    /// Plugin version.
    pub version: String,
}

impl PluginIdentity {
    /// Creates an identity.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for PluginIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Registry handle for a plugin. Ids are issued in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PluginId(u64);

impl PluginId {
    pub(crate) const fn from_sequence(sequence: u64) -> Self {
        Self(sequence)
    }

    /// Position in registration order, starting at zero.
    #[must_use]
    pub const fn sequence(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Maneuver families a plugin may propose.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManeuverType {
    /// Stay centred in the current lane.
    LaneKeeping,
    /// Move to an adjacent lane.
    LaneChange,
    /// Adjust longitudinal speed.
    SpeedControl,
    /// Follow a platoon leader.
    Platooning,
    /// Controlled stop.
    Stop,
    /// Fail-safe hold issued by the arbitrator.
    MinimalRisk,
    /// Vendor specific maneuver.
    Custom(String),
}

impl fmt::Display for ManeuverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LaneKeeping => write!(f, "lane_keeping"),
            Self::LaneChange => write!(f, "lane_change"),
            Self::SpeedControl => write!(f, "speed_control"),
            Self::Platooning => write!(f, "platooning"),
            Self::Stop => write!(f, "stop"),
            Self::MinimalRisk => write!(f, "minimal_risk"),
            Self::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

/// Maneuver types a plugin declared at registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet(BTreeSet<ManeuverType>);

impl CapabilitySet {
    /// Empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Adds a maneuver type.
    #[must_use]
    pub fn with(mut self, maneuver: ManeuverType) -> Self {
        self.0.insert(maneuver);
        self
    }

    /// Whether the maneuver was declared.
    #[must_use]
    pub fn contains(&self, maneuver: &ManeuverType) -> bool {
        self.0.contains(maneuver)
    }

    /// Iterates declared maneuvers in a stable order.
    pub fn iter(&self) -> impl Iterator<Item = &ManeuverType> {
        self.0.iter()
    }

    /// Number of declared maneuvers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing was declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<ManeuverType> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = ManeuverType>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Static description supplied when a plugin is registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Name and version.
    pub identity: PluginIdentity,
    /// Declared maneuver types.
    pub capabilities: CapabilitySet,
}

impl PluginDescriptor {
    /// Creates a descriptor without capabilities.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            identity: PluginIdentity::new(name, version),
            capabilities: CapabilitySet::new(),
        }
    }

    /// Declares a maneuver type.
    #[must_use]
    pub fn with_capability(mut self, maneuver: ManeuverType) -> Self {
        self.capabilities = self.capabilities.with(maneuver);
        self
    }
}

/// Lifecycle state owned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    /// Known to the registry, not yet activated.
    Registered,
    /// Activation requested; joins arbitration at the next cycle boundary.
    Activated,
    /// Solicited every cycle.
    Running,
    /// Gracefully stopped.
    Deactivated,
    /// Stopped after abnormal behaviour; needs an operator reset.
    Faulted,
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Registered => "registered",
            Self::Activated => "activated",
            Self::Running => "running",
            Self::Deactivated => "deactivated",
            Self::Faulted => "faulted",
        };
        f.write_str(label)
    }
}

/// Why a plugin was moved to [`PluginState::Faulted`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultCause {
    /// Missed the proposal deadline this many cycles in a row.
    ConsecutiveMisses(u32),
    /// Returned a proposal that failed structural checks.
    MalformedProposal(String),
    /// The proposal task panicked.
    Panicked(String),
    /// Reported by an operator or external monitor.
    Operator(String),
}

impl fmt::Display for FaultCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConsecutiveMisses(n) => write!(f, "missed {n} consecutive cycles"),
            Self::MalformedProposal(detail) => write!(f, "malformed proposal: {detail}"),
            Self::Panicked(detail) => write!(f, "panicked: {detail}"),
            Self::Operator(detail) => write!(f, "operator: {detail}"),
        }
    }
}

/// Failures a plugin may report instead of a proposal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PluginError {
    /// Inputs the plugin depends on are not available.
    #[error("plugin unavailable: {0}")]
    Unavailable(String),
    /// Anything else.
    #[error("plugin internal error: {0}")]
    Internal(String),
}

/// Maneuver proposal source. Implementations are opaque to the arbitrator.
#[async_trait]
pub trait GuidancePlugin: Send + Sync {
    /// Produces this cycle's proposal, or `None` to abstain.
    async fn propose(&self, request: &ProposalRequest) -> Result<Option<Proposal>, PluginError>;
}
