use std::fmt;

use serde::{Deserialize, Serialize};

use super::proposal::{Proposal, TrajectorySegment};
use crate::plugin::{ManeuverType, PluginIdentity};

/// Why a plugin did not contribute the selected maneuver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// Validity window does not cover the cycle.
    Expired,
    /// Maneuver type was not declared at registration.
    CapabilityMismatch,
    /// Nothing usable arrived this cycle; the fail-safe was issued.
    NoValidProposal,
    /// Missed the proposal deadline.
    PluginTimeout,
    /// Returned an error instead of a proposal.
    PluginFailure,
    /// Proposal failed structural checks or the plugin panicked.
    Malformed,
    /// Explicitly declined to propose.
    Abstained,
    /// Valid, but another candidate ranked higher.
    Outranked,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Expired => "expired",
            Self::CapabilityMismatch => "capability_mismatch",
            Self::NoValidProposal => "no_valid_proposal",
            Self::PluginTimeout => "plugin_timeout",
            Self::PluginFailure => "plugin_failure",
            Self::Malformed => "malformed",
            Self::Abstained => "abstained",
            Self::Outranked => "outranked",
        };
        f.write_str(label)
    }
}

/// One plugin's rejection for a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// Rejected plugin.
    pub plugin: PluginIdentity,
    /// Reason code.
    pub reason: RejectionReason,
    /// Free-form detail.
    pub detail: String,
}

impl Rejection {
    /// Creates a rejection.
    #[must_use]
    pub fn new(plugin: PluginIdentity, reason: RejectionReason, detail: impl Into<String>) -> Self {
        Self {
            plugin,
            reason,
            detail: detail.into(),
        }
    }
}

/// Winning proposal and the plugin that supplied it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    /// Contributing plugin.
    pub plugin: PluginIdentity,
    /// The proposal as submitted.
    pub proposal: Proposal,
}

/// Outcome of one arbitration cycle. Exactly one is issued per executed cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitrationDecision {
    /// Cycle index.
    pub cycle: u64,
    /// Maneuver to execute.
    pub maneuver: ManeuverType,
    /// Target motion.
    pub trajectory: TrajectorySegment,
    /// Winning plugin, absent for the fail-safe decision.
    pub selected: Option<Selection>,
    /// Every solicited plugin that did not win, in registration order.
    pub rejections: Vec<Rejection>,
}

impl ArbitrationDecision {
    pub(crate) fn selected(cycle: u64, selection: Selection, rejections: Vec<Rejection>) -> Self {
        Self {
            cycle,
            maneuver: selection.proposal.maneuver.clone(),
            trajectory: selection.proposal.trajectory,
            selected: Some(selection),
            rejections,
        }
    }

    /// Minimal-risk hold issued when no plugin produced a usable proposal.
    #[must_use]
    pub const fn fail_safe(cycle: u64, rejections: Vec<Rejection>) -> Self {
        Self {
            cycle,
            maneuver: ManeuverType::MinimalRisk,
            trajectory: TrajectorySegment::hold(),
            selected: None,
            rejections,
        }
    }

    /// Whether this is the fail-safe decision.
    #[must_use]
    pub const fn is_fail_safe(&self) -> bool {
        self.selected.is_none()
    }

    /// Plugin that contributed the selected maneuver.
    #[must_use]
    pub fn contributor(&self) -> Option<&PluginIdentity> {
        self.selected.as_ref().map(|selection| &selection.plugin)
    }

    /// Rejection recorded for `plugin`, if any.
    #[must_use]
    pub fn rejection_for(&self, plugin: &PluginIdentity) -> Option<&Rejection> {
        self.rejections
            .iter()
            .find(|rejection| &rejection.plugin == plugin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitration::proposal::ValidityWindow;

    #[test]
    fn fail_safe_is_minimal_risk_hold() {
        let plugin = PluginIdentity::new("cruise", "1.0");
        let decision = ArbitrationDecision::fail_safe(
            7,
            vec![Rejection::new(
                plugin.clone(),
                RejectionReason::NoValidProposal,
                "abstained",
            )],
        );
        assert!(decision.is_fail_safe());
        assert_eq!(decision.maneuver, ManeuverType::MinimalRisk);
        assert_eq!(decision.trajectory, TrajectorySegment::hold());
        assert_eq!(decision.contributor(), None);
        assert_eq!(
            decision.rejection_for(&plugin).map(|r| r.reason),
            Some(RejectionReason::NoValidProposal)
        );
    }

    #[test]
    fn selected_decision_copies_the_winning_maneuver() {
        let proposal = Proposal::new(
            ManeuverType::LaneChange,
            TrajectorySegment::new(22.0, -1, 80.0),
            ValidityWindow::single(3),
        );
        let plugin = PluginIdentity::new("lane", "2.1");
        let decision = ArbitrationDecision::selected(
            3,
            Selection {
                plugin: plugin.clone(),
                proposal,
            },
            Vec::new(),
        );
        assert!(!decision.is_fail_safe());
        assert_eq!(decision.maneuver, ManeuverType::LaneChange);
        assert_eq!(decision.trajectory.lane_offset, -1);
        assert_eq!(decision.contributor(), Some(&plugin));
    }

    #[test]
    fn reason_codes_serialize_in_snake_case() {
        let value = serde_json::to_value(RejectionReason::CapabilityMismatch).unwrap();
        assert_eq!(value, "capability_mismatch");
        assert_eq!(RejectionReason::PluginTimeout.to_string(), "plugin_timeout");
    }
}
