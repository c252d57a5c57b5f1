use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use super::decision::ArbitrationDecision;
use crate::plugin::ManeuverType;

/// Inclusive range of cycle indices a proposal applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidityWindow {
    /// First cycle the proposal is valid for.
    pub start_cycle: u64,
    /// Last cycle the proposal is valid for.
    pub end_cycle: u64,
}

impl ValidityWindow {
    /// Window from `start_cycle` to `end_cycle`, both inclusive.
    #[must_use]
    pub const fn new(start_cycle: u64, end_cycle: u64) -> Self {
        Self {
            start_cycle,
            end_cycle,
        }
    }

    /// Window covering exactly one cycle.
    #[must_use]
    pub const fn single(cycle: u64) -> Self {
        Self::new(cycle, cycle)
    }

    /// Whether `cycle` lies inside the window.
    #[must_use]
    pub const fn covers(&self, cycle: u64) -> bool {
        self.start_cycle <= cycle && cycle <= self.end_cycle
    }
}

/// Target motion over the planning horizon.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrajectorySegment {
    /// Speed to reach by the end of the segment, m/s.
    pub target_speed_mps: f64,
    /// Lane offset relative to the current lane; negative is left.
    pub lane_offset: i32,
    /// Distance covered by the segment, metres.
    pub horizon_m: f64,
}

impl TrajectorySegment {
    /// Creates a segment.
    #[must_use]
    pub const fn new(target_speed_mps: f64, lane_offset: i32, horizon_m: f64) -> Self {
        Self {
            target_speed_mps,
            lane_offset,
            horizon_m,
        }
    }

    /// Minimal-risk hold: keep the lane and come to a stop.
    #[must_use]
    pub const fn hold() -> Self {
        Self::new(0.0, 0, 0.0)
    }

    fn check(&self) -> Result<(), String> {
        if !self.target_speed_mps.is_finite() || self.target_speed_mps < 0.0 {
            return Err(format!("target speed {} is not a valid speed", self.target_speed_mps));
        }
        if !self.horizon_m.is_finite() || self.horizon_m < 0.0 {
            return Err(format!("horizon {} is not a valid distance", self.horizon_m));
        }
        Ok(())
    }
}

/// A plugin's candidate maneuver for the current planning horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    /// Maneuver family; must be one the plugin declared.
    pub maneuver: ManeuverType,
    /// Target motion.
    pub trajectory: TrajectorySegment,
    /// Cycles the proposal applies to.
    pub validity: ValidityWindow,
    /// Larger wins.
    pub priority: i32,
    /// Self-assessed confidence in `[0, 1]`.
    pub confidence: f64,
}

impl Proposal {
    /// Creates a proposal with priority 0 and full confidence.
    #[must_use]
    pub const fn new(
        maneuver: ManeuverType,
        trajectory: TrajectorySegment,
        validity: ValidityWindow,
    ) -> Self {
        Self {
            maneuver,
            trajectory,
            validity,
            priority: 0,
            confidence: 1.0,
        }
    }

    /// Sets the priority hint.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the confidence score.
    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    /// Structural checks independent of the cycle being arbitrated.
    pub fn check(&self) -> Result<(), String> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!("confidence {} outside [0, 1]", self.confidence));
        }
        if self.validity.start_cycle > self.validity.end_cycle {
            return Err(format!(
                "validity window {}..={} is inverted",
                self.validity.start_cycle, self.validity.end_cycle
            ));
        }
        self.trajectory.check()
    }
}

/// What a plugin is asked for each cycle.
#[derive(Debug, Clone)]
pub struct ProposalRequest {
    /// Cycle being arbitrated.
    pub cycle: u64,
    /// Time the plugin has to answer.
    pub deadline: Duration,
    /// Decision issued for the previous cycle.
    pub previous: Option<Arc<ArbitrationDecision>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lane_keep() -> Proposal {
        Proposal::new(
            ManeuverType::LaneKeeping,
            TrajectorySegment::new(25.0, 0, 120.0),
            ValidityWindow::new(3, 5),
        )
    }

    #[test]
    fn window_is_inclusive() {
        let window = ValidityWindow::new(3, 5);
        assert!(!window.covers(2));
        assert!(window.covers(3));
        assert!(window.covers(5));
        assert!(!window.covers(6));
        assert!(ValidityWindow::single(9).covers(9));
    }

    #[test]
    fn well_formed_proposal_passes() {
        assert!(lane_keep().with_confidence(0.0).check().is_ok());
        assert!(lane_keep().with_confidence(1.0).check().is_ok());
    }

    #[test]
    fn malformed_fields_are_reported() {
        assert!(lane_keep().with_confidence(1.5).check().is_err());
        assert!(lane_keep().with_confidence(f64::NAN).check().is_err());

        let mut inverted = lane_keep();
        inverted.validity = ValidityWindow::new(6, 2);
        assert!(inverted.check().unwrap_err().contains("inverted"));

        let mut runaway = lane_keep();
        runaway.trajectory.target_speed_mps = f64::INFINITY;
        assert!(runaway.check().is_err());
    }
}
