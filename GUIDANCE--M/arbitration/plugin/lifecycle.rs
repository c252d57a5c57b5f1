use std::fmt;

use serde::{Deserialize, Serialize};

use super::{FaultCause, PluginState};

/// Requests accepted by the lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    /// Ask for the plugin to join arbitration.
    Activate,
    /// Cycle boundary promotion of an activated plugin.
    Start,
    /// Graceful stop.
    Deactivate,
    /// Abnormal stop.
    Fault,
    /// Operator reset of a faulted plugin.
    Reset,
}

impl fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Activate => "activate",
            Self::Start => "start",
            Self::Deactivate => "deactivate",
            Self::Fault => "fault",
            Self::Reset => "reset",
        };
        f.write_str(label)
    }
}

/// Transition table. `None` means the action is not allowed from `from`.
#[must_use]
pub const fn next_state(from: PluginState, action: LifecycleAction) -> Option<PluginState> {
    use LifecycleAction as A;
    use PluginState as S;
    match (from, action) {
        (S::Registered | S::Deactivated, A::Activate) => Some(S::Activated),
        (S::Activated, A::Start) => Some(S::Running),
        (S::Activated | S::Running, A::Deactivate) => Some(S::Deactivated),
        (S::Registered | S::Activated | S::Running | S::Deactivated, A::Fault) => Some(S::Faulted),
        (S::Faulted, A::Reset) => Some(S::Registered),
        _ => None,
    }
}

/// Transition held back until the in-flight cycle ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Deferred {
    Deactivate,
    Fault(FaultCause),
}

impl Deferred {
    pub(crate) const fn target(&self) -> PluginState {
        match self {
            Self::Deactivate => PluginState::Deactivated,
            Self::Fault(_) => PluginState::Faulted,
        }
    }
}
