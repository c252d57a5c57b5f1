#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Guidance plugin core: lifecycle registry, per-cycle arbitration and the service
//! locator handed to plugins.

/// Proposal solicitation, screening and selection.
#[path = "../arbitration/main.rs"]
pub mod arbitration;

/// Configuration loading and validation.
#[path = "../config.rs"]
pub mod config;

/// Fixed-period control loop.
#[path = "../cycle/main.rs"]
pub mod cycle;

/// Error types.
#[path = "../error.rs"]
pub mod error;

/// Capability-scoped plugin access.
#[path = "../locator.rs"]
pub mod locator;

/// Plugin identity, capabilities, lifecycle and registry.
#[path = "../plugin/main.rs"]
pub mod plugin;

/// Structured events and log fan-out.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Runtime entrypoints and wiring.
#[path = "../main.rs"]
pub mod orchestration_entry;

pub use arbitration::decision::{ArbitrationDecision, Rejection, RejectionReason, Selection};
pub use arbitration::proposal::{Proposal, ProposalRequest, TrajectorySegment, ValidityWindow};
pub use arbitration::selection::{rank, select_winner, Candidate};
pub use arbitration::Arbitrator;
pub use config::{ArbitrationConfig, GuidanceConfig, PubSubConfig, TelemetryConfig};
pub use cycle::{maker::CycleSchedulerBuilder, CycleScheduler, SchedulerHandle, SchedulerMetrics};
pub use error::GuidanceError;
pub use locator::{ArbitratorService, GuidancePlatform, PluginManagementService, PluginServiceLocator};
pub use orchestration_entry::GuidanceRuntime;
pub use plugin::lifecycle::LifecycleAction;
pub use plugin::registry::{ActivePlugin, CycleBoundary, PluginRegistry, PluginStatus};
pub use plugin::{
    CapabilitySet, FaultCause, GuidancePlugin, ManeuverType, PluginDescriptor, PluginError,
    PluginId, PluginIdentity, PluginState,
};
pub use telemetry::{GuidanceEvent, GuidanceTelemetry, GuidanceTelemetryBuilder};
