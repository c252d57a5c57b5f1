//! Errors surfaced to callers of the guidance core.

use shared_pubsub::PubSubError;
use thiserror::Error;

use crate::plugin::{lifecycle::LifecycleAction, PluginIdentity, PluginState};

/// Lifecycle misuse and cycle-control failures. None of these are fatal to the platform.
#[derive(Debug, Error)]
pub enum GuidanceError {
    /// A plugin with the same name and version is already registered.
    #[error("plugin {0} is already registered")]
    DuplicateIdentity(PluginIdentity),
    /// The plugin was never registered.
    #[error("unknown plugin {0}")]
    UnknownPlugin(String),
    /// The lifecycle state machine does not allow the requested action.
    #[error("plugin {plugin} cannot {action} while {from}")]
    InvalidTransition {
        /// Plugin the request targeted.
        plugin: PluginIdentity,
        /// State at the time of the request.
        from: PluginState,
        /// Requested action.
        action: LifecycleAction,
    },
    /// Another arbitration is still running.
    #[error("cycle {0} is still arbitrating")]
    CycleInProgress(u64),
    /// The capability layer refused an operation.
    #[error(transparent)]
    Transport(#[from] PubSubError),
    /// Configuration values failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),
}
