//! Runtime error types.

use std::sync::Arc;

use conflux_framework::{CallError, PluginError, ResolveError};
use thiserror::Error;

pub use crate::config::{ConfigError, ConfigResult};

/// Errors surfaced by the agent.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The plugin set could not be resolved or instantiated.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// A method call made through the agent failed.
    #[error(transparent)]
    Call(#[from] CallError),

    /// No plugin with this name is part of the agent.
    #[error("Plugin not found: {0}")]
    UnknownPlugin(String),

    /// Plugins did not reach `running` and the agent halts on plugin errors.
    #[error("Plugins failed to start: {}", plugins.join(", "))]
    StartFailed { plugins: Vec<String> },

    /// A plugin failed while running and the agent halts on plugin errors.
    #[error("Plugin `{plugin}` failed: {error}")]
    PluginFailed {
        plugin: String,
        error: Arc<PluginError>,
    },

    /// The agent was stopped; agents are not restartable.
    #[error("Agent has been stopped")]
    Stopped,
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
