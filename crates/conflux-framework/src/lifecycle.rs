//! Plugin lifecycle states.
//!
//! ```text
//! Created ──► Starting ──► Running ──► Stopping ──► Stopped
//!    │            │           │            │
//!    └────────────┴───────────┴────────────┴──► Errored
//! ```
//!
//! A plugin only emits and receives events while [`PluginState::Running`].

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::PluginError;

/// Lifecycle state of a plugin instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginState {
    /// Instantiated: dependencies bound, config and context validated.
    Created,
    /// `on_start` is running.
    Starting,
    /// Services launched, event delivery enabled.
    Running,
    /// Services told to stop, queue closed, `on_stop` pending.
    Stopping,
    /// Fully stopped.
    Stopped,
    /// Terminal failure state.
    Errored,
}

impl PluginState {
    /// Returns `true` for [`Running`](Self::Running).
    pub fn is_running(self) -> bool {
        self == Self::Running
    }

    /// Returns `true` once the plugin can no longer change state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Errored)
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// Shared, atomically updated state of one plugin.
#[derive(Debug)]
pub(crate) struct StateCell(RwLock<PluginState>);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(RwLock::new(PluginState::Created))
    }

    pub(crate) fn get(&self) -> PluginState {
        *self.0.read()
    }

    /// Moves `from → to`; returns the actual state when it was not `from`.
    pub(crate) fn transition(&self, from: PluginState, to: PluginState) -> Result<(), PluginState> {
        let mut state = self.0.write();
        if *state != from {
            return Err(*state);
        }
        *state = to;
        Ok(())
    }

    /// Moves to `Errored` unless already terminal; returns whether it did.
    pub(crate) fn fail(&self) -> bool {
        let mut state = self.0.write();
        if state.is_terminal() {
            return false;
        }
        *state = PluginState::Errored;
        true
    }
}

/// Broadcast whenever a plugin transitions to [`PluginState::Errored`].
#[derive(Debug, Clone)]
pub struct PluginFailure {
    /// The failed plugin.
    pub plugin: String,
    /// The error that was handed to its `on_error` hook.
    pub error: Arc<PluginError>,
}
