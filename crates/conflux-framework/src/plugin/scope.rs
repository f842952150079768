//! Capability scopes handed to plugin code.
//!
//! Two capability-restricted views exist over one plugin instance:
//!
//! | Scope | Given to | Context |
//! |-------|----------|---------|
//! | [`PluginScope`] | hooks, effects, methods | writable [`ContextHandle`] |
//! | [`ServiceScope`] | services, interceptors | read-only [`ContextView`] |
//!
//! Both dereference to [`Capabilities`], the part they share: name, config,
//! dependency bindings, `emit` and the cancellation signal.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use conflux_core::{ContextHandle, ContextView, EventId, ValidationError};

use crate::dependency::{DependencyBinding, Dependencies};
use crate::error::{CallError, EmitError};
use crate::instance::Instance;
use crate::lifecycle::PluginState;

// =============================================================================
// Capabilities
// =============================================================================

/// Capabilities shared by every scope of a plugin.
#[derive(Clone)]
pub struct Capabilities {
    pub(crate) instance: Arc<Instance>,
}

impl Capabilities {
    /// Returns the plugin name.
    pub fn name(&self) -> &str {
        &self.instance.name
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> PluginState {
        self.instance.state().get()
    }

    /// Returns the validated config.
    pub fn config(&self) -> &Value {
        &self.instance.config
    }

    /// Deserialises the validated config into `T`.
    pub fn config_as<T: DeserializeOwned>(&self) -> Result<T, ValidationError> {
        T::deserialize(self.instance.config.as_ref()).map_err(ValidationError::from)
    }

    /// Returns every dependency binding.
    pub fn dependencies(&self) -> &Dependencies {
        &self.instance.dependencies
    }

    /// Returns the binding onto the named dependency.
    pub fn dependency(&self, name: &str) -> Option<&DependencyBinding> {
        self.instance.dependencies.get(name)
    }

    /// Emits one of this plugin's own events to all of its dependents.
    pub fn emit(&self, kind: &str, data: impl Into<Option<Value>>) -> Result<EventId, EmitError> {
        self.instance.emit(kind, data.into(), false)
    }

    /// Like [`emit`](Self::emit), but the event jumps ahead of queued events.
    pub fn emit_urgent(
        &self,
        kind: &str,
        data: impl Into<Option<Value>>,
    ) -> Result<EventId, EmitError> {
        self.instance.emit(kind, data.into(), true)
    }

    /// Cancelled when the plugin stops or fails.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.instance.token
    }

    /// Returns `true` once the plugin has been told to stop.
    pub fn is_cancelled(&self) -> bool {
        self.instance.token.is_cancelled()
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("plugin", &self.instance.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// PluginScope
// =============================================================================

/// Scope of code running inside the plugin's own serialized execution.
#[derive(Clone, Debug)]
pub struct PluginScope {
    caps: Capabilities,
}

impl PluginScope {
    pub(crate) fn new(instance: Arc<Instance>) -> Self {
        Self {
            caps: Capabilities { instance },
        }
    }

    /// Writable access to the plugin's context.
    pub fn context(&self) -> &ContextHandle {
        &self.caps.instance.context
    }
}

impl std::ops::Deref for PluginScope {
    type Target = Capabilities;

    fn deref(&self) -> &Self::Target {
        &self.caps
    }
}

// =============================================================================
// ServiceScope
// =============================================================================

/// Scope of background services and interceptors.
///
/// Context is read-only here; services express mutation intent by emitting
/// events or by calling one of the plugin's own methods.
#[derive(Clone, Debug)]
pub struct ServiceScope {
    caps: Capabilities,
}

impl ServiceScope {
    pub(crate) fn new(instance: Arc<Instance>) -> Self {
        Self {
            caps: Capabilities { instance },
        }
    }

    /// Read-only access to the plugin's context.
    pub fn context(&self) -> ContextView {
        self.caps.instance.context.view()
    }

    /// Calls one of this plugin's own methods.
    ///
    /// The call is serialized with effects, so it must not be awaited from
    /// inside an effect, hook or method of the same plugin.
    pub async fn call(&self, method: &str, args: Value) -> Result<Value, CallError> {
        Instance::call(&self.caps.instance, method, args).await
    }
}

impl std::ops::Deref for ServiceScope {
    type Target = Capabilities;

    fn deref(&self) -> &Self::Target {
        &self.caps
    }
}
