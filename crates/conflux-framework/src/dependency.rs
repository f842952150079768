//! Dependency bindings.
//!
//! A [`DependencyBinding`] is a dependent's capability-restricted handle onto
//! one dependency: a read-only context view, schema-checked method calls, and
//! a directed `emit` into the dependency's event namespace.  Directed events
//! are always sent *as the dependent*: their source is the dependent's name.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use conflux_core::{ContextView, EventId, ValidationError};

use crate::error::{CallError, EmitError};
use crate::instance::Instance;
use crate::interceptor::{Relation, SourceInfo};
use crate::lifecycle::{PluginState, StateCell};

/// A dependent's handle onto one dependency.
#[derive(Clone)]
pub struct DependencyBinding {
    dependent: Arc<str>,
    dependent_state: Arc<StateCell>,
    target: Arc<Instance>,
}

impl DependencyBinding {
    pub(crate) fn new(
        dependent: Arc<str>,
        dependent_state: Arc<StateCell>,
        target: Arc<Instance>,
    ) -> Self {
        Self {
            dependent,
            dependent_state,
            target,
        }
    }

    pub(crate) fn target(&self) -> &Arc<Instance> {
        &self.target
    }

    /// Returns the dependency's name.
    pub fn name(&self) -> &str {
        &self.target.name
    }

    /// Returns the dependency's lifecycle state.
    pub fn state(&self) -> PluginState {
        self.target.state().get()
    }

    /// Read-only view of the dependency's context.
    pub fn context(&self) -> ContextView {
        self.target.context.view()
    }

    /// Calls a method of the dependency.
    ///
    /// Arguments and return value are validated against the method signature.
    pub async fn call(&self, method: &str, args: Value) -> Result<Value, CallError> {
        Instance::call(&self.target, method, args).await
    }

    /// Typed variant of [`call`](Self::call).
    pub async fn call_as<A, R>(&self, method: &str, args: &A) -> Result<R, CallError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let args = serde_json::to_value(args).map_err(|e| CallError::Arguments {
            plugin: self.target.name.to_string(),
            method: method.to_owned(),
            source: ValidationError::from(e),
        })?;
        let value = self.call(method, args).await?;
        serde_json::from_value(value).map_err(|e| CallError::Returns {
            plugin: self.target.name.to_string(),
            method: method.to_owned(),
            source: ValidationError::from(e),
        })
    }

    /// Sends one of the dependency's declared events into the dependency.
    ///
    /// The payload is validated against the dependency's event schema; the
    /// event passes the dependency's interceptor chain like any other.
    pub fn emit(&self, kind: &str, data: impl Into<Option<Value>>) -> Result<EventId, EmitError> {
        self.send(kind, data.into(), false)
    }

    /// Like [`emit`](Self::emit), but the event jumps ahead of queued events.
    pub fn emit_urgent(
        &self,
        kind: &str,
        data: impl Into<Option<Value>>,
    ) -> Result<EventId, EmitError> {
        self.send(kind, data.into(), true)
    }

    fn send(&self, kind: &str, data: Option<Value>, urgent: bool) -> Result<EventId, EmitError> {
        let state = self.dependent_state.get();
        if !state.is_running() {
            return Err(EmitError::NotRunning {
                plugin: self.dependent.to_string(),
                state,
            });
        }
        let event = self.target.event(&self.dependent, kind, data, urgent)?;
        let target_state = self.target.state().get();
        if !target_state.is_running() {
            return Err(EmitError::TargetUnavailable {
                plugin: self.target.name.to_string(),
                state: target_state,
            });
        }
        let id = event.id().clone();
        self.target.router.observe(&event);
        let source = SourceInfo {
            plugin: self.dependent.to_string(),
            relation: Relation::Dependent,
        };
        self.target.inbox.deliver(source, event);
        Ok(id)
    }
}

impl std::fmt::Debug for DependencyBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyBinding")
            .field("dependent", &self.dependent)
            .field("dependency", &self.target.name)
            .finish()
    }
}

/// All dependency bindings of one plugin, in declaration order.
#[derive(Clone, Debug, Default)]
pub struct Dependencies {
    bindings: Vec<DependencyBinding>,
}

impl Dependencies {
    pub(crate) fn new(bindings: Vec<DependencyBinding>) -> Self {
        Self { bindings }
    }

    /// Returns the binding onto the named dependency.
    pub fn get(&self, name: &str) -> Option<&DependencyBinding> {
        self.bindings.iter().find(|b| b.name() == name)
    }

    /// Iterates over all bindings.
    pub fn iter(&self) -> impl Iterator<Item = &DependencyBinding> {
        self.bindings.iter()
    }

    /// Returns the number of dependencies.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Returns `true` if the plugin has no dependencies.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
