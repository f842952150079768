//! Error types for the Conflux framework.
//!
//! Errors are contained at the plugin boundary: failures inside one plugin are
//! reported to that plugin's `on_error` hook (as a [`PluginError`]) and never
//! propagate into the plugin that emitted the triggering event.

use std::fmt;

use thiserror::Error;

use conflux_core::ValidationError;

use crate::lifecycle::PluginState;

/// Error type returned by user-supplied handlers.
pub use tower::BoxError;

// =============================================================================
// Definition Errors
// =============================================================================

/// A plugin definition was assembled incorrectly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    /// The plugin name is empty.
    #[error("plugin name must not be empty")]
    EmptyName,

    /// A one-shot facet was set more than once.
    #[error("plugin '{plugin}': facet '{facet}' is already set")]
    FacetAlreadySet {
        /// Plugin being defined.
        plugin: String,
        /// The facet that was set twice.
        facet: &'static str,
    },

    /// Two members of the same kind share a name.
    #[error("plugin '{plugin}': duplicate {kind} '{name}'")]
    DuplicateMember {
        /// Plugin being defined.
        plugin: String,
        /// Member kind (`method`, `effect`, `service`, `interceptor`, `event`).
        kind: &'static str,
        /// The repeated name.
        name: String,
    },
}

// =============================================================================
// Resolve Errors
// =============================================================================

/// The plugin dependency graph contains a cycle.
///
/// `cycle` lists the plugins along the cycle with the first one repeated at the
/// end (`["a", "b", "a"]`; a self-dependency is `["a", "a"]`).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cyclic plugin dependency: {}", cycle.join(" -> "))]
pub struct CyclicDependencyError {
    /// Plugins along the cycle.
    pub cycle: Vec<String>,
}

/// Structural errors detected while composing plugins into an agent.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    /// The dependency graph has a cycle.
    #[error(transparent)]
    Cycle(#[from] CyclicDependencyError),

    /// A plugin depends on a name that no supplied plugin carries.
    #[error("plugin '{plugin}' depends on unknown plugin '{dependency}'")]
    UnknownDependency {
        /// The depending plugin.
        plugin: String,
        /// The missing dependency name.
        dependency: String,
    },

    /// An interceptor filters on a plugin that can never send it events.
    #[error(
        "plugin '{plugin}': interceptor '{interceptor}' targets '{target}', \
         which is neither a dependency nor a dependent"
    )]
    UnreachableInterceptor {
        /// The plugin declaring the interceptor.
        plugin: String,
        /// The interceptor.
        interceptor: String,
        /// The source plugin it filters on.
        target: String,
    },

    /// Two different definitions share a name.
    #[error("two different plugins are named '{0}'")]
    DuplicatePlugin(String),

    /// A plugin's config or initial context does not match its schema.
    #[error("plugin '{plugin}' has invalid {facet}: {source}")]
    Validation {
        /// The plugin concerned.
        plugin: String,
        /// `config` or `context`.
        facet: &'static str,
        /// Underlying mismatch.
        #[source]
        source: ValidationError,
    },
}

// =============================================================================
// Delivery Errors
// =============================================================================

/// Where in the delivery path a failure happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStage {
    /// Inside the named interceptor.
    Interceptor(String),
    /// Inside the named effect.
    Effect(String),
    /// Inside the named service.
    Service(String),
}

impl fmt::Display for DeliveryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interceptor(name) => write!(f, "interceptor '{name}'"),
            Self::Effect(name) => write!(f, "effect '{name}'"),
            Self::Service(name) => write!(f, "service '{name}'"),
        }
    }
}

/// A handler on the receiving side of an event failed.
#[derive(Debug, Error)]
#[error("plugin '{plugin}': {stage} failed{}: {source}", event_suffix(.event))]
pub struct DeliveryError {
    /// The plugin whose handler failed.
    pub plugin: String,
    /// Type of the event being processed, if any (services fail outside events).
    pub event: Option<String>,
    /// The failing handler.
    pub stage: DeliveryStage,
    /// Error returned by the handler.
    #[source]
    pub source: BoxError,
}

fn event_suffix(event: &Option<String>) -> String {
    match event {
        Some(kind) => format!(" on event '{kind}'"),
        None => String::new(),
    }
}

// =============================================================================
// Lifecycle Errors
// =============================================================================

/// Which lifecycle hook failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    /// `on_start`
    Start,
    /// `on_stop`
    Stop,
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => f.write_str("on_start"),
            Self::Stop => f.write_str("on_stop"),
        }
    }
}

/// A plugin could not complete a lifecycle transition.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// A lifecycle hook returned an error.
    #[error("plugin '{plugin}': {hook} failed: {source}")]
    Hook {
        /// The plugin concerned.
        plugin: String,
        /// The failing hook.
        hook: Hook,
        /// Error returned by the hook.
        #[source]
        source: BoxError,
    },

    /// A dependency was not running when the plugin tried to start.
    #[error("plugin '{plugin}': dependency '{dependency}' is {state}, not running")]
    DependencyUnavailable {
        /// The plugin concerned.
        plugin: String,
        /// The unavailable dependency.
        dependency: String,
        /// The dependency's state at the time.
        state: PluginState,
    },
}

// =============================================================================
// PluginError
// =============================================================================

/// The error handed to a plugin's `on_error` hook.
#[derive(Debug, Error)]
pub enum PluginError {
    /// A value failed schema validation inside the plugin.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// An interceptor, effect or service failed.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// A lifecycle transition failed.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

// =============================================================================
// Emit Errors
// =============================================================================

/// An event could not be emitted.
#[derive(Debug, Clone, Error)]
pub enum EmitError {
    /// The emitting plugin is not running.
    #[error("plugin '{plugin}' cannot emit while {state}")]
    NotRunning {
        /// The emitting plugin.
        plugin: String,
        /// Its current state.
        state: PluginState,
    },

    /// The dependency a directed event was sent to is not running.
    #[error("plugin '{plugin}' is {state} and cannot receive events")]
    TargetUnavailable {
        /// The receiving plugin.
        plugin: String,
        /// Its current state.
        state: PluginState,
    },

    /// The event type is not declared in the target namespace.
    #[error("plugin '{plugin}' declares no event '{event}'")]
    UnknownEvent {
        /// Owner of the event namespace.
        plugin: String,
        /// The undeclared event type.
        event: String,
    },

    /// The payload does not match the declared schema.
    #[error("invalid payload for event '{event}': {source}")]
    Validation {
        /// The event type.
        event: String,
        /// Underlying mismatch.
        #[source]
        source: ValidationError,
    },
}

// =============================================================================
// Call Errors
// =============================================================================

/// A method call across plugins failed.
#[derive(Debug, Error)]
pub enum CallError {
    /// No plugin with this name exists.
    #[error("unknown plugin '{0}'")]
    UnknownPlugin(String),

    /// The plugin exposes no method with this name.
    #[error("plugin '{plugin}' has no method '{method}'")]
    UnknownMethod {
        /// Target plugin.
        plugin: String,
        /// The missing method.
        method: String,
    },

    /// The plugin is not running.
    #[error("plugin '{plugin}' is {state}, not running")]
    NotRunning {
        /// Target plugin.
        plugin: String,
        /// Its current state.
        state: PluginState,
    },

    /// The call would wait on the plugin's own serialized execution.
    #[error("plugin '{plugin}' cannot call its own method '{method}' from an effect, hook or method")]
    Reentrant {
        /// The calling (and target) plugin.
        plugin: String,
        /// The method.
        method: String,
    },

    /// The arguments do not match the method signature.
    #[error("invalid arguments for '{plugin}.{method}': {source}")]
    Arguments {
        /// Target plugin.
        plugin: String,
        /// The method.
        method: String,
        /// Underlying mismatch.
        #[source]
        source: ValidationError,
    },

    /// The return value does not match the method signature.
    #[error("invalid return value from '{plugin}.{method}': {source}")]
    Returns {
        /// Target plugin.
        plugin: String,
        /// The method.
        method: String,
        /// Underlying mismatch.
        #[source]
        source: ValidationError,
    },

    /// The method implementation returned an error.
    #[error("'{plugin}.{method}' failed: {source}")]
    Failed {
        /// Target plugin.
        plugin: String,
        /// The method.
        method: String,
        /// Error returned by the implementation.
        #[source]
        source: BoxError,
    },

    /// The plugin stopped before answering.
    #[error("plugin '{0}' stopped before answering")]
    Closed(String),
}
