//! # Conflux Framework
//!
//! Plugin composition on top of `conflux-core`.
//!
//! This layer provides:
//! - Plugin definitions built with a fluent, one-shot-facet builder
//! - Capability scopes: writable for a plugin's own code, read-only for
//!   services, interceptors and dependents
//! - Interceptor chains with an explicit `next` / `drop` continuation
//! - Dependency resolution (start layers, cycle reporting) and binding
//! - The plugin manager: instantiation, lifecycle and event routing
//!
//! ```text
//! P.emit(e) ──► Router ──► D.inbox ──► interceptors ──► effects ──► context
//!                                                   └─► queue ──► services
//! ```

pub mod dependency;
pub mod error;
pub mod interceptor;
pub mod lifecycle;
pub mod manager;
pub mod plugin;
pub mod resolve;

mod instance;
mod routing;

pub use dependency::{Dependencies, DependencyBinding};
pub use error::{
    BoxError, CallError, CyclicDependencyError, DefinitionError, DeliveryError, DeliveryStage,
    EmitError, Hook, LifecycleError, PluginError, ResolveError,
};
pub use interceptor::{Intercept, InterceptTarget, Interceptor, Relation, SourceInfo};
pub use lifecycle::{PluginFailure, PluginState};
pub use manager::{ManagerOptions, PluginManager, PluginSummary};
pub use plugin::{
    Capabilities, Dependency, EffectCall, MethodCall, PluginBuilder, PluginDefinition,
    PluginMetadata, PluginScope, ServiceScope,
};
