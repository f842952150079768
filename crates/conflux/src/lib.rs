//! # Conflux
//!
//! A plugin runtime where isolated plugins cooperate through events, methods
//! and reactive context.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐ emit ┌────────┐      ┌──────────────────────────────────────────────┐
//! │ Plugin P │─────▶│ Router │─────▶│ Plugin D (own inbox task, own context)       │
//! └──────────┘      └────────┘      │   interceptors ─▶ effects ─▶ context          │
//!      ▲                            │                └─▶ queue ─▶ services          │
//!      └──── methods, read-only ────└──────────────────────────────────────────────┘
//!            context, directed emit
//! ```
//!
//! - **Plugins** own a schema-validated context that only their own effects,
//!   hooks and methods can write.
//! - **Dependents** see their dependencies through bindings: read-only context,
//!   methods, and directed events.
//! - **Interceptors** sit in front of a plugin's effects and services and
//!   decide per event whether to forward, transform or drop it.
//! - The **agent** resolves dependencies into start layers, runs lifecycle
//!   hooks in order and stops everything in reverse.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use conflux::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let counter = PluginDefinition::builder("counter")
//!         .context(Schema::object([("count", Schema::Integer)]), json!({ "count": 0 }))
//!         .events([("increment", None)])
//!         .effect("count", |scope: PluginScope, _event: Event| async move {
//!             scope.context().update_as("count", |n: i64| n + 1)?;
//!             Ok::<_, BoxError>(())
//!         })
//!         .build()?;
//!
//!     Agent::builder().plugin(counter).build()?.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `toml-config` *(default)*: `conflux.toml` configuration files
//! - `yaml-config`: `conflux.yaml` configuration files
//! - `json-log`: JSON log output

pub use conflux_core as core;
pub use conflux_framework as framework;
pub use conflux_runtime as runtime;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use conflux::prelude::*;
/// ```
pub mod prelude {
    // Agent - main entry point
    pub use conflux_runtime::{Agent, AgentConfig, ConfigLoader, RuntimeError, RuntimeResult};

    // Plugin definitions and the scopes handed to plugin code
    pub use conflux_framework::{
        BoxError, Dependency, DependencyBinding, Intercept, InterceptTarget, Interceptor,
        PluginDefinition, PluginError, PluginMetadata, PluginScope, PluginState, Relation,
        ServiceScope,
    };

    // Values flowing between plugins
    pub use conflux_core::{
        ContextHandle, ContextView, Event, EventStream, MethodSignature, Schema, ValidationError,
    };
}
