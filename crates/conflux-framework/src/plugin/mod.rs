//! Plugin authoring surface.
//!
//! # Architecture
//!
//! A [`PluginDefinition`] is the immutable blueprint of a plugin, assembled
//! with [`PluginDefinition::builder`].  It bundles:
//!
//! - **Schemas** for config, context, event payloads and method signatures.
//! - **Lifecycle hooks** (`on_start`, `on_stop`, `on_error`).
//! - **Effects**: ordered handlers that mutate the plugin's own context.
//! - **Services**: background tasks consuming the plugin's event queue.
//! - **Interceptors**: middleware on the event path into the plugin.
//! - **Methods**: schema-checked calls exposed to dependents.
//!
//! The [`PluginManager`](crate::manager::PluginManager) turns definitions into
//! live instances and hands plugin code one of two capability scopes
//! ([`PluginScope`] or [`ServiceScope`]).
//!
//! # Quick start
//!
//! ```rust,ignore
//! use conflux::prelude::*;
//!
//! let ticker = PluginDefinition::builder("ticker")
//!     .events([("tick", None)])
//!     .service("clock", |scope: ServiceScope, _events: EventStream| async move {
//!         let mut interval = tokio::time::interval(Duration::from_secs(1));
//!         while !scope.is_cancelled() {
//!             interval.tick().await;
//!             scope.emit("tick", None)?;
//!         }
//!         Ok::<_, BoxError>(())
//!     })
//!     .build()?;
//! ```

mod definition;
mod handler;
mod scope;

pub use definition::{Dependency, PluginBuilder, PluginDefinition, PluginMetadata};
pub use handler::{EffectCall, MethodCall};
pub use scope::{Capabilities, PluginScope, ServiceScope};
