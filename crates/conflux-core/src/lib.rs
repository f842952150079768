//! # Conflux Core
//!
//! Leaf building blocks of the Conflux plugin runtime.
//!
//! - **Schema**: declarative value shapes and their validator ([`Schema`])
//! - **Events**: immutable, validated events with emission ids ([`Event`])
//! - **Context**: reactive per-plugin state with writable and read-only
//!   capabilities ([`ContextHandle`], [`ContextView`])
//! - **Queue**: per-plugin asynchronous event queue with independent
//!   consumer cursors ([`EventQueue`], [`EventStream`])
//!
//! Nothing in this crate knows about plugins or agents; the framework layer
//! composes these pieces into plugin instances.
//!
//! ```text
//! emit ──▶ Event ──▶ effects ──▶ ContextHandle ──▶ on_change callbacks
//!                └─▶ EventQueue ──▶ EventStream (one per service)
//! ```

pub mod context;
pub mod error;
pub mod event;
pub mod queue;
pub mod schema;

pub use context::{ContextHandle, ContextView, Subscription};
pub use error::{QueueClosed, ValidationError, ValidationResult};
pub use event::{Event, EventId};
pub use queue::{EventQueue, EventStream};
pub use schema::{MethodSignature, ObjectSchema, Schema};
