//! Event interception middleware.
//!
//! Every event delivered to a plugin first passes through that plugin's
//! interceptors whose [`InterceptTarget`] matches the event's source, in
//! registration order.  Each interceptor must settle the event exactly once:
//!
//! - [`Intercept::next`] / [`Intercept::forward`] continue the chain with a
//!   (possibly transformed) event;
//! - [`Intercept::drop`] stops the chain, so neither effects nor services of
//!   the receiving plugin see the event.
//!
//! A second settlement is ignored with a warning.  An interceptor that returns
//! without settling is treated as an implicit drop, also with a warning.
//!
//! # Example
//!
//! ```rust,ignore
//! PluginDefinition::builder("gate")
//!     .interceptor("only-123", |call: Intercept| async move {
//!         if call.event.field("userId") == Some(&json!("123")) {
//!             call.forward();
//!         } else {
//!             call.drop("unknown user");
//!         }
//!         Ok::<_, BoxError>(())
//!     })
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::warn;

use conflux_core::Event;

use crate::error::BoxError;
use crate::plugin::ServiceScope;

// =============================================================================
// Interceptor trait
// =============================================================================

/// Middleware on the event path into a plugin.
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    /// Inspects `call.event` and settles it through `call`.
    async fn intercept(&self, call: Intercept) -> Result<(), BoxError>;
}

#[async_trait]
impl<F, Fut, E> Interceptor for F
where
    F: Fn(Intercept) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError>,
{
    async fn intercept(&self, call: Intercept) -> Result<(), BoxError> {
        (self)(call).await.map_err(Into::into)
    }
}

// =============================================================================
// Targets and sources
// =============================================================================

/// Which event sources an interceptor applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterceptTarget {
    /// Every incoming event.
    Any,
    /// Only events coming from the named plugin.
    Source(String),
}

impl InterceptTarget {
    pub(crate) fn matches(&self, source: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Source(name) => name == source,
        }
    }
}

/// How the source of an event relates to the receiving plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// A dependency broadcast one of its own events.
    Dependency,
    /// A dependent sent an event into this plugin's namespace.
    Dependent,
}

/// Describes where an intercepted event came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    /// Name of the emitting plugin.
    pub plugin: String,
    /// Its relation to the receiving plugin.
    pub relation: Relation,
}

// =============================================================================
// Intercept
// =============================================================================

#[derive(Debug, Clone)]
pub(crate) enum Decision {
    Next(Event),
    Drop(String),
}

/// One interceptor invocation.
pub struct Intercept {
    /// The event as left by the previous interceptor.
    pub event: Event,
    /// Where the event came from.
    pub source: SourceInfo,
    /// Read-only capabilities of the receiving plugin.
    pub scope: ServiceScope,
    interceptor: Arc<str>,
    decision: Arc<Mutex<Option<Decision>>>,
}

impl Intercept {
    pub(crate) fn new(
        interceptor: Arc<str>,
        event: Event,
        source: SourceInfo,
        scope: ServiceScope,
    ) -> (Self, Arc<Mutex<Option<Decision>>>) {
        let decision = Arc::new(Mutex::new(None));
        let call = Self {
            event,
            source,
            scope,
            interceptor,
            decision: Arc::clone(&decision),
        };
        (call, decision)
    }

    /// Continues the chain with `event`.
    pub fn next(&self, event: Event) {
        self.settle(Decision::Next(event));
    }

    /// Continues the chain with the event unchanged.
    pub fn forward(&self) {
        self.settle(Decision::Next(self.event.clone()));
    }

    /// Stops the chain.
    pub fn drop(&self, reason: impl Into<String>) {
        self.settle(Decision::Drop(reason.into()));
    }

    /// Returns `true` once `next`, `forward` or `drop` has been called.
    pub fn is_settled(&self) -> bool {
        self.decision.lock().is_some()
    }

    fn settle(&self, decision: Decision) {
        let mut slot = self.decision.lock();
        if slot.is_some() {
            warn!(
                plugin = %self.scope.name(),
                interceptor = %self.interceptor,
                event = %self.event.kind(),
                "Interceptor settled an event twice; ignoring the second call"
            );
            return;
        }
        *slot = Some(decision);
    }
}

impl fmt::Debug for Intercept {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Intercept")
            .field("interceptor", &self.interceptor)
            .field("event", &self.event)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// A named interceptor stored in a plugin definition.
#[derive(Clone)]
pub(crate) struct InterceptorEntry {
    pub(crate) name: Arc<str>,
    pub(crate) target: InterceptTarget,
    pub(crate) handler: Arc<dyn Interceptor>,
}
