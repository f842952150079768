//! Event routing between plugin inboxes.
//!
//! Every plugin owns one inbox (an unbounded mpsc channel) drained by a single
//! task.  The [`Router`] maps each plugin to the inboxes of its dependents, so
//! a broadcast from `P` becomes one [`Command::Deliver`] per dependent.  A
//! channel preserves send order, which gives per-(source, target) FIFO.
//!
//! The router also feeds two observer channels used by the agent surface: every
//! emitted event and every plugin failure.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::trace;

use conflux_core::Event;

use crate::error::CallError;
use crate::interceptor::{Relation, SourceInfo};
use crate::lifecycle::{PluginFailure, StateCell};

/// Work items processed by a plugin's inbox task, strictly in order.
pub(crate) enum Command {
    /// An event to run through interceptors, effects and the queue.
    Deliver { source: SourceInfo, event: Event },
    /// A method invocation serialized with effects.
    Call {
        method: String,
        args: Value,
        reply: oneshot::Sender<Result<Value, CallError>>,
    },
}

/// Sending side of one plugin's inbox.
#[derive(Clone)]
pub(crate) struct Inbox {
    pub(crate) plugin: Arc<str>,
    pub(crate) sender: mpsc::UnboundedSender<Command>,
    pub(crate) state: Arc<StateCell>,
}

impl Inbox {
    /// Sends a delivery if the plugin is running; returns whether it was sent.
    pub(crate) fn deliver(&self, source: SourceInfo, event: Event) -> bool {
        if !self.state.get().is_running() {
            trace!(target_plugin = %self.plugin, event = %event.kind(), "Skipping delivery to inactive plugin");
            return false;
        }
        self.sender.send(Command::Deliver { source, event }).is_ok()
    }
}

/// Routes broadcasts from each plugin to its dependents.
pub(crate) struct Router {
    routes: HashMap<String, Vec<Inbox>>,
    events: broadcast::Sender<Event>,
    failures: broadcast::Sender<PluginFailure>,
}

impl Router {
    /// `routes` maps a plugin name to the inboxes of its dependents.
    pub(crate) fn new(routes: HashMap<String, Vec<Inbox>>, buffer: usize) -> Self {
        let (events, _) = broadcast::channel(buffer.max(1));
        let (failures, _) = broadcast::channel(buffer.max(1));
        Self {
            routes,
            events,
            failures,
        }
    }

    /// Delivers a plugin's own event to every running dependent.
    pub(crate) fn broadcast(&self, event: &Event) {
        self.observe(event);
        let Some(targets) = self.routes.get(event.source()) else {
            return;
        };
        for inbox in targets {
            let source = SourceInfo {
                plugin: event.source().to_owned(),
                relation: Relation::Dependency,
            };
            if inbox.deliver(source, event.clone()) {
                trace!(
                    source = %event.source(),
                    target_plugin = %inbox.plugin,
                    event = %event.kind(),
                    id = %event.id(),
                    "Event routed"
                );
            }
        }
    }

    /// Publishes an event to agent-level observers.
    pub(crate) fn observe(&self, event: &Event) {
        // No receivers is not an error.
        let _ = self.events.send(event.clone());
    }

    pub(crate) fn report_failure(&self, failure: PluginFailure) {
        let _ = self.failures.send(failure);
    }

    pub(crate) fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub(crate) fn subscribe_failures(&self) -> broadcast::Receiver<PluginFailure> {
        self.failures.subscribe()
    }
}
