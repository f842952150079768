//! Live plugin instances.
//!
//! An [`Instance`] owns everything one plugin needs at runtime: its validated
//! config, its context store, its event queue, its dependency bindings and its
//! inbox.  A single inbox task processes deliveries and method calls strictly
//! in order, so effects and methods of one plugin never run concurrently.
//!
//! ```text
//! Deliver ──► interceptors ──► effects ──► EventQueue ──► services
//! Call    ──► method ──► reply
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::future;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use conflux_core::{ContextHandle, Event, EventId, EventQueue};

use crate::dependency::Dependencies;
use crate::error::{
    CallError, DeliveryError, DeliveryStage, EmitError, Hook, LifecycleError, PluginError,
};
use crate::interceptor::{Decision, Intercept, Relation, SourceInfo};
use crate::lifecycle::{PluginFailure, PluginState, StateCell};
use crate::plugin::{EffectCall, MethodCall, PluginDefinition, PluginScope, ServiceScope};
use crate::routing::{Command, Inbox, Router};

tokio::task_local! {
    /// Name of the plugin whose serialized execution the current task is in.
    static SERIALIZED: Arc<str>;
}

pub(crate) struct Instance {
    pub(crate) name: Arc<str>,
    pub(crate) definition: PluginDefinition,
    pub(crate) config: Arc<Value>,
    pub(crate) context: ContextHandle,
    pub(crate) queue: EventQueue,
    pub(crate) token: CancellationToken,
    pub(crate) dependencies: Dependencies,
    pub(crate) router: Arc<Router>,
    pub(crate) inbox: Inbox,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Instance {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        definition: PluginDefinition,
        config: Value,
        context: ContextHandle,
        dependencies: Dependencies,
        router: Arc<Router>,
        inbox: Inbox,
        receiver: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        Self {
            name: Arc::clone(&inbox.plugin),
            queue: EventQueue::new(definition.name()),
            definition,
            config: Arc::new(config),
            context,
            token: CancellationToken::new(),
            dependencies,
            router,
            inbox,
            receiver: Mutex::new(Some(receiver)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn state(&self) -> &Arc<StateCell> {
        &self.inbox.state
    }

    // ─── Emission ────────────────────────────────────────────────────────────

    /// Builds a validated event of this plugin's namespace, sent by `source`.
    pub(crate) fn event(
        &self,
        source: &str,
        kind: &str,
        data: Option<Value>,
        urgent: bool,
    ) -> Result<Event, EmitError> {
        let data = self.validate_event(kind, data)?;
        Ok(Event::emitted(source, kind, data, urgent))
    }

    /// Checks `kind` and `data` against this plugin's event declarations and
    /// returns the normalized payload.
    pub(crate) fn validate_event(
        &self,
        kind: &str,
        data: Option<Value>,
    ) -> Result<Option<Value>, EmitError> {
        let Some(schema) = self.definition.event_schema(kind) else {
            return Err(EmitError::UnknownEvent {
                plugin: self.name.to_string(),
                event: kind.to_owned(),
            });
        };
        match (schema, data) {
            (None, None) => Ok(None),
            (None, Some(_)) => Err(EmitError::Validation {
                event: kind.to_owned(),
                source: conflux_core::ValidationError::root("event carries no payload"),
            }),
            (Some(schema), data) => schema
                .validate(&data.unwrap_or(Value::Null))
                .map(Some)
                .map_err(|source| EmitError::Validation {
                    event: kind.to_owned(),
                    source,
                }),
        }
    }

    /// Broadcasts one of this plugin's own events to its dependents.
    pub(crate) fn emit(
        &self,
        kind: &str,
        data: Option<Value>,
        urgent: bool,
    ) -> Result<EventId, EmitError> {
        let state = self.state().get();
        if !state.is_running() {
            return Err(EmitError::NotRunning {
                plugin: self.name.to_string(),
                state,
            });
        }
        let event = self.event(&self.name, kind, data, urgent)?;
        let id = event.id().clone();
        self.router.broadcast(&event);
        Ok(id)
    }

    // ─── Method calls ────────────────────────────────────────────────────────

    /// Calls a method through the plugin's inbox.
    pub(crate) async fn call(
        this: &Arc<Self>,
        method: &str,
        args: Value,
    ) -> Result<Value, CallError> {
        let state = this.state().get();
        if !state.is_running() {
            return Err(CallError::NotRunning {
                plugin: this.name.to_string(),
                state,
            });
        }
        let Some(signature) = this.definition.method_signature(method) else {
            return Err(CallError::UnknownMethod {
                plugin: this.name.to_string(),
                method: method.to_owned(),
            });
        };
        let reentrant = SERIALIZED
            .try_with(|current| **current == *this.name)
            .unwrap_or(false);
        if reentrant {
            return Err(CallError::Reentrant {
                plugin: this.name.to_string(),
                method: method.to_owned(),
            });
        }
        let args = signature
            .args
            .validate(&args)
            .map_err(|source| CallError::Arguments {
                plugin: this.name.to_string(),
                method: method.to_owned(),
                source,
            })?;

        let (reply, response) = oneshot::channel();
        this.inbox
            .sender
            .send(Command::Call {
                method: method.to_owned(),
                args,
                reply,
            })
            .map_err(|_| CallError::Closed(this.name.to_string()))?;
        response
            .await
            .map_err(|_| CallError::Closed(this.name.to_string()))?
    }

    async fn invoke(self: &Arc<Self>, method: &str, args: Value) -> Result<Value, CallError> {
        let Some(entry) = self.definition.method(method) else {
            return Err(CallError::UnknownMethod {
                plugin: self.name.to_string(),
                method: method.to_owned(),
            });
        };
        trace!(plugin = %self.name, method, "Invoking method");
        let call = MethodCall {
            scope: PluginScope::new(Arc::clone(self)),
            args,
        };
        let value = entry
            .service
            .clone()
            .oneshot(call)
            .await
            .map_err(|source| CallError::Failed {
                plugin: self.name.to_string(),
                method: method.to_owned(),
                source,
            })?;
        entry
            .signature
            .returns
            .validate(&value)
            .map_err(|source| CallError::Returns {
                plugin: self.name.to_string(),
                method: method.to_owned(),
                source,
            })
    }

    // ─── Delivery ────────────────────────────────────────────────────────────

    async fn deliver(self: &Arc<Self>, source: SourceInfo, event: Event) {
        let Some(event) = self.intercept(&source, event).await else {
            return;
        };

        for effect in &self.definition.inner.effects {
            let call = EffectCall {
                scope: PluginScope::new(Arc::clone(self)),
                event: event.clone(),
            };
            if let Err(source) = effect.service.clone().oneshot(call).await {
                self.fail(
                    DeliveryError {
                        plugin: self.name.to_string(),
                        event: Some(event.kind().to_owned()),
                        stage: DeliveryStage::Effect(effect.name.to_string()),
                        source,
                    }
                    .into(),
                )
                .await;
                return;
            }
        }

        if self.queue.push(event).is_err() {
            trace!(plugin = %self.name, "Queue closed; event not queued");
        }
    }

    /// Runs the interceptor chain; `None` when the event was dropped.
    ///
    /// An event leaving the chain must still match the declarations of the
    /// namespace it belongs to; a mismatch fails this plugin.
    async fn intercept(self: &Arc<Self>, source: &SourceInfo, mut event: Event) -> Option<Event> {
        let mut last = None;
        for entry in &self.definition.inner.interceptors {
            if !entry.target.matches(&source.plugin) {
                continue;
            }
            let (call, decision) = Intercept::new(
                Arc::clone(&entry.name),
                event.clone(),
                source.clone(),
                ServiceScope::new(Arc::clone(self)),
            );
            if let Err(error) = entry.handler.intercept(call).await {
                self.fail(
                    DeliveryError {
                        plugin: self.name.to_string(),
                        event: Some(event.kind().to_owned()),
                        stage: DeliveryStage::Interceptor(entry.name.to_string()),
                        source: error,
                    }
                    .into(),
                )
                .await;
                return None;
            }
            let settled = decision.lock().take();
            match settled {
                Some(Decision::Next(next)) => {
                    event = next;
                    last = Some(&entry.name);
                }
                Some(Decision::Drop(reason)) => {
                    debug!(
                        plugin = %self.name,
                        interceptor = %entry.name,
                        event = %event.kind(),
                        %reason,
                        "Event dropped by interceptor"
                    );
                    return None;
                }
                None => {
                    warn!(
                        plugin = %self.name,
                        interceptor = %entry.name,
                        event = %event.kind(),
                        "Interceptor neither forwarded nor dropped the event; treating as dropped"
                    );
                    return None;
                }
            }
        }
        let Some(interceptor) = last else {
            return Some(event);
        };

        let owner = match source.relation {
            Relation::Dependency => self.dependencies.get(&source.plugin).map(|d| d.target()),
            Relation::Dependent => Some(self),
        };
        let checked = match owner {
            Some(owner) => owner.validate_event(event.kind(), event.data().cloned()),
            None => Err(EmitError::UnknownEvent {
                plugin: source.plugin.clone(),
                event: event.kind().to_owned(),
            }),
        };
        match checked {
            Ok(data) => Some(event.with_data(data)),
            Err(error) => {
                self.fail(
                    DeliveryError {
                        plugin: self.name.to_string(),
                        event: Some(event.kind().to_owned()),
                        stage: DeliveryStage::Interceptor(interceptor.to_string()),
                        source: error.into(),
                    }
                    .into(),
                )
                .await;
                None
            }
        }
    }

    // ─── Failure ─────────────────────────────────────────────────────────────

    /// Transitions to `Errored`, tears down delivery and runs `on_error`.
    ///
    /// Only the first failure is reported; later ones are logged.
    pub(crate) async fn fail(self: &Arc<Self>, error: PluginError) {
        if !self.state().fail() {
            warn!(plugin = %self.name, %error, "Error after plugin already stopped or failed");
            return;
        }
        error!(plugin = %self.name, %error, "Plugin failed");
        self.token.cancel();
        self.queue.close();

        let error = Arc::new(error);
        self.router.report_failure(PluginFailure {
            plugin: self.name.to_string(),
            error: Arc::clone(&error),
        });
        if let Some(on_error) = &self.definition.inner.on_error {
            let scope = PluginScope::new(Arc::clone(self));
            let result = SERIALIZED
                .scope(Arc::clone(&self.name), on_error(scope, error))
                .await;
            if let Err(hook_error) = result {
                error!(plugin = %self.name, error = %hook_error, "on_error hook failed");
            }
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    /// Runs `on_start`, then launches the inbox and services.
    pub(crate) async fn start(self: &Arc<Self>) {
        if let Err(state) = self.state().transition(PluginState::Created, PluginState::Starting) {
            debug!(plugin = %self.name, %state, "Skipping start");
            return;
        }

        for dependency in self.dependencies.iter() {
            let state = dependency.state();
            if !state.is_running() {
                self.fail(
                    LifecycleError::DependencyUnavailable {
                        plugin: self.name.to_string(),
                        dependency: dependency.name().to_owned(),
                        state,
                    }
                    .into(),
                )
                .await;
                return;
            }
        }

        if let Some(on_start) = &self.definition.inner.on_start {
            let scope = PluginScope::new(Arc::clone(self));
            let result = SERIALIZED.scope(Arc::clone(&self.name), on_start(scope)).await;
            if let Err(source) = result {
                self.fail(
                    LifecycleError::Hook {
                        plugin: self.name.to_string(),
                        hook: Hook::Start,
                        source,
                    }
                    .into(),
                )
                .await;
                return;
            }
        }

        let Some(receiver) = self.receiver.lock().take() else {
            return;
        };
        // Cursors are attached before `Running` so services miss nothing.
        let streams: Vec<_> = self
            .definition
            .inner
            .services
            .iter()
            .map(|entry| (entry.clone(), self.queue.subscribe()))
            .collect();

        let inbox = tokio::spawn(
            SERIALIZED
                .scope(Arc::clone(&self.name), Arc::clone(self).run_inbox(receiver))
                .instrument(info_span!("plugin", plugin = %self.name)),
        );
        self.tasks.lock().push(inbox);

        if let Err(state) = self.state().transition(PluginState::Starting, PluginState::Running) {
            debug!(plugin = %self.name, %state, "Plugin left Starting before it could run");
            return;
        }

        for (entry, stream) in streams {
            let this = Arc::clone(self);
            let scope = ServiceScope::new(Arc::clone(self));
            let span = info_span!("service", plugin = %self.name, service = %entry.name);
            let task = tokio::spawn(
                async move {
                    match (entry.run)(scope, stream).await {
                        Ok(()) => debug!("Service finished"),
                        // Calls into the closed inbox fail while stopping.
                        Err(source) if this.state().get() == PluginState::Stopping => {
                            warn!(error = %source, "Service ended with an error while stopping");
                        }
                        Err(source) => {
                            this.fail(
                                DeliveryError {
                                    plugin: this.name.to_string(),
                                    event: None,
                                    stage: DeliveryStage::Service(entry.name.to_string()),
                                    source,
                                }
                                .into(),
                            )
                            .await;
                        }
                    }
                }
                .instrument(span),
            );
            self.tasks.lock().push(task);
        }

        info!(
            plugin = %self.name,
            version = self.definition.metadata().version.as_deref().unwrap_or("-"),
            "Plugin started"
        );
    }

    async fn run_inbox(self: Arc<Self>, mut receiver: mpsc::UnboundedReceiver<Command>) {
        loop {
            let command = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                command = receiver.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            match command {
                Command::Deliver { source, event } => {
                    if !self.state().get().is_running() {
                        continue;
                    }
                    trace!(source = %source.plugin, event = %event.kind(), id = %event.id(), "Delivering");
                    self.deliver(source, event).await;
                }
                Command::Call {
                    method,
                    args,
                    reply,
                } => {
                    let result = self.invoke(&method, args).await;
                    let _ = reply.send(result);
                }
            }
        }
        trace!("Inbox closed");
    }

    /// Stops delivery, waits for the inbox and services, then runs `on_stop`.
    pub(crate) async fn stop(self: &Arc<Self>, timeout: Duration) {
        let was_running = match self.state().get() {
            PluginState::Running => self
                .state()
                .transition(PluginState::Running, PluginState::Stopping)
                .is_ok(),
            PluginState::Created => {
                let _ = self.state().transition(PluginState::Created, PluginState::Stopped);
                false
            }
            _ => false,
        };

        self.token.cancel();
        self.queue.close();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        if !tasks.is_empty() {
            let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
            if tokio::time::timeout(timeout, future::join_all(tasks)).await.is_err() {
                warn!(
                    plugin = %self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Tasks did not finish in time; aborting"
                );
                for abort in aborts {
                    abort.abort();
                }
            }
        }

        if !was_running {
            return;
        }

        if let Some(on_stop) = &self.definition.inner.on_stop {
            let scope = PluginScope::new(Arc::clone(self));
            let result = SERIALIZED.scope(Arc::clone(&self.name), on_stop(scope)).await;
            if let Err(source) = result {
                self.fail(
                    LifecycleError::Hook {
                        plugin: self.name.to_string(),
                        hook: Hook::Stop,
                        source,
                    }
                    .into(),
                )
                .await;
                return;
            }
        }

        if self
            .state()
            .transition(PluginState::Stopping, PluginState::Stopped)
            .is_ok()
        {
            info!(plugin = %self.name, "Plugin stopped");
        }
    }
}
