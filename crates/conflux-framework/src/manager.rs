//! Plugin instantiation, lifecycle and routing.
//!
//! [`PluginManager`] is the central owner of all plugin instances. It:
//!
//! - Collects the supplied [`PluginDefinition`]s (plus every definition they
//!   reference as a dependency) and resolves them into start **layers**; a
//!   dependency cycle is rejected here, before any plugin runs.
//! - Validates each plugin's config section and initial context.
//! - Instantiates plugins in dependency order, binding each dependency to the
//!   already-built instance (read-only context, methods, directed `emit`).
//! - Drives `on_start` layer by layer (plugins of one layer concurrently) and
//!   `on_stop` in reverse layer order.
//! - Wires every plugin's broadcasts to the inboxes of its dependents.
//!
//! # Example
//!
//! ```rust,ignore
//! use conflux_framework::manager::{ManagerOptions, PluginManager};
//!
//! let manager = PluginManager::new(&[counter, producer], &configs, ManagerOptions::default())?;
//! manager.start().await;
//! // …later…
//! manager.stop().await;
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use conflux_core::{ContextHandle, ContextView, Event};

use crate::dependency::{Dependencies, DependencyBinding};
use crate::error::{CallError, ResolveError};
use crate::instance::Instance;
use crate::interceptor::InterceptTarget;
use crate::lifecycle::{PluginFailure, PluginState, StateCell};
use crate::plugin::PluginDefinition;
use crate::resolve;
use crate::routing::{Command, Inbox, Router};

/// Tunables of a [`PluginManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerOptions {
    /// How long `stop` waits for a plugin's services and inbox to finish.
    pub stop_timeout: Duration,
    /// Capacity of the event and failure observer channels.
    pub event_buffer: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_millis(5000),
            event_buffer: 256,
        }
    }
}

/// A snapshot of one plugin for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSummary {
    /// Plugin name.
    pub name: String,
    /// Declared version, if any.
    pub version: Option<String>,
    /// Declared description, if any.
    pub description: Option<String>,
    /// Current lifecycle state.
    pub state: PluginState,
    /// Names of the plugin's dependencies.
    pub dependencies: Vec<String>,
    /// Index of the start layer the plugin belongs to.
    pub layer: usize,
}

/// Owner of all plugin instances of one agent.
pub struct PluginManager {
    instances: Vec<Arc<Instance>>,
    index: HashMap<String, usize>,
    layers: Vec<Vec<usize>>,
    router: Arc<Router>,
    options: ManagerOptions,
}

impl PluginManager {
    /// Resolves, validates and instantiates `plugins`.
    ///
    /// `configs` maps plugin names to raw config input; a missing entry reads
    /// as `null` so that config schemas with defaults can fill it in.
    ///
    /// # Errors
    ///
    /// Any [`ResolveError`]: cycles, unknown dependencies, conflicting names,
    /// interceptors filtering on unrelated plugins, or config/context values
    /// that do not match their schema.
    pub fn new(
        plugins: &[PluginDefinition],
        configs: &HashMap<String, Value>,
        options: ManagerOptions,
    ) -> Result<Self, ResolveError> {
        let definitions = resolve::collect(plugins)?;
        let layers = resolve::topological_layers(&definitions)?;
        let index: HashMap<String, usize> = definitions
            .iter()
            .enumerate()
            .map(|(i, d)| (d.name().to_owned(), i))
            .collect();

        for name in configs.keys() {
            if !index.contains_key(name) {
                warn!(plugin = %name, "Config section names no plugin of this agent");
            }
        }

        let mut related: HashMap<&str, HashSet<&str>> = HashMap::new();
        for def in &definitions {
            for dep in def.dependencies() {
                related.entry(def.name()).or_default().insert(dep.name());
                related.entry(dep.name()).or_default().insert(def.name());
            }
        }
        for def in &definitions {
            for entry in &def.inner.interceptors {
                let InterceptTarget::Source(target) = &entry.target else {
                    continue;
                };
                let reachable = related
                    .get(def.name())
                    .is_some_and(|names| names.contains(target.as_str()));
                if !reachable {
                    return Err(ResolveError::UnreachableInterceptor {
                        plugin: def.name().to_owned(),
                        interceptor: entry.name.to_string(),
                        target: target.clone(),
                    });
                }
            }
        }

        // ── 1. Validate config and initial context ──────────────────────────
        let mut prepared = Vec::with_capacity(definitions.len());
        for def in &definitions {
            let raw = configs.get(def.name()).cloned().unwrap_or(Value::Null);
            let config = match def.config_schema() {
                Some(schema) => schema.validate(&raw).map_err(|source| ResolveError::Validation {
                    plugin: def.name().to_owned(),
                    facet: "config",
                    source,
                })?,
                None => raw,
            };
            let context = ContextHandle::new(
                def.name(),
                def.context_schema().cloned(),
                def.inner.initial_context.clone(),
            )
            .map_err(|source| ResolveError::Validation {
                plugin: def.name().to_owned(),
                facet: "context",
                source,
            })?;
            prepared.push((config, context));
        }

        // ── 2. Inboxes and routes ───────────────────────────────────────────
        let (inboxes, receivers): (Vec<Inbox>, Vec<mpsc::UnboundedReceiver<Command>>) =
            definitions
                .iter()
                .map(|def| {
                    let (sender, receiver) = mpsc::unbounded_channel();
                    let inbox = Inbox {
                        plugin: Arc::from(def.name()),
                        sender,
                        state: Arc::new(StateCell::new()),
                    };
                    (inbox, receiver)
                })
                .unzip();

        let mut routes: HashMap<String, Vec<Inbox>> = HashMap::new();
        for (i, def) in definitions.iter().enumerate() {
            for dep in def.dependencies() {
                let targets = routes.entry(dep.name().to_owned()).or_default();
                if !targets.iter().any(|t| Arc::ptr_eq(&t.state, &inboxes[i].state)) {
                    targets.push(inboxes[i].clone());
                }
            }
        }
        let router = Arc::new(Router::new(routes, options.event_buffer));

        // ── 3. Instantiate in dependency order ──────────────────────────────
        let mut parts: Vec<_> = prepared
            .into_iter()
            .zip(receivers)
            .map(|((config, context), receiver)| Some((config, context, receiver)))
            .collect();
        let mut built: Vec<Option<Arc<Instance>>> = vec![None; definitions.len()];

        for &i in layers.iter().flatten() {
            let Some((config, context, receiver)) = parts[i].take() else {
                continue;
            };
            let def = &definitions[i];
            let mut bindings: Vec<DependencyBinding> = Vec::new();
            for dep in def.dependencies() {
                // Dependencies sit in earlier layers, so they are built already.
                let Some(target) = index.get(dep.name()).and_then(|&j| built[j].clone()) else {
                    continue;
                };
                if bindings.iter().any(|b| b.name() == dep.name()) {
                    continue;
                }
                bindings.push(DependencyBinding::new(
                    Arc::clone(&inboxes[i].plugin),
                    Arc::clone(&inboxes[i].state),
                    target,
                ));
            }
            built[i] = Some(Arc::new(Instance::new(
                def.clone(),
                config,
                context,
                Dependencies::new(bindings),
                Arc::clone(&router),
                inboxes[i].clone(),
                receiver,
            )));
        }

        let instances: Vec<Arc<Instance>> = built.into_iter().flatten().collect();
        info!(
            plugins = instances.len(),
            layers = layers.len(),
            "Plugins instantiated"
        );

        Ok(Self {
            instances,
            index,
            layers,
            router,
            options,
        })
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    /// Starts every plugin, layer by layer.
    ///
    /// Returns the names of plugins that did not reach `Running`.
    pub async fn start(&self) -> Vec<String> {
        for layer in &self.layers {
            future::join_all(layer.iter().map(|&i| self.instances[i].start())).await;
        }
        let failed: Vec<String> = self
            .instances
            .iter()
            .filter(|p| !p.state().get().is_running())
            .map(|p| p.name.to_string())
            .collect();
        if failed.is_empty() {
            info!(plugins = self.instances.len(), "All plugins running");
        } else {
            warn!(failed = ?failed, "Some plugins are not running");
        }
        failed
    }

    /// Stops every plugin in reverse layer order.
    pub async fn stop(&self) {
        let timeout = self.options.stop_timeout;
        for layer in self.layers.iter().rev() {
            future::join_all(layer.iter().map(|&i| self.instances[i].stop(timeout))).await;
        }
        info!("All plugins stopped");
    }

    // ─── Queries ─────────────────────────────────────────────────────────────

    fn instance(&self, name: &str) -> Option<&Arc<Instance>> {
        self.index.get(name).map(|&i| &self.instances[i])
    }

    /// Returns plugin names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.instances.iter().map(|p| p.name.as_ref())
    }

    /// Returns `true` if a plugin with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Returns the definition of the named plugin.
    pub fn definition(&self, name: &str) -> Option<&PluginDefinition> {
        self.instance(name).map(|p| &p.definition)
    }

    /// Returns the lifecycle state of the named plugin.
    pub fn state(&self, name: &str) -> Option<PluginState> {
        self.instance(name).map(|p| p.state().get())
    }

    /// Returns a read-only view of the named plugin's context.
    pub fn context(&self, name: &str) -> Option<ContextView> {
        self.instance(name).map(|p| p.context.view())
    }

    /// Returns the start layers as plugin names.
    pub fn layers(&self) -> Vec<Vec<String>> {
        self.layers
            .iter()
            .map(|l| l.iter().map(|&i| self.instances[i].name.to_string()).collect())
            .collect()
    }

    /// Returns a summary of every plugin in registration order.
    pub fn summaries(&self) -> Vec<PluginSummary> {
        let mut layer_of = vec![0; self.instances.len()];
        for (li, layer) in self.layers.iter().enumerate() {
            for &i in layer {
                layer_of[i] = li;
            }
        }
        self.instances
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let metadata = p.definition.metadata();
                PluginSummary {
                    name: p.name.to_string(),
                    version: metadata.version.clone(),
                    description: metadata.description.clone(),
                    state: p.state().get(),
                    dependencies: p.dependencies.iter().map(|d| d.name().to_owned()).collect(),
                    layer: layer_of[i],
                }
            })
            .collect()
    }

    /// Calls a method of the named plugin.
    pub async fn call(&self, plugin: &str, method: &str, args: Value) -> Result<Value, CallError> {
        let instance = self
            .instance(plugin)
            .ok_or_else(|| CallError::UnknownPlugin(plugin.to_owned()))?;
        Instance::call(instance, method, args).await
    }

    /// Observes every event emitted in the agent.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.router.subscribe_events()
    }

    /// Observes every plugin failure.
    pub fn subscribe_failures(&self) -> broadcast::Receiver<PluginFailure> {
        self.router.subscribe_failures()
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugins", &self.names().collect::<Vec<_>>())
            .field("layers", &self.layers)
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use conflux_core::{EventStream, MethodSignature, Schema};
    use parking_lot::Mutex;
    use serde_json::json;

    use crate::error::{BoxError, DeliveryStage, EmitError, Hook, LifecycleError, PluginError};
    use crate::interceptor::{Intercept, Relation};
    use crate::plugin::{PluginScope, ServiceScope};

    async fn settle<F: Fn() -> bool>(condition: F) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn manager(plugins: &[PluginDefinition]) -> PluginManager {
        PluginManager::new(plugins, &HashMap::new(), ManagerOptions::default()).unwrap()
    }

    fn counter() -> PluginDefinition {
        PluginDefinition::builder("a")
            .context(Schema::object([("count", Schema::Integer)]), json!({ "count": 0 }))
            .events([("increment", None)])
            .effect("count", |scope: PluginScope, event: Event| async move {
                if event.is("increment") {
                    scope.context().update_as("count", |n: i64| n + 1)?;
                }
                Ok::<_, BoxError>(())
            })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_directed_emits_reach_dependency_effects() {
        let a = counter();
        let b = PluginDefinition::builder("b")
            .dependencies([&a])
            .on_start(|_scope: PluginScope| async { Ok::<_, BoxError>(()) })
            .build()
            .unwrap();
        let manager = manager(&[b]);
        assert!(manager.start().await.is_empty());

        // Bindings are only reachable from plugin code; go through a service-less path.
        let b_instance = manager.instance("b").unwrap();
        let binding = b_instance.dependencies.get("a").unwrap();
        for _ in 0..3 {
            binding.emit("increment", None).unwrap();
        }

        let view = manager.context("a").unwrap();
        settle(|| view.get()["count"] == json!(3)).await;
        manager.stop().await;
        assert_eq!(manager.state("a"), Some(PluginState::Stopped));
    }

    #[tokio::test]
    async fn test_broadcast_preserves_emission_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let source = PluginDefinition::builder("src")
            .events([("n", Some(Schema::Integer))])
            .build()
            .unwrap();
        let sink_seen = Arc::clone(&seen);
        let sink = PluginDefinition::builder("sink")
            .dependencies([&source])
            .effect("record", move |_scope: PluginScope, event: Event| {
                let seen = Arc::clone(&sink_seen);
                async move {
                    seen.lock().push(event.data().cloned().unwrap_or_default());
                    Ok::<_, BoxError>(())
                }
            })
            .build()
            .unwrap();
        let manager = manager(&[sink]);
        manager.start().await;

        let src = manager.instance("src").unwrap();
        for n in 0..50 {
            src.emit("n", Some(json!(n)), false).unwrap();
        }
        settle(|| seen.lock().len() == 50).await;
        let expected: Vec<Value> = (0..50).map(|n| json!(n)).collect();
        assert_eq!(*seen.lock(), expected);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_emit_is_not_delivered_to_self() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&hits);
        let solo = PluginDefinition::builder("solo")
            .events([("ping", None)])
            .effect("count", move |_scope: PluginScope, _event: Event| {
                counted.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, BoxError>(()) }
            })
            .build()
            .unwrap();
        let manager = manager(&[solo]);
        manager.start().await;
        manager.instance("solo").unwrap().emit("ping", None, false).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_emit_validation() {
        let source = PluginDefinition::builder("src")
            .events([("n", Some(Schema::Integer)), ("bare", None)])
            .build()
            .unwrap();
        let manager = manager(&[source]);
        let src = manager.instance("src").unwrap();
        assert!(matches!(
            src.emit("n", Some(json!(1)), false),
            Err(EmitError::NotRunning { state: PluginState::Created, .. })
        ));

        manager.start().await;
        assert!(matches!(src.emit("n", Some(json!("x")), false), Err(EmitError::Validation { .. })));
        assert!(matches!(src.emit("bare", Some(json!(1)), false), Err(EmitError::Validation { .. })));
        assert!(matches!(src.emit("nope", None, false), Err(EmitError::UnknownEvent { .. })));
        assert!(src.emit("bare", None, false).is_ok());
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_interceptor_drop_and_transform() {
        let effects = Arc::new(Mutex::new(Vec::new()));
        let queued = Arc::new(Mutex::new(Vec::new()));
        let source = PluginDefinition::builder("src")
            .events([("msg", Some(Schema::object([("userId", Schema::String)])))])
            .build()
            .unwrap();
        let seen = Arc::clone(&effects);
        let received = Arc::clone(&queued);
        let gate = PluginDefinition::builder("gate")
            .dependencies([&source])
            .interceptor_for("only-123", "src", |call: Intercept| async move {
                assert_eq!(call.source.relation, Relation::Dependency);
                if call.event.field("userId") == Some(&json!("123")) {
                    call.forward();
                } else {
                    call.drop("unknown user");
                }
                Ok::<_, BoxError>(())
            })
            .interceptor("tag", |call: Intercept| async move {
                let mut data = call.event.data().cloned().unwrap_or_default();
                data["tagged"] = json!(true);
                call.next(call.event.with_data(data));
                Ok::<_, BoxError>(())
            })
            .effect("record", move |_scope: PluginScope, event: Event| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().push(event.data().cloned().unwrap_or_default());
                    Ok::<_, BoxError>(())
                }
            })
            .service("drain", move |_scope: ServiceScope, events: EventStream| {
                let received = Arc::clone(&received);
                async move {
                    while let Some(event) = events.next().await {
                        received.lock().push(event.field("userId").cloned());
                    }
                    Ok::<_, BoxError>(())
                }
            })
            .build()
            .unwrap();
        let manager = manager(&[gate]);
        manager.start().await;

        let src = manager.instance("src").unwrap();
        for user in ["123", "456", "123"] {
            src.emit("msg", Some(json!({ "userId": user })), false).unwrap();
        }
        settle(|| effects.lock().len() == 2 && queued.lock().len() == 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(
            *effects.lock(),
            vec![
                json!({ "userId": "123", "tagged": true }),
                json!({ "userId": "123", "tagged": true })
            ]
        );
        assert_eq!(*queued.lock(), vec![Some(json!("123")), Some(json!("123"))]);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_rewritten_event_is_checked_against_its_namespace() {
        let effects = Arc::new(Mutex::new(Vec::new()));
        let source = PluginDefinition::builder("src")
            .events([("msg", Some(Schema::object([("userId", Schema::String)])))])
            .build()
            .unwrap();
        let seen = Arc::clone(&effects);
        let sink = PluginDefinition::builder("sink")
            .dependencies([&source])
            .interceptor("rename", |call: Intercept| async move {
                let rewritten = call.event.with_data(json!({ "userId": 5, "extra": true }));
                call.next(rewritten.with_kind("undeclared"));
                Ok::<_, BoxError>(())
            })
            .effect("record", move |_scope: PluginScope, event: Event| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().push(event.kind().to_owned());
                    Ok::<_, BoxError>(())
                }
            })
            .build()
            .unwrap();
        let manager = manager(&[sink]);
        let mut failures = manager.subscribe_failures();
        manager.start().await;

        let src = manager.instance("src").unwrap();
        src.emit("msg", Some(json!({ "userId": "123" })), false).unwrap();

        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.plugin, "sink");
        let PluginError::Delivery(error) = &*failure.error else {
            panic!("unexpected failure: {}", failure.error);
        };
        assert_eq!(error.stage, DeliveryStage::Interceptor("rename".to_owned()));
        assert!(effects.lock().is_empty());
        assert_eq!(manager.state("sink"), Some(PluginState::Errored));
        assert_eq!(manager.state("src"), Some(PluginState::Running));
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_rewritten_payload_is_validated_and_normalized() {
        let effects = Arc::new(Mutex::new(Vec::new()));
        let source = PluginDefinition::builder("src")
            .events([(
                "msg",
                Some(Schema::object([
                    ("userId", Schema::String),
                    ("lang", Schema::String.with_default(json!("en"))),
                ])),
            )])
            .build()
            .unwrap();
        let seen = Arc::clone(&effects);
        let sink = PluginDefinition::builder("sink")
            .dependencies([&source])
            .interceptor("rewrite", |call: Intercept| async move {
                let user = call.event.field("userId").cloned().unwrap_or_default();
                if user == json!("bad") {
                    call.next(call.event.with_data(json!({ "userId": 5 })));
                } else {
                    call.next(call.event.with_data(json!({ "userId": user })));
                }
                Ok::<_, BoxError>(())
            })
            .effect("record", move |_scope: PluginScope, event: Event| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().push(event.data().cloned().unwrap_or_default());
                    Ok::<_, BoxError>(())
                }
            })
            .build()
            .unwrap();
        let manager = manager(&[sink]);
        manager.start().await;

        let src = manager.instance("src").unwrap();
        src.emit("msg", Some(json!({ "userId": "1", "lang": "de" })), false).unwrap();
        settle(|| effects.lock().len() == 1).await;
        assert_eq!(effects.lock()[0], json!({ "userId": "1", "lang": "en" }));

        src.emit("msg", Some(json!({ "userId": "bad" })), false).unwrap();
        settle(|| manager.state("sink") == Some(PluginState::Errored)).await;
        assert_eq!(effects.lock().len(), 1);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_unsettled_interceptor_drops_and_double_settle_keeps_first() {
        let hits = Arc::new(AtomicUsize::new(0));
        let source = PluginDefinition::builder("src")
            .events([("a", None), ("b", None)])
            .build()
            .unwrap();
        let counted = Arc::clone(&hits);
        let sink = PluginDefinition::builder("sink")
            .dependencies([&source])
            .interceptor("picky", |call: Intercept| async move {
                if call.event.is("b") {
                    call.forward();
                    call.drop("too late");
                }
                Ok::<_, BoxError>(())
            })
            .effect("count", move |_scope: PluginScope, event: Event| {
                assert!(event.is("b"));
                counted.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, BoxError>(()) }
            })
            .build()
            .unwrap();
        let manager = manager(&[sink]);
        manager.start().await;
        let src = manager.instance("src").unwrap();
        src.emit("a", None, false).unwrap();
        src.emit("b", None, false).unwrap();
        settle(|| hits.load(Ordering::SeqCst) == 1).await;
        assert_eq!(manager.state("sink"), Some(PluginState::Running));
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_methods_validate_and_serialize() {
        let store = PluginDefinition::builder("store")
            .context(Schema::object([("total", Schema::Integer)]), json!({ "total": 0 }))
            .method(
                "add",
                MethodSignature::new(Schema::Integer, Schema::Integer),
                |scope: PluginScope, args: Value| async move {
                    let n = args.as_i64().unwrap_or_default();
                    scope.context().update_as("total", |t: i64| t + n)?;
                    Ok::<_, BoxError>(scope.context().get()["total"].clone())
                },
            )
            .method(
                "broken",
                MethodSignature::new(Schema::Null.optional(), Schema::String),
                |_scope: PluginScope, _args: Value| async { Ok::<_, BoxError>(json!(42)) },
            )
            .build()
            .unwrap();
        let manager = manager(&[store]);
        assert!(matches!(
            manager.call("store", "add", json!(1)).await,
            Err(CallError::NotRunning { .. })
        ));
        manager.start().await;

        let calls = (0..10).map(|_| manager.call("store", "add", json!(2)));
        for result in future::join_all(calls).await {
            assert!(result.is_ok());
        }
        assert_eq!(manager.context("store").unwrap().get()["total"], json!(20));

        assert!(matches!(
            manager.call("store", "add", json!("two")).await,
            Err(CallError::Arguments { .. })
        ));
        assert!(matches!(
            manager.call("store", "broken", Value::Null).await,
            Err(CallError::Returns { .. })
        ));
        assert!(matches!(
            manager.call("store", "nope", Value::Null).await,
            Err(CallError::UnknownMethod { .. })
        ));
        assert!(matches!(
            manager.call("ghost", "add", json!(1)).await,
            Err(CallError::UnknownPlugin(_))
        ));
        // Method failures are returned to the caller, the plugin keeps running.
        assert_eq!(manager.state("store"), Some(PluginState::Running));
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_reentrant_self_call_rejected() {
        let outcome = Arc::new(Mutex::new(None));
        let recorded = Arc::clone(&outcome);
        let source = PluginDefinition::builder("src").events([("go", None)]).build().unwrap();
        let sink = PluginDefinition::builder("sink")
            .dependencies([&source])
            .method("noop", MethodSignature::default(), |_s: PluginScope, _a: Value| async {
                Ok::<_, BoxError>(Value::Null)
            })
            .effect("self-call", move |scope: PluginScope, _event: Event| {
                let recorded = Arc::clone(&recorded);
                async move {
                    let service = ServiceScope::new(Arc::clone(&scope.instance));
                    let result = service.call("noop", Value::Null).await;
                    *recorded.lock() = Some(matches!(result, Err(CallError::Reentrant { .. })));
                    Ok::<_, BoxError>(())
                }
            })
            .build()
            .unwrap();
        let manager = manager(&[sink]);
        manager.start().await;
        manager.instance("src").unwrap().emit("go", None, false).unwrap();
        settle(|| outcome.lock().is_some()).await;
        assert_eq!(*outcome.lock(), Some(true));
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_service_mutates_through_own_method() {
        let source = PluginDefinition::builder("src").events([("hit", None)]).build().unwrap();
        let sink = PluginDefinition::builder("sink")
            .dependencies([&source])
            .context(Schema::object([("hits", Schema::Integer)]), json!({ "hits": 0 }))
            .method("record", MethodSignature::default(), |scope: PluginScope, _a: Value| async move {
                scope.context().update_as("hits", |n: i64| n + 1)?;
                Ok::<_, BoxError>(Value::Null)
            })
            .service("worker", |scope: ServiceScope, events: EventStream| async move {
                while let Some(_event) = events.next_until(scope.cancellation()).await {
                    scope.call("record", Value::Null).await?;
                }
                Ok::<_, BoxError>(())
            })
            .build()
            .unwrap();
        let manager = manager(&[sink]);
        manager.start().await;
        let src = manager.instance("src").unwrap();
        for _ in 0..4 {
            src.emit("hit", None, false).unwrap();
        }
        let view = manager.context("sink").unwrap();
        settle(|| view.get()["hits"] == json!(4)).await;
        manager.stop().await;
        assert_eq!(manager.state("sink"), Some(PluginState::Stopped));
    }

    #[tokio::test]
    async fn test_effect_failure_errors_plugin_and_calls_on_error() {
        let reported = Arc::new(Mutex::new(None));
        let source = PluginDefinition::builder("src").events([("boom", None)]).build().unwrap();
        let slot = Arc::clone(&reported);
        let sink = PluginDefinition::builder("sink")
            .dependencies([&source])
            .effect("explode", |_scope: PluginScope, _event: Event| async {
                Err::<(), BoxError>("kaboom".into())
            })
            .on_error(move |_scope: PluginScope, error: Arc<PluginError>| {
                let slot = Arc::clone(&slot);
                async move {
                    *slot.lock() = Some(error.to_string());
                    Ok::<_, BoxError>(())
                }
            })
            .build()
            .unwrap();
        let manager = manager(&[sink]);
        let mut failures = manager.subscribe_failures();
        manager.start().await;
        manager.instance("src").unwrap().emit("boom", None, false).unwrap();

        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.plugin, "sink");
        assert!(matches!(*failure.error, PluginError::Delivery(_)));
        settle(|| reported.lock().is_some()).await;
        assert!(reported.lock().as_deref().unwrap().contains("kaboom"));
        assert_eq!(manager.state("sink"), Some(PluginState::Errored));
        // The emitter is unaffected.
        assert_eq!(manager.state("src"), Some(PluginState::Running));
        manager.stop().await;
        assert_eq!(manager.state("sink"), Some(PluginState::Errored));
        assert_eq!(manager.state("src"), Some(PluginState::Stopped));
    }

    #[tokio::test]
    async fn test_start_order_and_stop_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks = |name: &'static str, deps: Vec<PluginDefinition>| {
            let on_start = Arc::clone(&log);
            let on_stop = Arc::clone(&log);
            PluginDefinition::builder(name)
                .dependencies(deps)
                .on_start(move |_s: PluginScope| {
                    on_start.lock().push(format!("start {name}"));
                    async { Ok::<_, BoxError>(()) }
                })
                .on_stop(move |_s: PluginScope| {
                    on_stop.lock().push(format!("stop {name}"));
                    async { Ok::<_, BoxError>(()) }
                })
                .build()
                .unwrap()
        };
        let base = hooks("base", vec![]);
        let mid = hooks("mid", vec![base.clone()]);
        let top = hooks("top", vec![mid.clone(), base.clone()]);
        let manager = manager(&[top]);
        assert_eq!(
            manager.layers(),
            vec![vec!["base".to_owned()], vec!["mid".to_owned()], vec!["top".to_owned()]]
        );
        manager.start().await;
        manager.stop().await;
        assert_eq!(
            *log.lock(),
            vec!["start base", "start mid", "start top", "stop top", "stop mid", "stop base"]
        );
    }

    #[tokio::test]
    async fn test_failed_start_makes_dependents_unavailable() {
        let base = PluginDefinition::builder("base")
            .on_start(|_s: PluginScope| async { Err::<(), BoxError>("no".into()) })
            .build()
            .unwrap();
        let top = PluginDefinition::builder("top").dependencies([&base]).build().unwrap();
        let manager = manager(&[top]);
        let failed = manager.start().await;
        assert_eq!(failed, vec!["top".to_owned(), "base".to_owned()]);
        assert_eq!(manager.state("base"), Some(PluginState::Errored));
        assert_eq!(manager.state("top"), Some(PluginState::Errored));
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_cycle_rejected_before_start() {
        let started = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&started);
        let a = PluginDefinition::builder("a")
            .dependencies(["b"])
            .on_start(move |_s: PluginScope| {
                counted.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, BoxError>(()) }
            })
            .build()
            .unwrap();
        let b = PluginDefinition::builder("b").dependencies([&a]).build().unwrap();
        let err = PluginManager::new(&[b], &HashMap::new(), ManagerOptions::default()).unwrap_err();
        assert!(matches!(err, ResolveError::Cycle(_)));
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_config_validated_with_defaults() {
        let def = PluginDefinition::builder("cfg")
            .config(
                Schema::object([("greeting", Schema::String.with_default(json!("hi")))])
                    .with_default(json!({})),
            )
            .build()
            .unwrap();
        let manager = manager(&[def.clone()]);
        let config = manager.instance("cfg").unwrap().config.clone();
        assert_eq!(*config, json!({ "greeting": "hi" }));

        let bad = HashMap::from([("cfg".to_owned(), json!({ "greeting": 5 }))]);
        let err = PluginManager::new(&[def], &bad, ManagerOptions::default()).unwrap_err();
        assert!(matches!(err, ResolveError::Validation { facet: "config", .. }));
    }

    #[tokio::test]
    async fn test_stop_aborts_services_that_ignore_cancellation() {
        let stopped = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&stopped);
        let stubborn = PluginDefinition::builder("stubborn")
            .service("sleeper", |_scope: ServiceScope, _events: EventStream| async {
                future::pending::<()>().await;
                Ok::<_, BoxError>(())
            })
            .on_stop(move |_s: PluginScope| {
                counted.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, BoxError>(()) }
            })
            .build()
            .unwrap();
        let options = ManagerOptions {
            stop_timeout: Duration::from_millis(50),
            ..ManagerOptions::default()
        };
        let manager = PluginManager::new(&[stubborn], &HashMap::new(), options).unwrap();
        manager.start().await;

        let begun = std::time::Instant::now();
        manager.stop().await;
        assert!(begun.elapsed() < Duration::from_secs(2));
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state("stubborn"), Some(PluginState::Stopped));
    }

    #[tokio::test]
    async fn test_on_stop_failure_errors_plugin() {
        let def = PluginDefinition::builder("fragile")
            .on_stop(|_s: PluginScope| async { Err::<(), BoxError>("flush failed".into()) })
            .build()
            .unwrap();
        let manager = manager(&[def]);
        let mut failures = manager.subscribe_failures();
        manager.start().await;
        manager.stop().await;

        let failure = failures.recv().await.unwrap();
        assert!(matches!(
            &*failure.error,
            PluginError::Lifecycle(LifecycleError::Hook { hook: Hook::Stop, .. })
        ));
        assert_eq!(manager.state("fragile"), Some(PluginState::Errored));
    }

    #[tokio::test]
    async fn test_urgent_emit_overtakes_queued_events() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let delivered = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(tokio::sync::Notify::new());
        let source = PluginDefinition::builder("src")
            .events([("n", Some(Schema::Integer))])
            .build()
            .unwrap();
        let counted = Arc::clone(&delivered);
        let log = Arc::clone(&received);
        let gate = Arc::clone(&release);
        let sink = PluginDefinition::builder("sink")
            .dependencies([&source])
            .effect("count", move |_scope: PluginScope, _event: Event| {
                counted.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, BoxError>(()) }
            })
            .service("reader", move |_scope: ServiceScope, events: EventStream| {
                let log = Arc::clone(&log);
                let gate = Arc::clone(&gate);
                async move {
                    gate.notified().await;
                    while let Some(event) = events.next().await {
                        log.lock().push(event.data().cloned().unwrap_or_default());
                    }
                    Ok::<_, BoxError>(())
                }
            })
            .build()
            .unwrap();
        let manager = manager(&[sink]);
        manager.start().await;

        let src = manager.instance("src").unwrap();
        for n in 1..=3 {
            src.emit("n", Some(json!(n)), false).unwrap();
        }
        src.emit("n", Some(json!(4)), true).unwrap();
        settle(|| delivered.load(Ordering::SeqCst) == 4).await;
        release.notify_one();

        settle(|| received.lock().len() == 4).await;
        assert_eq!(*received.lock(), vec![json!(4), json!(1), json!(2), json!(3)]);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_directed_emit_into_stopped_dependency_is_rejected() {
        let a = counter();
        let b = PluginDefinition::builder("b").dependencies([&a]).build().unwrap();
        let manager = manager(&[b]);
        manager.start().await;

        manager
            .instance("a")
            .unwrap()
            .stop(Duration::from_millis(50))
            .await;
        let binding = manager.instance("b").unwrap().dependencies.get("a").unwrap();
        assert!(matches!(
            binding.emit("increment", None),
            Err(EmitError::TargetUnavailable { state: PluginState::Stopped, .. })
        ));
        assert_eq!(manager.state("b"), Some(PluginState::Running));
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_interceptor_on_unrelated_source_rejected() {
        let other = PluginDefinition::builder("other").build().unwrap();
        let lonely = PluginDefinition::builder("lonely")
            .interceptor_for("watch", "other", |call: Intercept| async move {
                call.forward();
                Ok::<_, BoxError>(())
            })
            .build()
            .unwrap();
        let err = PluginManager::new(&[other, lonely], &HashMap::new(), ManagerOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            ResolveError::UnreachableInterceptor { ref plugin, ref target, .. }
                if plugin == "lonely" && target == "other"
        ));
    }

    #[tokio::test]
    async fn test_interceptor_on_dependent_source_accepted() {
        let store = PluginDefinition::builder("store")
            .events([("put", None)])
            .interceptor_for("from-client", "client", |call: Intercept| async move {
                call.forward();
                Ok::<_, BoxError>(())
            })
            .build()
            .unwrap();
        let client = PluginDefinition::builder("client").dependencies([&store]).build().unwrap();
        assert!(PluginManager::new(&[client], &HashMap::new(), ManagerOptions::default()).is_ok());
    }

    #[tokio::test]
    async fn test_events_observer_sees_emits() {
        let source = PluginDefinition::builder("src").events([("x", None)]).build().unwrap();
        let manager = manager(&[source]);
        let mut events = manager.subscribe_events();
        manager.start().await;
        manager.instance("src").unwrap().emit("x", None, false).unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.source(), "src");
        assert!(event.is("x"));
        manager.stop().await;
    }
}
