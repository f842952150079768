//! Plugin definitions and their builder.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde_json::{Map, Value};

use conflux_core::{Event, EventStream, MethodSignature, Schema};

use super::handler::{
    self, EffectEntry, ErrorHookFn, HookFn, MethodEntry, ServiceEntry,
};
use super::scope::{PluginScope, ServiceScope};
use crate::error::{BoxError, DefinitionError, PluginError};
use crate::interceptor::{Intercept, InterceptTarget, Interceptor, InterceptorEntry};

// =============================================================================
// Dependency
// =============================================================================

/// A declared dependency of a plugin.
#[derive(Clone)]
pub enum Dependency {
    /// A definition that is pulled into the agent along with the dependent.
    Definition(PluginDefinition),
    /// A plugin that must be supplied to the agent separately.
    Name(String),
}

impl Dependency {
    /// Returns the name of the depended-upon plugin.
    pub fn name(&self) -> &str {
        match self {
            Self::Definition(def) => def.name(),
            Self::Name(name) => name,
        }
    }
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Definition(def) => f.debug_tuple("Definition").field(&def.name()).finish(),
            Self::Name(name) => f.debug_tuple("Name").field(name).finish(),
        }
    }
}

impl From<PluginDefinition> for Dependency {
    fn from(def: PluginDefinition) -> Self {
        Self::Definition(def)
    }
}

impl From<&PluginDefinition> for Dependency {
    fn from(def: &PluginDefinition) -> Self {
        Self::Definition(def.clone())
    }
}

impl From<&str> for Dependency {
    fn from(name: &str) -> Self {
        Self::Name(name.to_owned())
    }
}

impl From<String> for Dependency {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

// =============================================================================
// PluginMetadata
// =============================================================================

/// Descriptive metadata shown in logs and agent summaries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginMetadata {
    /// Version string of the plugin.
    pub version: Option<String>,
    /// One-line description.
    pub description: Option<String>,
}

impl PluginMetadata {
    /// Creates metadata with a version.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: Some(version.into()),
            description: None,
        }
    }

    /// Sets the description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

// =============================================================================
// PluginDefinition
// =============================================================================

pub(crate) struct DefinitionInner {
    pub(crate) name: String,
    pub(crate) metadata: PluginMetadata,
    pub(crate) dependencies: Vec<Dependency>,
    pub(crate) config: Option<Schema>,
    pub(crate) context_schema: Option<Schema>,
    pub(crate) initial_context: Value,
    pub(crate) events: HashMap<String, Option<Schema>>,
    pub(crate) methods: Vec<MethodEntry>,
    pub(crate) on_start: Option<HookFn>,
    pub(crate) on_stop: Option<HookFn>,
    pub(crate) on_error: Option<ErrorHookFn>,
    pub(crate) effects: Vec<EffectEntry>,
    pub(crate) services: Vec<ServiceEntry>,
    pub(crate) interceptors: Vec<InterceptorEntry>,
}

/// Immutable blueprint of a plugin.
///
/// Cheap to clone; every clone refers to the same definition.
///
/// # Example
///
/// ```rust,ignore
/// let counter = PluginDefinition::builder("counter")
///     .context(
///         Schema::object([("count", Schema::Integer)]),
///         json!({ "count": 0 }),
///     )
///     .events([("increment", None)])
///     .effect("count", |scope: PluginScope, event: Event| async move {
///         if event.is("increment") {
///             scope.context().update_as("count", |n: i64| n + 1)?;
///         }
///         Ok::<_, BoxError>(())
///     })
///     .build()?;
/// ```
#[derive(Clone)]
pub struct PluginDefinition {
    pub(crate) inner: Arc<DefinitionInner>,
}

impl PluginDefinition {
    /// Starts building a definition named `name`.
    pub fn builder(name: impl Into<String>) -> PluginBuilder {
        PluginBuilder::new(name.into())
    }

    /// Returns the plugin name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the plugin metadata.
    pub fn metadata(&self) -> &PluginMetadata {
        &self.inner.metadata
    }

    /// Returns the declared dependencies in declaration order.
    pub fn dependencies(&self) -> &[Dependency] {
        &self.inner.dependencies
    }

    /// Returns the config schema.
    pub fn config_schema(&self) -> Option<&Schema> {
        self.inner.config.as_ref()
    }

    /// Returns the context schema.
    pub fn context_schema(&self) -> Option<&Schema> {
        self.inner.context_schema.as_ref()
    }

    /// Returns `true` if the plugin declares an event type `kind`.
    pub fn declares_event(&self, kind: &str) -> bool {
        self.inner.events.contains_key(kind)
    }

    /// Returns the payload schema of a declared event (`Some(None)` for no payload).
    pub fn event_schema(&self, kind: &str) -> Option<Option<&Schema>> {
        self.inner.events.get(kind).map(Option::as_ref)
    }

    /// Returns the names of the declared events.
    pub fn event_names(&self) -> impl Iterator<Item = &str> {
        self.inner.events.keys().map(String::as_str)
    }

    /// Returns the signature of a method.
    pub fn method_signature(&self, name: &str) -> Option<&MethodSignature> {
        self.method(name).map(|m| &m.signature)
    }

    /// Returns method names in registration order.
    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.inner.methods.iter().map(|m| m.name.as_ref())
    }

    /// Returns effect names in registration order.
    pub fn effect_names(&self) -> impl Iterator<Item = &str> {
        self.inner.effects.iter().map(|e| e.name.as_ref())
    }

    /// Returns service names in registration order.
    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.inner.services.iter().map(|s| s.name.as_ref())
    }

    /// Returns interceptor names in registration order.
    pub fn interceptor_names(&self) -> impl Iterator<Item = &str> {
        self.inner.interceptors.iter().map(|i| i.name.as_ref())
    }

    /// Returns `true` if both values are the same definition.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn method(&self, name: &str) -> Option<&MethodEntry> {
        self.inner.methods.iter().find(|m| m.name.as_ref() == name)
    }
}

impl fmt::Debug for PluginDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDefinition")
            .field("name", &self.inner.name)
            .field(
                "dependencies",
                &self.inner.dependencies.iter().map(Dependency::name).collect::<Vec<_>>(),
            )
            .field("methods", &self.method_names().collect::<Vec<_>>())
            .field("effects", &self.effect_names().collect::<Vec<_>>())
            .field("services", &self.service_names().collect::<Vec<_>>())
            .field("interceptors", &self.interceptor_names().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// PluginBuilder
// =============================================================================

/// Fluent builder for [`PluginDefinition`].
///
/// One-shot facets (`dependencies`, `config`, `context`, `events`, `metadata`,
/// `on_start`, `on_stop`, `on_error`) may each be set once; named members
/// (`method`, `effect`, `service`, `interceptor`) must have unique names.
/// Violations are collected and reported by [`build`](Self::build).
pub struct PluginBuilder {
    inner: DefinitionInner,
    facets: HashSet<&'static str>,
    errors: Vec<DefinitionError>,
}

impl PluginBuilder {
    fn new(name: String) -> Self {
        Self {
            inner: DefinitionInner {
                name,
                metadata: PluginMetadata::default(),
                dependencies: Vec::new(),
                config: None,
                context_schema: None,
                initial_context: Value::Object(Map::new()),
                events: HashMap::new(),
                methods: Vec::new(),
                on_start: None,
                on_stop: None,
                on_error: None,
                effects: Vec::new(),
                services: Vec::new(),
                interceptors: Vec::new(),
            },
            facets: HashSet::new(),
            errors: Vec::new(),
        }
    }

    /// Declares the plugin's dependencies.
    ///
    /// Accepts definitions (`&PluginDefinition`) and names (`&str`) alike.
    pub fn dependencies<I, D>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<Dependency>,
    {
        if self.claim("dependencies") {
            self.inner.dependencies = dependencies.into_iter().map(Into::into).collect();
        }
        self
    }

    /// Declares the config schema.
    pub fn config(mut self, schema: Schema) -> Self {
        if self.claim("config") {
            self.inner.config = Some(schema);
        }
        self
    }

    /// Declares the context schema and its initial value.
    pub fn context(mut self, schema: Schema, initial: Value) -> Self {
        if self.claim("context") {
            self.inner.context_schema = Some(schema);
            self.inner.initial_context = initial;
        }
        self
    }

    /// Declares the events this plugin emits, each with an optional payload schema.
    pub fn events<I, K>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = (K, Option<Schema>)>,
        K: Into<String>,
    {
        if self.claim("events") {
            for (kind, schema) in events {
                let kind = kind.into();
                if self.inner.events.contains_key(&kind) {
                    self.duplicate("event", kind);
                } else {
                    self.inner.events.insert(kind, schema);
                }
            }
        }
        self
    }

    /// Attaches descriptive metadata.
    pub fn metadata(mut self, metadata: PluginMetadata) -> Self {
        if self.claim("metadata") {
            self.inner.metadata = metadata;
        }
        self
    }

    /// Sets the hook run while the plugin is starting.
    pub fn on_start<F, Fut, E>(mut self, f: F) -> Self
    where
        F: Fn(PluginScope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        if self.claim("on_start") {
            self.inner.on_start = Some(handler::hook(f));
        }
        self
    }

    /// Sets the hook run after the plugin's services have stopped.
    pub fn on_stop<F, Fut, E>(mut self, f: F) -> Self
    where
        F: Fn(PluginScope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        if self.claim("on_stop") {
            self.inner.on_stop = Some(handler::hook(f));
        }
        self
    }

    /// Sets the hook run when the plugin transitions to `Errored`.
    pub fn on_error<F, Fut, E>(mut self, f: F) -> Self
    where
        F: Fn(PluginScope, Arc<PluginError>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        if self.claim("on_error") {
            self.inner.on_error = Some(handler::error_hook(f));
        }
        self
    }

    /// Adds a method callable by dependents and by the embedding application.
    pub fn method<F, Fut, E>(mut self, name: impl Into<String>, signature: MethodSignature, f: F) -> Self
    where
        F: Fn(PluginScope, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let name = name.into();
        if self.inner.methods.iter().any(|m| *m.name == *name) {
            self.duplicate("method", name);
        } else {
            self.inner.methods.push(MethodEntry {
                name: name.into(),
                signature,
                service: handler::method(f),
            });
        }
        self
    }

    /// Adds an effect run against every delivered event, in registration order.
    pub fn effect<F, Fut, E>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(PluginScope, Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let name = name.into();
        if self.inner.effects.iter().any(|e| *e.name == *name) {
            self.duplicate("effect", name);
        } else {
            self.inner.effects.push(EffectEntry {
                name: name.into(),
                service: handler::effect(f),
            });
        }
        self
    }

    /// Adds a background service consuming the plugin's event queue.
    pub fn service<F, Fut, E>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ServiceScope, EventStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let name = name.into();
        if self.inner.services.iter().any(|s| *s.name == *name) {
            self.duplicate("service", name);
        } else {
            self.inner.services.push(ServiceEntry {
                name: name.into(),
                run: handler::service(f),
            });
        }
        self
    }

    /// Adds an interceptor applied to events from every source.
    pub fn interceptor<F, Fut, E>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Intercept) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.intercept_with(name, InterceptTarget::Any, f)
    }

    /// Adds an interceptor applied only to events from `source`.
    pub fn interceptor_for<F, Fut, E>(
        self,
        name: impl Into<String>,
        source: impl Into<String>,
        f: F,
    ) -> Self
    where
        F: Fn(Intercept) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.intercept_with(name, InterceptTarget::Source(source.into()), f)
    }

    /// Adds any [`Interceptor`] implementation.
    pub fn intercept_with<I: Interceptor>(
        mut self,
        name: impl Into<String>,
        target: InterceptTarget,
        interceptor: I,
    ) -> Self {
        let name = name.into();
        if self.inner.interceptors.iter().any(|i| *i.name == *name) {
            self.duplicate("interceptor", name);
        } else {
            self.inner.interceptors.push(InterceptorEntry {
                name: name.into(),
                target,
                handler: Arc::new(interceptor),
            });
        }
        self
    }

    /// Finishes the definition.
    ///
    /// # Errors
    ///
    /// Returns the first recorded [`DefinitionError`].
    pub fn build(self) -> Result<PluginDefinition, DefinitionError> {
        if self.inner.name.is_empty() {
            return Err(DefinitionError::EmptyName);
        }
        if let Some(error) = self.errors.into_iter().next() {
            return Err(error);
        }
        Ok(PluginDefinition {
            inner: Arc::new(self.inner),
        })
    }

    fn claim(&mut self, facet: &'static str) -> bool {
        if self.facets.insert(facet) {
            return true;
        }
        self.errors.push(DefinitionError::FacetAlreadySet {
            plugin: self.inner.name.clone(),
            facet,
        });
        false
    }

    fn duplicate(&mut self, kind: &'static str, name: String) {
        self.errors.push(DefinitionError::DuplicateMember {
            plugin: self.inner.name.clone(),
            kind,
            name,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn noop(_scope: PluginScope) -> Result<(), BoxError> {
        Ok(())
    }

    #[test]
    fn test_build_minimal() {
        let def = PluginDefinition::builder("a").build().unwrap();
        assert_eq!(def.name(), "a");
        assert!(def.dependencies().is_empty());
        assert!(def.config_schema().is_none());
    }

    #[test]
    fn test_empty_name_rejected() {
        let err = PluginDefinition::builder("").build().unwrap_err();
        assert_eq!(err, DefinitionError::EmptyName);
    }

    #[test]
    fn test_facet_set_twice_rejected() {
        let err = PluginDefinition::builder("a")
            .config(Schema::Any)
            .on_start(noop)
            .config(Schema::Null)
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            DefinitionError::FacetAlreadySet {
                plugin: "a".into(),
                facet: "config"
            }
        );
    }

    #[test]
    fn test_hook_set_twice_rejected() {
        let err = PluginDefinition::builder("a")
            .on_start(noop)
            .on_start(noop)
            .build()
            .unwrap_err();
        assert!(matches!(err, DefinitionError::FacetAlreadySet { facet: "on_start", .. }));
    }

    #[test]
    fn test_duplicate_member_rejected() {
        let err = PluginDefinition::builder("a")
            .effect("e", |_s: PluginScope, _e: Event| async { Ok::<_, BoxError>(()) })
            .effect("e", |_s: PluginScope, _e: Event| async { Ok::<_, BoxError>(()) })
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            DefinitionError::DuplicateMember {
                plugin: "a".into(),
                kind: "effect",
                name: "e".into()
            }
        );
    }

    #[test]
    fn test_duplicate_event_rejected() {
        let err = PluginDefinition::builder("a")
            .events([("tick", None), ("tick", Some(Schema::Integer))])
            .build()
            .unwrap_err();
        assert!(matches!(err, DefinitionError::DuplicateMember { kind: "event", .. }));
    }

    #[test]
    fn test_accessors() {
        let dep = PluginDefinition::builder("dep").build().unwrap();
        let def = PluginDefinition::builder("a")
            .dependencies([Dependency::from(&dep), Dependency::from("other")])
            .events([("tick", None), ("say", Some(Schema::String))])
            .context(Schema::object([("n", Schema::Integer)]), json!({ "n": 0 }))
            .method("get", MethodSignature::default(), |_s: PluginScope, _a: Value| async {
                Ok::<_, BoxError>(Value::Null)
            })
            .interceptor("pass", |call: Intercept| async move {
                call.forward();
                Ok::<_, BoxError>(())
            })
            .metadata(PluginMetadata::new("1.2.0").description("test plugin"))
            .build()
            .unwrap();

        let names: Vec<_> = def.dependencies().iter().map(Dependency::name).collect();
        assert_eq!(names, vec!["dep", "other"]);
        assert_eq!(def.event_schema("tick"), Some(None));
        assert_eq!(def.event_schema("say"), Some(Some(&Schema::String)));
        assert_eq!(def.event_schema("nope"), None);
        assert!(def.method_signature("get").is_some());
        assert_eq!(def.interceptor_names().collect::<Vec<_>>(), vec!["pass"]);
        assert_eq!(def.metadata().version.as_deref(), Some("1.2.0"));
        assert!(def.ptr_eq(&def.clone()));
    }
}
