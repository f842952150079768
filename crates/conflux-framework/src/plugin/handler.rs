//! Type-erased plugin handlers.
//!
//! Effects and methods are stored as [`BoxCloneSyncService`]s so the inbox loop
//! can drive them with [`ServiceExt::oneshot`](tower::ServiceExt::oneshot).
//! Hooks and services are plain boxed async functions.

use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tower::service_fn;
use tower::util::BoxCloneSyncService;

use conflux_core::{Event, EventStream, MethodSignature};

use super::scope::{PluginScope, ServiceScope};
use crate::error::{BoxError, PluginError};

/// Request handed to an effect.
pub struct EffectCall {
    /// Writable capabilities of the receiving plugin.
    pub scope: PluginScope,
    /// The event that survived the interceptor chain.
    pub event: Event,
}

/// Request handed to a method implementation.
pub struct MethodCall {
    /// Writable capabilities of the plugin owning the method.
    pub scope: PluginScope,
    /// Arguments, already validated against the method signature.
    pub args: Value,
}

pub(crate) type EffectService = BoxCloneSyncService<EffectCall, (), BoxError>;
pub(crate) type MethodService = BoxCloneSyncService<MethodCall, Value, BoxError>;

pub(crate) type HookFn =
    Arc<dyn Fn(PluginScope) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;
pub(crate) type ErrorHookFn = Arc<
    dyn Fn(PluginScope, Arc<PluginError>) -> BoxFuture<'static, Result<(), BoxError>>
        + Send
        + Sync,
>;
pub(crate) type ServiceFn = Arc<
    dyn Fn(ServiceScope, EventStream) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync,
>;

#[derive(Clone)]
pub(crate) struct EffectEntry {
    pub(crate) name: Arc<str>,
    pub(crate) service: EffectService,
}

#[derive(Clone)]
pub(crate) struct MethodEntry {
    pub(crate) name: Arc<str>,
    pub(crate) signature: MethodSignature,
    pub(crate) service: MethodService,
}

#[derive(Clone)]
pub(crate) struct ServiceEntry {
    pub(crate) name: Arc<str>,
    pub(crate) run: ServiceFn,
}

// ─── Erasure helpers ─────────────────────────────────────────────────────────

pub(crate) fn effect<F, Fut, E>(f: F) -> EffectService
where
    F: Fn(PluginScope, Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError>,
{
    let f = Arc::new(f);
    BoxCloneSyncService::new(service_fn(move |call: EffectCall| {
        let fut = f(call.scope, call.event);
        async move { fut.await.map_err(Into::<BoxError>::into) }
    }))
}

pub(crate) fn method<F, Fut, E>(f: F) -> MethodService
where
    F: Fn(PluginScope, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, E>> + Send + 'static,
    E: Into<BoxError>,
{
    let f = Arc::new(f);
    BoxCloneSyncService::new(service_fn(move |call: MethodCall| {
        let fut = f(call.scope, call.args);
        async move { fut.await.map_err(Into::<BoxError>::into) }
    }))
}

pub(crate) fn hook<F, Fut, E>(f: F) -> HookFn
where
    F: Fn(PluginScope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError>,
{
    Arc::new(move |scope| f(scope).map(|r| r.map_err(Into::into)).boxed())
}

pub(crate) fn error_hook<F, Fut, E>(f: F) -> ErrorHookFn
where
    F: Fn(PluginScope, Arc<PluginError>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError>,
{
    Arc::new(move |scope, error| f(scope, error).map(|r| r.map_err(Into::into)).boxed())
}

pub(crate) fn service<F, Fut, E>(f: F) -> ServiceFn
where
    F: Fn(ServiceScope, EventStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError>,
{
    Arc::new(move |scope, stream| f(scope, stream).map(|r| r.map_err(Into::into)).boxed())
}
