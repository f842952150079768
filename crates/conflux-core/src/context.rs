//! Reactive per-plugin state.
//!
//! Every plugin owns exactly one context store: a JSON object validated against
//! the plugin's context schema.  Two capability-restricted handles exist over
//! the same store:
//!
//! - [`ContextHandle`] is **writable**.  Handed to the owning plugin's lifecycle
//!   hooks, effects and methods.
//! - [`ContextView`] is **read-only**.  Handed to services, interceptors and to
//!   every plugin that depends on the owner.
//!
//! # Change notification
//!
//! [`on_change`](ContextHandle::on_change) registers a selector (a pure
//! projection of the full state) and a callback.  After each successful
//! mutation every selector is re-evaluated and the callback fires with
//! `(new, old)` iff the projection differs structurally from the last value
//! reported to that subscription.  Callbacks run synchronously, before the
//! mutating call returns.
//!
//! # Serialisation
//!
//! Mutations are applied one at a time under a re-entrant writer lock: a
//! concurrent `set` waits for the in-flight one (including its callbacks),
//! while a callback may itself call `set` on the same store.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::trace;

use crate::error::{ValidationError, ValidationResult};
use crate::schema::Schema;

type Selector = Box<dyn Fn(&Value) -> Value + Send + Sync>;
type Callback = Box<dyn Fn(&Value, &Value) + Send + Sync>;

// =============================================================================
// ContextStore (shared state)
// =============================================================================

struct ContextStore {
    owner: String,
    schema: Option<Schema>,
    state: RwLock<Arc<Value>>,
    writer: ReentrantMutex<()>,
    subscriptions: Mutex<Vec<Arc<SubscriptionEntry>>>,
    next_subscription: AtomicU64,
}

impl ContextStore {
    fn snapshot(&self) -> Arc<Value> {
        Arc::clone(&self.state.read())
    }

    fn get(&self) -> Value {
        (*self.snapshot()).clone()
    }

    fn get_key(&self, key: &str) -> Option<Value> {
        self.snapshot().get(key).cloned()
    }

    fn mutate<F>(&self, f: F) -> ValidationResult<()>
    where
        F: FnOnce(&Value) -> ValidationResult<Value>,
    {
        let _writer = self.writer.lock();

        let previous = self.snapshot();
        let next = f(&previous)?;
        let next = match &self.schema {
            Some(schema) => schema.validate(&next)?,
            None => next,
        };
        if !next.is_object() {
            return Err(ValidationError::root("context state must be an object"));
        }

        *self.state.write() = Arc::new(next);
        trace!(plugin = %self.owner, "Context updated");

        self.notify();
        Ok(())
    }

    fn notify(&self) {
        let subscriptions: Vec<Arc<SubscriptionEntry>> =
            self.subscriptions.lock().iter().cloned().collect();
        for sub in subscriptions {
            // Re-read per subscription: a callback may have mutated the store again.
            sub.deliver(&self.snapshot());
        }
    }

    fn subscribe(self: &Arc<Self>, selector: Selector, callback: Callback) -> Subscription {
        // Registration is ordered against mutations: no transition between the
        // initial projection and the first notification can be missed.
        let _writer = self.writer.lock();
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let initial = selector(&self.snapshot());
        let entry = Arc::new(SubscriptionEntry {
            id,
            selector,
            callback,
            slot: ReentrantMutex::new(RefCell::new(Slot {
                last: initial,
                active: true,
            })),
        });
        self.subscriptions.lock().push(Arc::clone(&entry));
        Subscription {
            store: Arc::downgrade(self),
            entry,
        }
    }
}

// =============================================================================
// Subscription
// =============================================================================

struct SubscriptionEntry {
    id: u64,
    selector: Selector,
    callback: Callback,
    slot: ReentrantMutex<RefCell<Slot>>,
}

struct Slot {
    last: Value,
    active: bool,
}

impl SubscriptionEntry {
    fn deliver(&self, state: &Value) {
        let slot = self.slot.lock();
        let (new, old) = {
            let mut slot = slot.borrow_mut();
            if !slot.active {
                return;
            }
            let selected = (self.selector)(state);
            if selected == slot.last {
                return;
            }
            let old = std::mem::replace(&mut slot.last, selected.clone());
            (selected, old)
        };
        // The slot lock stays held so that `unsubscribe` on another thread
        // waits for this callback to return.
        (self.callback)(&new, &old);
    }
}

/// Handle returned by `on_change`.
///
/// Dropping the handle keeps the subscription alive; call
/// [`unsubscribe`](Self::unsubscribe) to stop receiving callbacks.
pub struct Subscription {
    store: Weak<ContextStore>,
    entry: Arc<SubscriptionEntry>,
}

impl Subscription {
    /// Cancels the subscription.
    ///
    /// If the callback is currently running on another thread this waits for
    /// it to return.  Once this returns the callback is never invoked again.
    pub fn unsubscribe(self) {
        {
            let slot = self.entry.slot.lock();
            slot.borrow_mut().active = false;
        }
        if let Some(store) = self.store.upgrade() {
            store.subscriptions.lock().retain(|s| s.id != self.entry.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.entry.id)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// ContextHandle (writable)
// =============================================================================

/// Writable handle onto a plugin's context.
#[derive(Clone)]
pub struct ContextHandle {
    store: Arc<ContextStore>,
}

impl ContextHandle {
    /// Creates a new store for `owner`, validating `initial` against `schema`.
    pub fn new(
        owner: impl Into<String>,
        schema: Option<Schema>,
        initial: Value,
    ) -> ValidationResult<Self> {
        let initial = match &schema {
            Some(schema) => schema.validate(&initial)?,
            None => initial,
        };
        if !initial.is_object() {
            return Err(ValidationError::root("context state must be an object"));
        }
        Ok(Self {
            store: Arc::new(ContextStore {
                owner: owner.into(),
                schema,
                state: RwLock::new(Arc::new(initial)),
                writer: ReentrantMutex::new(()),
                subscriptions: Mutex::new(Vec::new()),
                next_subscription: AtomicU64::new(0),
            }),
        })
    }

    /// Creates an empty, schema-less context.
    pub fn empty(owner: impl Into<String>) -> Self {
        Self {
            store: Arc::new(ContextStore {
                owner: owner.into(),
                schema: None,
                state: RwLock::new(Arc::new(Value::Object(Map::new()))),
                writer: ReentrantMutex::new(()),
                subscriptions: Mutex::new(Vec::new()),
                next_subscription: AtomicU64::new(0),
            }),
        }
    }

    /// Returns a read-only view onto the same store.
    pub fn view(&self) -> ContextView {
        ContextView {
            store: Arc::clone(&self.store),
        }
    }

    /// Returns the name of the owning plugin.
    pub fn owner(&self) -> &str {
        &self.store.owner
    }

    /// Returns a deep copy of the current state.
    pub fn get(&self) -> Value {
        self.store.get()
    }

    /// Returns a copy of one top-level key.
    pub fn get_key(&self, key: &str) -> Option<Value> {
        self.store.get_key(key)
    }

    /// Deserialises the current state into `T`.
    pub fn get_as<T: DeserializeOwned>(&self) -> ValidationResult<T> {
        serde_json::from_value(self.get()).map_err(ValidationError::from)
    }

    /// Sets a top-level key.
    ///
    /// Fails (leaving the state untouched) if the resulting state does not
    /// match the context schema.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> ValidationResult<()> {
        let value = value.into();
        self.store.mutate(|prev| Ok(with_key(prev, key, value)))
    }

    /// Sets a top-level key from its previous value (`null` when absent).
    pub fn update<F>(&self, key: &str, f: F) -> ValidationResult<()>
    where
        F: FnOnce(&Value) -> Value,
    {
        self.store.mutate(|prev| {
            let current = prev.get(key).unwrap_or(&Value::Null);
            let value = f(current);
            Ok(with_key(prev, key, value))
        })
    }

    /// Typed variant of [`update`](Self::update).
    ///
    /// An absent or `null` key reads as `T::default()`.
    pub fn update_as<T, F>(&self, key: &str, f: F) -> ValidationResult<()>
    where
        T: DeserializeOwned + Serialize + Default,
        F: FnOnce(T) -> T,
    {
        self.store.mutate(|prev| {
            let current = match prev.get(key) {
                None | Some(Value::Null) => T::default(),
                Some(v) => serde_json::from_value(v.clone())
                    .map_err(|e| ValidationError::new(format!("$.{key}"), e.to_string()))?,
            };
            let value = serde_json::to_value(f(current))
                .map_err(|e| ValidationError::new(format!("$.{key}"), e.to_string()))?;
            Ok(with_key(prev, key, value))
        })
    }

    /// Replaces the whole state.
    pub fn replace(&self, state: Value) -> ValidationResult<()> {
        self.store.mutate(|_| Ok(state))
    }

    /// Subscribes to changes of a projection of the state.
    pub fn on_change<S, C>(&self, selector: S, callback: C) -> Subscription
    where
        S: Fn(&Value) -> Value + Send + Sync + 'static,
        C: Fn(&Value, &Value) + Send + Sync + 'static,
    {
        self.store
            .subscribe(Box::new(selector), Box::new(callback))
    }

    /// Subscribes to changes of one top-level key.
    pub fn on_key_change<C>(&self, key: &str, callback: C) -> Subscription
    where
        C: Fn(&Value, &Value) + Send + Sync + 'static,
    {
        self.view().on_key_change(key, callback)
    }
}

impl std::fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextHandle")
            .field("owner", &self.store.owner)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// ContextView (read-only)
// =============================================================================

/// Read-only handle onto a plugin's context.
#[derive(Clone)]
pub struct ContextView {
    store: Arc<ContextStore>,
}

impl ContextView {
    /// Returns the name of the owning plugin.
    pub fn owner(&self) -> &str {
        &self.store.owner
    }

    /// Returns a deep copy of the current state.
    pub fn get(&self) -> Value {
        self.store.get()
    }

    /// Returns a copy of one top-level key.
    pub fn get_key(&self, key: &str) -> Option<Value> {
        self.store.get_key(key)
    }

    /// Deserialises the current state into `T`.
    pub fn get_as<T: DeserializeOwned>(&self) -> ValidationResult<T> {
        serde_json::from_value(self.get()).map_err(ValidationError::from)
    }

    /// Subscribes to changes of a projection of the state.
    pub fn on_change<S, C>(&self, selector: S, callback: C) -> Subscription
    where
        S: Fn(&Value) -> Value + Send + Sync + 'static,
        C: Fn(&Value, &Value) + Send + Sync + 'static,
    {
        self.store
            .subscribe(Box::new(selector), Box::new(callback))
    }

    /// Subscribes to changes of one top-level key.
    pub fn on_key_change<C>(&self, key: &str, callback: C) -> Subscription
    where
        C: Fn(&Value, &Value) + Send + Sync + 'static,
    {
        let key = key.to_owned();
        self.on_change(
            move |state| state.get(&key).cloned().unwrap_or(Value::Null),
            callback,
        )
    }
}

impl std::fmt::Debug for ContextView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextView")
            .field("owner", &self.store.owner)
            .finish_non_exhaustive()
    }
}

fn with_key(prev: &Value, key: &str, value: Value) -> Value {
    let mut next = prev.clone();
    if let Value::Object(map) = &mut next {
        map.insert(key.to_owned(), value);
    }
    next
}
