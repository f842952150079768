//! Events exchanged between plugins.
//!
//! An [`Event`] is immutable once emitted.  Interceptors that want to alter an
//! event build a new one with [`with_data`](Event::with_data) /
//! [`with_kind`](Event::with_kind); the id is preserved so the transformed event
//! can still be traced back to its emission.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;

static NEXT_EVENT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Identifier assigned to an event at emission.
///
/// Used for tracing only; it carries no routing semantics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Allocates a fresh id for an event emitted by `source`.
    fn next(source: &str) -> Self {
        let seq = NEXT_EVENT_SEQ.fetch_add(1, Ordering::Relaxed);
        EventId(format!("{source}-{seq:08x}"))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated event travelling through the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    id: EventId,
    source: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default)]
    urgent: bool,
}

impl Event {
    /// Creates a freshly emitted event with a new id.
    ///
    /// The payload is expected to have been validated already.
    pub fn emitted(
        source: impl Into<String>,
        kind: impl Into<String>,
        data: Option<Value>,
        urgent: bool,
    ) -> Self {
        let source = source.into();
        Self {
            id: EventId::next(&source),
            source,
            kind: kind.into(),
            data,
            urgent,
        }
    }

    /// Returns the emission id.
    pub fn id(&self) -> &EventId {
        &self.id
    }

    /// Returns the name of the plugin that emitted this event.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Returns the event type.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Returns `true` if the event type equals `kind`.
    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }

    /// Returns the payload, if any.
    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    /// Returns a field of an object payload.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data.as_ref().and_then(|d| d.get(key))
    }

    /// Deserialises the payload into `T` (a missing payload reads as `null`).
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, ValidationError> {
        let data = self.data.clone().unwrap_or(Value::Null);
        serde_json::from_value(data).map_err(ValidationError::from)
    }

    /// Returns `true` if the event jumps ahead of queued events.
    pub fn is_urgent(&self) -> bool {
        self.urgent
    }

    /// Returns a copy of this event carrying a different payload.
    pub fn with_data(&self, data: impl Into<Option<Value>>) -> Self {
        Self {
            data: data.into(),
            ..self.clone()
        }
    }

    /// Returns a copy of this event carrying a different type.
    pub fn with_kind(&self, kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ids_are_unique_per_emission() {
        let a = Event::emitted("p", "tick", None, false);
        let b = Event::emitted("p", "tick", None, false);
        assert_ne!(a.id(), b.id());
        assert!(a.id().as_str().starts_with("p-"));
    }

    #[test]
    fn test_with_data_keeps_identity() {
        let original = Event::emitted("p", "say", Some(json!({ "text": "hi" })), false);
        let changed = original.with_data(json!({ "text": "HI" }));

        assert_eq!(changed.id(), original.id());
        assert_eq!(changed.field("text"), Some(&json!("HI")));
        assert_eq!(original.field("text"), Some(&json!("hi")));
    }

    #[test]
    fn test_serialized_shape() {
        let event = Event::emitted("p", "ping", None, true);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], json!("ping"));
        assert_eq!(value["urgent"], json!(true));
        assert!(value.get("data").is_none());
    }
}
