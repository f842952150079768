//! Error types shared by the core building blocks.
//!
//! Plugin-level errors (delivery, lifecycle, calls) are defined in
//! `conflux-framework`; this module only carries what the leaves need.

use thiserror::Error;

// =============================================================================
// Validation Errors
// =============================================================================

/// A value did not match the [`Schema`](crate::schema::Schema) it was checked against.
///
/// `path` is a JSONPath-like pointer into the rejected value (`$` is the root,
/// `$.items[2].name` a nested field); `cause` is a human-readable explanation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{path}: {cause}")]
pub struct ValidationError {
    /// Location of the offending value.
    pub path: String,
    /// Why the value was rejected.
    pub cause: String,
}

impl ValidationError {
    /// Creates a validation error at the given path.
    pub fn new(path: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            cause: cause.into(),
        }
    }

    /// Creates a validation error located at the root of the value.
    pub fn root(cause: impl Into<String>) -> Self {
        Self::new("$", cause)
    }
}

impl From<serde_json::Error> for ValidationError {
    fn from(err: serde_json::Error) -> Self {
        Self::root(err.to_string())
    }
}

// =============================================================================
// Queue Errors
// =============================================================================

/// Returned by [`EventQueue::push`](crate::queue::EventQueue::push) once the
/// queue has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("event queue is closed")]
pub struct QueueClosed;

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for schema validation.
pub type ValidationResult<T> = Result<T, ValidationError>;
