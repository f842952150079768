//! Declarative value shapes and their validator.
//!
//! A [`Schema`] describes the JSON shape accepted for a plugin's config,
//! context, event payloads and method signatures.  Validation either returns
//! the **normalised** value (defaults filled in) or a [`ValidationError`]
//! pointing at the first offending location.
//!
//! ```rust,ignore
//! use conflux_core::schema::Schema;
//! use serde_json::json;
//!
//! let schema = Schema::object([
//!     ("user_id", Schema::String),
//!     ("retries", Schema::Integer.with_default(json!(3))),
//! ]);
//!
//! let value = schema.validate(&json!({ "user_id": "123" }))?;
//! assert_eq!(value, json!({ "user_id": "123", "retries": 3 }));
//! ```

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{ValidationError, ValidationResult};

// =============================================================================
// Schema
// =============================================================================

/// The shape a JSON value must have.
#[derive(Debug, Clone, PartialEq)]
pub enum Schema {
    /// Accepts any value, unchanged.
    Any,
    /// Accepts only `null`.
    Null,
    /// Accepts `true` / `false`.
    Bool,
    /// Accepts any JSON number.
    Number,
    /// Accepts numbers without a fractional part.
    Integer,
    /// Accepts strings.
    String,
    /// Accepts exactly this value.
    Literal(Value),
    /// Accepts arrays whose every item matches the inner schema.
    Array(Box<Schema>),
    /// Accepts objects with arbitrary keys whose values match the inner schema.
    Map(Box<Schema>),
    /// Accepts objects with declared fields.
    Object(ObjectSchema),
    /// Accepts `null` (or an absent field) in addition to the inner schema.
    Optional(Box<Schema>),
    /// Like [`Optional`](Self::Optional) but substitutes a default when absent.
    Default(Box<Schema>, Value),
    /// Accepts the first variant that matches.
    OneOf(Vec<Schema>),
}

/// Field list of an object schema, kept in declaration order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObjectSchema {
    fields: Vec<(String, Schema)>,
    strict: bool,
}

impl ObjectSchema {
    /// Returns the declared fields in order.
    pub fn fields(&self) -> &[(String, Schema)] {
        &self.fields
    }

    /// Returns `true` if unknown keys are rejected.
    pub fn is_strict(&self) -> bool {
        self.strict
    }
}

impl Schema {
    /// Builds an object schema from `(name, schema)` pairs.
    ///
    /// Unknown keys are preserved; call [`strict`](Self::strict) to reject them.
    pub fn object<K, I>(fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Schema)>,
    {
        Schema::Object(ObjectSchema {
            fields: fields.into_iter().map(|(k, s)| (k.into(), s)).collect(),
            strict: false,
        })
    }

    /// Builds an array schema.
    pub fn array(item: Schema) -> Self {
        Schema::Array(Box::new(item))
    }

    /// Builds a map schema (arbitrary keys, uniform values).
    pub fn map(value: Schema) -> Self {
        Schema::Map(Box::new(value))
    }

    /// Builds a schema accepting one of the given literal values.
    pub fn one_of_literals<I: IntoIterator<Item = Value>>(values: I) -> Self {
        Schema::OneOf(values.into_iter().map(Schema::Literal).collect())
    }

    /// Wraps this schema so that `null` / absence is accepted.
    pub fn optional(self) -> Self {
        Schema::Optional(Box::new(self))
    }

    /// Wraps this schema so that `null` / absence is replaced with `default`.
    pub fn with_default(self, default: Value) -> Self {
        Schema::Default(Box::new(self), default)
    }

    /// Makes an object schema reject keys that are not declared.
    ///
    /// Has no effect on other variants.
    pub fn strict(self) -> Self {
        match self {
            Schema::Object(mut object) => {
                object.strict = true;
                Schema::Object(object)
            }
            other => other,
        }
    }

    /// Validates `value`, returning the normalised result.
    pub fn validate(&self, value: &Value) -> ValidationResult<Value> {
        self.check(value, &mut Path::root())
    }

    /// Validates `value` and deserialises the normalised result into `T`.
    pub fn validate_as<T: DeserializeOwned>(&self, value: &Value) -> ValidationResult<T> {
        let normalised = self.validate(value)?;
        serde_json::from_value(normalised).map_err(ValidationError::from)
    }

    /// Returns `true` if an absent field may be omitted.
    fn accepts_absent(&self) -> bool {
        matches!(self, Schema::Any | Schema::Optional(_) | Schema::Default(..))
    }

    fn check(&self, value: &Value, path: &mut Path) -> ValidationResult<Value> {
        match self {
            Schema::Any => Ok(value.clone()),
            Schema::Null => expect(value.is_null(), value, "null", path),
            Schema::Bool => expect(value.is_boolean(), value, "boolean", path),
            Schema::Number => expect(value.is_number(), value, "number", path),
            Schema::Integer => expect(value.is_i64() || value.is_u64(), value, "integer", path),
            Schema::String => expect(value.is_string(), value, "string", path),
            Schema::Literal(expected) => {
                if value == expected {
                    Ok(value.clone())
                } else {
                    Err(path.error(format!("expected literal {expected}, got {value}")))
                }
            }
            Schema::Array(item) => {
                let items = value
                    .as_array()
                    .ok_or_else(|| path.error(format!("expected array, got {}", kind(value))))?;
                let mut out = Vec::with_capacity(items.len());
                for (i, v) in items.iter().enumerate() {
                    path.push_index(i);
                    out.push(item.check(v, path)?);
                    path.pop();
                }
                Ok(Value::Array(out))
            }
            Schema::Map(inner) => {
                let map = value
                    .as_object()
                    .ok_or_else(|| path.error(format!("expected object, got {}", kind(value))))?;
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    path.push_key(k);
                    out.insert(k.clone(), inner.check(v, path)?);
                    path.pop();
                }
                Ok(Value::Object(out))
            }
            Schema::Object(object) => object.check(value, path),
            Schema::Optional(inner) => {
                if value.is_null() {
                    Ok(Value::Null)
                } else {
                    inner.check(value, path)
                }
            }
            Schema::Default(inner, default) => {
                if value.is_null() {
                    inner.check(default, path)
                } else {
                    inner.check(value, path)
                }
            }
            Schema::OneOf(variants) => {
                for variant in variants {
                    if let Ok(v) = variant.check(value, &mut path.clone()) {
                        return Ok(v);
                    }
                }
                Err(path.error(format!(
                    "value {value} matches none of {} variants",
                    variants.len()
                )))
            }
        }
    }
}

impl ObjectSchema {
    fn check(&self, value: &Value, path: &mut Path) -> ValidationResult<Value> {
        let map = value
            .as_object()
            .ok_or_else(|| path.error(format!("expected object, got {}", kind(value))))?;

        let mut out = Map::with_capacity(map.len().max(self.fields.len()));
        for (name, schema) in &self.fields {
            path.push_key(name);
            match map.get(name) {
                Some(v) => {
                    out.insert(name.clone(), schema.check(v, path)?);
                }
                None if schema.accepts_absent() => {
                    if let Schema::Default(..) = schema {
                        out.insert(name.clone(), schema.check(&Value::Null, path)?);
                    }
                }
                None => return Err(path.error("required field is missing")),
            }
            path.pop();
        }

        for (k, v) in map {
            if self.fields.iter().any(|(name, _)| name == k) {
                continue;
            }
            if self.strict {
                path.push_key(k);
                return Err(path.error("unknown field"));
            }
            out.insert(k.clone(), v.clone());
        }

        Ok(Value::Object(out))
    }
}

impl From<ObjectSchema> for Schema {
    fn from(object: ObjectSchema) -> Self {
        Schema::Object(object)
    }
}

// =============================================================================
// MethodSignature
// =============================================================================

/// Argument and return shapes of a plugin method.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodSignature {
    /// Shape of the arguments value.
    pub args: Schema,
    /// Shape of the returned value.
    pub returns: Schema,
}

impl MethodSignature {
    /// Creates a signature from argument and return schemas.
    pub fn new(args: Schema, returns: Schema) -> Self {
        Self { args, returns }
    }
}

impl Default for MethodSignature {
    /// Takes no arguments (`null`) and returns nothing (`null`).
    fn default() -> Self {
        Self {
            args: Schema::Null.optional(),
            returns: Schema::Null.optional(),
        }
    }
}

// =============================================================================
// Path tracking
// =============================================================================

#[derive(Debug, Clone)]
struct Path(Vec<Segment>);

#[derive(Debug, Clone)]
enum Segment {
    Key(String),
    Index(usize),
}

impl Path {
    fn root() -> Self {
        Path(Vec::new())
    }

    fn push_key(&mut self, key: &str) {
        self.0.push(Segment::Key(key.to_owned()));
    }

    fn push_index(&mut self, index: usize) {
        self.0.push(Segment::Index(index));
    }

    fn pop(&mut self) {
        self.0.pop();
    }

    fn error(&self, cause: impl Into<String>) -> ValidationError {
        ValidationError::new(self.to_string(), cause)
    }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("$")?;
        for segment in &self.0 {
            match segment {
                Segment::Key(k) => write!(f, ".{k}")?,
                Segment::Index(i) => write!(f, "[{i}]")?,
            }
        }
        Ok(())
    }
}

fn expect(ok: bool, value: &Value, expected: &str, path: &Path) -> ValidationResult<Value> {
    if ok {
        Ok(value.clone())
    } else {
        Err(path.error(format!("expected {expected}, got {}", kind(value))))
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_fills_defaults() {
        let schema = Schema::object([
            ("name", Schema::String),
            ("retries", Schema::Integer.with_default(json!(3))),
            ("note", Schema::String.optional()),
        ]);

        let value = schema.validate(&json!({ "name": "a" })).unwrap();
        assert_eq!(value, json!({ "name": "a", "retries": 3 }));
    }

    #[test]
    fn test_missing_required_field_reports_path() {
        let schema = Schema::object([(
            "user",
            Schema::object([("id", Schema::String)]),
        )]);

        let err = schema.validate(&json!({ "user": {} })).unwrap_err();
        assert_eq!(err.path, "$.user.id");
        assert_eq!(err.cause, "required field is missing");
    }

    #[test]
    fn test_array_item_path() {
        let schema = Schema::array(Schema::Integer);
        let err = schema.validate(&json!([1, 2, "three"])).unwrap_err();
        assert_eq!(err.path, "$[2]");
        assert!(err.cause.contains("expected integer"));
    }

    #[test]
    fn test_strict_rejects_unknown_keys() {
        let schema = Schema::object([("a", Schema::Bool)]).strict();
        let err = schema.validate(&json!({ "a": true, "b": 1 })).unwrap_err();
        assert_eq!(err.path, "$.b");

        let lenient = Schema::object([("a", Schema::Bool)]);
        let value = lenient.validate(&json!({ "a": true, "b": 1 })).unwrap();
        assert_eq!(value, json!({ "a": true, "b": 1 }));
    }

    #[test]
    fn test_integer_rejects_fraction() {
        assert!(Schema::Integer.validate(&json!(1.5)).is_err());
        assert!(Schema::Number.validate(&json!(1.5)).is_ok());
    }

    #[test]
    fn test_one_of_literals() {
        let schema = Schema::one_of_literals([json!("low"), json!("high")]);
        assert!(schema.validate(&json!("high")).is_ok());
        assert!(schema.validate(&json!("medium")).is_err());
    }

    #[test]
    fn test_validate_as_typed_output() {
        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct Cfg {
            prefix: String,
            limit: u32,
        }

        let schema = Schema::object([
            ("prefix", Schema::String.with_default(json!(">"))),
            ("limit", Schema::Integer),
        ]);
        let cfg: Cfg = schema.validate_as(&json!({ "limit": 5 })).unwrap();
        assert_eq!(
            cfg,
            Cfg {
                prefix: ">".into(),
                limit: 5
            }
        );
    }

    #[test]
    fn test_default_on_null_root() {
        let schema = Schema::object([("on", Schema::Bool.with_default(json!(false)))])
            .with_default(json!({}));
        assert_eq!(schema.validate(&Value::Null).unwrap(), json!({ "on": false }));
    }
}
