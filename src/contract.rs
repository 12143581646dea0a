//! Contract validator: structural checks of a decoded JSON body.
//!
//! A [`Schema`] describes the expected shape of a response. Validation is
//! fail-fast and reports the first mismatch together with its path, written
//! JSONPath style (`$[0].nombre`).
//!
//! ```
//! use rafaga::Schema;
//! use serde_json::json;
//!
//! let top3 = Schema::array_of(
//!     Schema::object()
//!         .field("id", Schema::Number)
//!         .field("nombre", Schema::String),
//! );
//! assert!(top3.validate(&json!([{"id": 1, "nombre": "x"}])).is_ok());
//!
//! let violation = top3.validate(&json!([{"id": 1, "nombre": null}])).unwrap_err();
//! assert_eq!(violation.field(), "nombre");
//! ```

use serde_json::Value;
use thiserror::Error;

use crate::sample::Sample;

/// Expected shape of a JSON value.
#[derive(Debug, Clone, PartialEq)]
pub enum Schema {
    /// Anything, as long as it is present.
    Any,
    Number,
    String,
    Boolean,
    /// Any array, elements unchecked.
    Array,
    /// One of the listed values.
    Enum(Vec<Value>),
    /// Exactly this value.
    Literal(Value),
    /// An array whose every element matches the inner schema.
    ArrayOf(Box<Schema>),
    Object(ObjectSchema),
}

/// Required keys of an object and the schema of each.
///
/// Keys not listed are tolerated unless the schema is [`closed`](Self::closed).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectSchema {
    pub fields: Vec<(String, Schema)>,
    pub closed: bool,
}

impl ObjectSchema {
    pub fn field(mut self, name: impl Into<String>, schema: impl Into<Schema>) -> Self {
        self.fields.push((name.into(), schema.into()));
        self
    }

    /// Reject keys that are not declared.
    pub fn closed(mut self) -> Self {
        self.closed = true;
        self
    }
}

impl From<ObjectSchema> for Schema {
    fn from(object: ObjectSchema) -> Self {
        Schema::Object(object)
    }
}

/// First mismatch found while validating.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{path}: {reason}")]
pub struct Violation {
    /// Location of the offending value, e.g. `$[2].estado`.
    pub path: String,
    pub reason: String,
}

impl Violation {
    fn new(path: &str, reason: impl Into<String>) -> Self {
        Self {
            path: path.to_owned(),
            reason: reason.into(),
        }
    }

    /// Last segment of the path: the key or index that failed.
    pub fn field(&self) -> &str {
        let last = self.path.rfind(['.', '[']).map_or(self.path.as_str(), |at| &self.path[at + 1..]);
        last.trim_end_matches(']')
    }
}

impl Schema {
    pub fn array_of(items: impl Into<Schema>) -> Self {
        Schema::ArrayOf(Box::new(items.into()))
    }

    pub fn object() -> ObjectSchema {
        ObjectSchema::default()
    }

    pub fn one_of(values: impl IntoIterator<Item = impl Into<Value>>) -> Self {
        Schema::Enum(values.into_iter().map(Into::into).collect())
    }

    pub fn validate(&self, value: &Value) -> Result<(), Violation> {
        self.validate_at(value, "$")
    }

    /// Decode the body of `sample` and validate it.
    pub fn validate_sample(&self, sample: &Sample) -> Result<(), Violation> {
        if let Some(error) = sample.error() {
            return Err(Violation::new("$", format!("no response: {error}")));
        }
        let body = sample
            .json()
            .map_err(|e| Violation::new("$", format!("body is not JSON: {e}")))?;
        self.validate(&body)
    }

    fn validate_at(&self, value: &Value, path: &str) -> Result<(), Violation> {
        let mismatch = |expected: &str| Violation::new(path, format!("expected {expected}, found {}", kind(value)));

        match self {
            Schema::Any => Ok(()),
            Schema::Number if value.is_number() => Ok(()),
            Schema::Number => Err(mismatch("number")),
            Schema::String if value.is_string() => Ok(()),
            Schema::String => Err(mismatch("string")),
            Schema::Boolean if value.is_boolean() => Ok(()),
            Schema::Boolean => Err(mismatch("boolean")),
            Schema::Array if value.is_array() => Ok(()),
            Schema::Array => Err(mismatch("array")),
            Schema::Enum(allowed) if allowed.contains(value) => Ok(()),
            Schema::Enum(allowed) => Err(Violation::new(
                path,
                format!("{value} is not one of {}", Value::Array(allowed.clone())),
            )),
            Schema::Literal(expected) if expected == value => Ok(()),
            Schema::Literal(expected) => Err(Violation::new(path, format!("expected {expected}, found {value}"))),
            Schema::ArrayOf(items) => {
                let elements = value.as_array().ok_or_else(|| mismatch("array"))?;
                elements
                    .iter()
                    .enumerate()
                    .try_for_each(|(i, element)| items.validate_at(element, &format!("{path}[{i}]")))
            }
            Schema::Object(object) => {
                let map = value.as_object().ok_or_else(|| mismatch("object"))?;
                for (name, schema) in &object.fields {
                    let field_path = format!("{path}.{name}");
                    let field = map
                        .get(name)
                        .ok_or_else(|| Violation::new(&field_path, "missing required key"))?;
                    schema.validate_at(field, &field_path)?;
                }
                if object.closed {
                    if let Some(extra) = map.keys().find(|k| !object.fields.iter().any(|(name, _)| name == *k)) {
                        return Err(Violation::new(&format!("{path}.{extra}"), "unexpected key in closed object"));
                    }
                }
                Ok(())
            }
        }
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
