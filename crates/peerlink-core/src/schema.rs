//! Input contracts for capabilities.
//!
//! Only a flat subset of JSON Schema is understood: the root must be an
//! `object`, `required` lists mandatory keys, and each entry in
//! `properties` may declare a primitive `type`. Nested schemas are carried
//! through to introspection but not validated.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// The declared input contract of a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSchema {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, PropertySchema>,
}

/// Per-property contract.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Anything else (nested `properties`, `items`, `enum`...), kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The six kinds a property `type` may name.
pub const KNOWN_KINDS: [&str; 6] = ["string", "integer", "number", "boolean", "array", "object"];

impl Default for InputSchema {
    fn default() -> Self {
        Self::object()
    }
}

impl InputSchema {
    /// An object schema with no constraints.
    pub fn object() -> Self {
        Self {
            kind: "object".to_string(),
            required: Vec::new(),
            properties: BTreeMap::new(),
        }
    }

    /// Add a typed property.
    pub fn property(mut self, name: impl Into<String>, kind: &str) -> Self {
        self.properties.insert(
            name.into(),
            PropertySchema {
                kind: Some(kind.to_string()),
                ..PropertySchema::default()
            },
        );
        self
    }

    /// Add a typed property that must be present.
    pub fn required_property(self, name: impl Into<String>, kind: &str) -> Self {
        let name = name.into();
        let mut schema = self.property(name.clone(), kind);
        schema.required.push(name);
        schema
    }

    /// Check the schema itself is one this validator can enforce.
    pub fn check(&self) -> Result<(), String> {
        if self.kind != "object" {
            return Err(format!("root type must be \"object\", got {:?}", self.kind));
        }
        for (name, prop) in &self.properties {
            if let Some(kind) = &prop.kind {
                if !KNOWN_KINDS.contains(&kind.as_str()) {
                    return Err(format!("property {name:?} has unsupported type {kind:?}"));
                }
            }
        }
        Ok(())
    }

    /// Validate `params` against this contract, returning the first violation.
    ///
    /// A missing `params` (JSON `null`) is treated as an empty object.
    pub fn validate(&self, params: &Value) -> Result<(), SchemaViolation> {
        let empty = Map::new();
        let fields = match params {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => {
                return Err(SchemaViolation::NotAnObject {
                    actual: value_kind(other),
                });
            }
        };

        for name in &self.required {
            if !fields.contains_key(name) {
                return Err(SchemaViolation::MissingField(name.clone()));
            }
        }

        for (name, value) in fields {
            let Some(expected) = self.properties.get(name).and_then(|p| p.kind.as_deref()) else {
                continue;
            };
            if !matches_kind(expected, value) {
                return Err(SchemaViolation::TypeMismatch {
                    field: name.clone(),
                    expected: expected.to_string(),
                    actual: value_kind(value),
                });
            }
        }

        Ok(())
    }
}

/// The first way a set of params broke the contract.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaViolation {
    #[error("Params must be an object, got {actual}")]
    NotAnObject { actual: &'static str },
    #[error("Missing required field: \"{0}\"")]
    MissingField(String),
    #[error("Field \"{field}\" expected type {expected}, got {actual}")]
    TypeMismatch {
        field: String,
        expected: String,
        actual: &'static str,
    },
}

/// Runtime kind of a JSON value, in schema vocabulary.
pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if is_integral(n) => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn is_integral(n: &serde_json::Number) -> bool {
    n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
}

fn matches_kind(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => matches!(value, Value::Number(n) if is_integral(n)),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        // Unknown kinds are rejected at registration.
        _ => true,
    }
}
