//! Validation of service data
//!
//! A schema checks the data a caller sent and returns the data the handler
//! will see, possibly with values coerced to the expected types.

use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Errors produced while validating service data
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    #[error("expected a dictionary")]
    NotAMapping,

    #[error("required key not provided @ data['{0}']")]
    Required(String),

    #[error("expected {expected} for dictionary value @ data['{key}']")]
    Invalid { key: String, expected: &'static str },

    #[error("extra keys not allowed @ data['{0}']")]
    ExtraKey(String),

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("{}", .0.join(", "))]
    JsonSchema(Vec<String>),
}

/// Validates service data before it reaches a handler
pub trait Schema: Send + Sync {
    /// Validate `data` and return the value handed to the handler
    fn validate(&self, data: &Value) -> Result<Value, SchemaError>;
}

impl<F> Schema for F
where
    F: Fn(&Value) -> Result<Value, SchemaError> + Send + Sync,
{
    fn validate(&self, data: &Value) -> Result<Value, SchemaError> {
        self(data)
    }
}

/// Target type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coerce {
    /// Integer, accepting numeric strings
    Int,
    /// Float, accepting numeric strings
    Float,
    /// String, accepting any scalar
    String,
    /// Boolean, accepting on/off, yes/no, true/false, 1/0
    Bool,
    /// Any value, unchanged
    Any,
}

impl Coerce {
    fn expected(self) -> &'static str {
        match self {
            Coerce::Int => "int",
            Coerce::Float => "float",
            Coerce::String => "str",
            Coerce::Bool => "boolean",
            Coerce::Any => "value",
        }
    }

    fn apply(self, value: &Value) -> Option<Value> {
        match self {
            Coerce::Int => match value {
                Value::Number(n) if n.is_i64() || n.is_u64() => Some(value.clone()),
                Value::Number(n) => n
                    .as_f64()
                    .filter(|f| f.is_finite())
                    .map(|f| Value::from(f.trunc() as i64)),
                Value::String(s) => s.trim().parse::<i64>().ok().map(Value::from),
                Value::Bool(b) => Some(Value::from(i64::from(*b))),
                _ => None,
            },
            Coerce::Float => match value {
                Value::Number(n) => n.as_f64().and_then(Number::from_f64).map(Value::Number),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map(Value::Number),
                _ => None,
            },
            Coerce::String => match value {
                Value::String(_) => Some(value.clone()),
                Value::Number(n) => Some(Value::String(n.to_string())),
                Value::Bool(b) => Some(Value::String(b.to_string())),
                _ => None,
            },
            Coerce::Bool => match value {
                Value::Bool(_) => Some(value.clone()),
                Value::Number(n) => n.as_f64().map(|f| Value::Bool(f != 0.0)),
                Value::String(s) => match s.trim().to_lowercase().as_str() {
                    "1" | "true" | "yes" | "on" | "enable" => Some(Value::Bool(true)),
                    "0" | "false" | "no" | "off" | "disable" => Some(Value::Bool(false)),
                    _ => None,
                },
                _ => None,
            },
            Coerce::Any => Some(value.clone()),
        }
    }
}

#[derive(Debug, Clone)]
struct Field {
    key: String,
    coerce: Coerce,
    required: bool,
    default: Option<Value>,
}

/// Mapping schema built from typed fields
///
/// ```
/// use opp_service_registry::{Coerce, FieldSchema, Schema};
/// use serde_json::json;
///
/// let schema = FieldSchema::new().required("number", Coerce::Int);
/// assert_eq!(schema.validate(&json!({"number": "23"})).unwrap(), json!({"number": 23}));
/// ```
#[derive(Debug, Clone, Default)]
pub struct FieldSchema {
    fields: Vec<Field>,
    allow_extra: bool,
}

impl FieldSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key that must be present
    pub fn required(mut self, key: impl Into<String>, coerce: Coerce) -> Self {
        self.fields.push(Field {
            key: key.into(),
            coerce,
            required: true,
            default: None,
        });
        self
    }

    /// Add a key that may be absent
    pub fn optional(mut self, key: impl Into<String>, coerce: Coerce) -> Self {
        self.fields.push(Field {
            key: key.into(),
            coerce,
            required: false,
            default: None,
        });
        self
    }

    /// Add a key that is filled with `default` when absent
    pub fn with_default(mut self, key: impl Into<String>, coerce: Coerce, default: Value) -> Self {
        self.fields.push(Field {
            key: key.into(),
            coerce,
            required: false,
            default: Some(default),
        });
        self
    }

    /// Pass unknown keys through instead of rejecting them
    pub fn allow_extra(mut self) -> Self {
        self.allow_extra = true;
        self
    }
}

impl Schema for FieldSchema {
    fn validate(&self, data: &Value) -> Result<Value, SchemaError> {
        let input = data.as_object().ok_or(SchemaError::NotAMapping)?;
        let mut output = Map::new();

        for field in &self.fields {
            match input.get(&field.key) {
                Some(value) => {
                    let coerced =
                        field
                            .coerce
                            .apply(value)
                            .ok_or_else(|| SchemaError::Invalid {
                                key: field.key.clone(),
                                expected: field.coerce.expected(),
                            })?;
                    output.insert(field.key.clone(), coerced);
                }
                None if field.required => return Err(SchemaError::Required(field.key.clone())),
                None => {
                    if let Some(default) = &field.default {
                        output.insert(field.key.clone(), default.clone());
                    }
                }
            }
        }

        for (key, value) in input {
            if self.fields.iter().any(|f| &f.key == key) {
                continue;
            }
            if !self.allow_extra {
                return Err(SchemaError::ExtraKey(key.clone()));
            }
            output.insert(key.clone(), value.clone());
        }

        Ok(Value::Object(output))
    }
}

/// JSON Schema validator; data passes through unchanged
pub struct JsonSchema {
    compiled: jsonschema::JSONSchema,
}

impl JsonSchema {
    /// Compile a JSON Schema document
    pub fn new(schema: &Value) -> Result<Self, SchemaError> {
        let compiled = jsonschema::JSONSchema::compile(schema)
            .map_err(|e| SchemaError::InvalidSchema(e.to_string()))?;
        Ok(Self { compiled })
    }
}

impl Schema for JsonSchema {
    fn validate(&self, data: &Value) -> Result<Value, SchemaError> {
        if let Err(errors) = self.compiled.validate(data) {
            return Err(SchemaError::JsonSchema(
                errors.map(|e| e.to_string()).collect(),
            ));
        }
        Ok(data.clone())
    }
}
