//! Structural validation of untyped JSON against a declared schema.

use serde_json::Value;
use thiserror::Error;

use super::Schema;
use crate::domain::errors::DomainError;

/// First mismatch found while validating: the path into the payload plus the
/// expected and actual kinds. No coercion, no default filling.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("at {path}: expected {expected}, got {actual}")]
pub struct SchemaError {
    pub path: String,
    pub expected: String,
    pub actual: String,
}

impl From<SchemaError> for DomainError {
    fn from(err: SchemaError) -> Self {
        DomainError::SchemaMismatch {
            path: err.path,
            expected: err.expected,
            actual: err.actual,
        }
    }
}

fn value_kind(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "boolean".to_string(),
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer".to_string(),
        Value::Number(_) => "number".to_string(),
        Value::String(_) => "string".to_string(),
        Value::Array(_) => "list".to_string(),
        Value::Object(_) => "record".to_string(),
    }
}

fn mismatch(path: &str, schema: &Schema, value: &Value) -> SchemaError {
    SchemaError {
        path: path.to_string(),
        expected: schema.kind(),
        actual: value_kind(value),
    }
}

/// Validate `value` against `schema`, reporting the first mismatch.
pub fn validate(schema: &Schema, value: &Value) -> Result<(), SchemaError> {
    validate_at(schema, value, "$")
}

fn validate_at(schema: &Schema, value: &Value, path: &str) -> Result<(), SchemaError> {
    match schema {
        Schema::Str => match value {
            Value::String(_) => Ok(()),
            _ => Err(mismatch(path, schema, value)),
        },
        Schema::Int => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(()),
            _ => Err(mismatch(path, schema, value)),
        },
        Schema::Float => match value {
            Value::Number(_) => Ok(()),
            _ => Err(mismatch(path, schema, value)),
        },
        Schema::Bool => match value {
            Value::Bool(_) => Ok(()),
            _ => Err(mismatch(path, schema, value)),
        },
        Schema::Enum(allowed) => match value {
            Value::String(s) if allowed.contains(&s.as_str()) => Ok(()),
            _ => Err(mismatch(path, schema, value)),
        },
        Schema::Nullable(inner) => match value {
            Value::Null => Ok(()),
            _ => validate_at(inner, value, path),
        },
        Schema::List(inner) => match value {
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    validate_at(inner, item, &format!("{}[{}]", path, i))?;
                }
                Ok(())
            }
            _ => Err(mismatch(path, schema, value)),
        },
        Schema::Record(fields) => match value {
            Value::Object(map) => {
                for (name, field_schema) in fields {
                    let field_path = format!("{}.{}", path, name);
                    match map.get(*name) {
                        Some(field_value) => {
                            validate_at(field_schema, field_value, &field_path)?
                        }
                        // Optional-undefined is forbidden; absence must be null.
                        None => {
                            return Err(SchemaError {
                                path: field_path,
                                expected: field_schema.kind(),
                                actual: "missing".to_string(),
                            })
                        }
                    }
                }
                for key in map.keys() {
                    if !fields.iter().any(|(name, _)| *name == key.as_str()) {
                        return Err(SchemaError {
                            path: format!("{}.{}", path, key),
                            expected: "no such field".to_string(),
                            actual: value_kind(&map[key]),
                        });
                    }
                }
                Ok(())
            }
            _ => Err(mismatch(path, schema, value)),
        },
        Schema::Union(alternatives) => {
            for alt in alternatives {
                if validate_at(alt, value, path).is_ok() {
                    return Ok(());
                }
            }
            Err(mismatch(path, schema, value))
        }
    }
}
