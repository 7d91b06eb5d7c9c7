use std::collections::BTreeMap;

use super::AtomKind;
use super::CollectionKind;
use super::ConfigSchema;
use crate::script::Value;

/// One step of a path into a configuration value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldAccess {
    Member(String),
    Index(usize),
}

/// Path to the offending part of a value, rendered like `.a[3].b`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldPath(Vec<FieldAccess>);

impl FieldPath {
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn steps(&self) -> &[FieldAccess] {
        &self.0
    }

    fn push(&mut self, step: FieldAccess) {
        self.0.push(step);
    }

    fn pop(&mut self) {
        self.0.pop();
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for step in &self.0 {
            match step {
                FieldAccess::Member(name) => write!(f, ".{}", name)?,
                FieldAccess::Index(idx) => write!(f, "[{}]", idx)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub path: FieldPath,
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_root() {
            write!(f, "Invalid new configuration: {}", self.message)
        } else {
            write!(
                f,
                "Invalid new configuration: field `{}`: {}",
                self.path, self.message
            )
        }
    }
}

impl std::error::Error for ConfigError {}

/// Check a loosely-typed value against `schema` without keeping the result.
pub fn validate(value: &serde_json::Value, schema: &ConfigSchema) -> Result<(), ConfigError> {
    decode(value, schema).map(|_| ())
}

/// Check a loosely-typed value against `schema` and convert it into a typed
/// singleton value.
pub fn decode(value: &serde_json::Value, schema: &ConfigSchema) -> Result<Value, ConfigError> {
    let mut path = FieldPath::default();
    decode_at(value, schema, &mut path)
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "NULL",
        serde_json::Value::Bool(_) => "BOOL",
        serde_json::Value::Number(n) if integral(n).is_some() => "INT",
        serde_json::Value::Number(_) => "FLOAT",
        serde_json::Value::String(_) => "STRING",
        serde_json::Value::Array(_) => "LIST",
        serde_json::Value::Object(_) => "OBJECT",
    }
}

/// Integer value of `n`, also for floats without a fractional part.
fn integral(n: &serde_json::Number) -> Option<i64> {
    if let Some(i) = n.as_i64() {
        return Some(i);
    }
    let f = n.as_f64()?;
    // The upper bound is exclusive: `i64::MAX as f64` rounds up to 2^63.
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

fn mismatch(path: &FieldPath, schema: &ConfigSchema, value: &serde_json::Value) -> ConfigError {
    ConfigError {
        path: path.clone(),
        message: format!("Expected {}, got {}", schema.kind_name(), json_kind(value)),
    }
}

fn decode_at(
    value: &serde_json::Value,
    schema: &ConfigSchema,
    path: &mut FieldPath,
) -> Result<Value, ConfigError> {
    use serde_json::Value as Json;

    match (schema, value) {
        (ConfigSchema::Atom { kind: AtomKind::String }, Json::String(s)) => {
            Ok(Value::String(s.clone()))
        }
        (ConfigSchema::Atom { kind: AtomKind::Bool }, Json::Bool(b)) => Ok(Value::Bool(*b)),
        (ConfigSchema::Atom { kind: AtomKind::Int }, Json::Number(n)) => match integral(n) {
            Some(i) => Ok(Value::Int(i)),
            None => Err(mismatch(path, schema, value)),
        },
        (ConfigSchema::Atom { kind: AtomKind::Float }, Json::Number(n)) => match n.as_f64() {
            Some(f) => Ok(Value::Float(f)),
            None => Err(mismatch(path, schema, value)),
        },
        (
            ConfigSchema::Collection {
                kind: CollectionKind::Option,
                ..
            },
            Json::Null,
        ) => Ok(Value::none()),
        (
            ConfigSchema::Collection {
                kind: CollectionKind::Option,
                inner,
            },
            _,
        ) => Ok(Value::some(decode_at(value, inner, path)?)),
        (
            ConfigSchema::Collection {
                kind: CollectionKind::List,
                inner,
            },
            Json::Array(items),
        ) => {
            let mut decoded = Vec::with_capacity(items.len());
            for (idx, item) in items.iter().enumerate() {
                path.push(FieldAccess::Index(idx));
                decoded.push(decode_at(item, inner, path)?);
                path.pop();
            }
            Ok(Value::List(decoded))
        }
        (ConfigSchema::Struct { fields }, Json::Object(object)) => {
            let mut decoded = BTreeMap::new();
            for field in fields {
                let Some(member) = object.get(&field.name) else {
                    return Err(ConfigError {
                        path: path.clone(),
                        message: format!("Missing object field `{}`", field.name),
                    });
                };
                path.push(FieldAccess::Member(field.name.clone()));
                decoded.insert(field.name.clone(), decode_at(member, &field.schema, path)?);
                path.pop();
            }

            if let Some(extra) = object.keys().find(|k| schema.field(k).is_none()) {
                return Err(ConfigError {
                    path: path.clone(),
                    message: format!("Illegal additional field `{}`", extra),
                });
            }
            Ok(Value::Object(decoded))
        }
        _ => Err(mismatch(path, schema, value)),
    }
}
