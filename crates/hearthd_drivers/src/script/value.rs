//! Runtime values exchanged with the script engine.
//!
//! Singleton state, call arguments and return values all travel as [`Value`]
//! trees. The driver layer only looks inside them through a
//! [`ConfigSchema`](crate::schema::ConfigSchema) or when it checks the
//! postcondition of a well-known driver function.

use std::collections::BTreeMap;

use serde_json::json;

/// Integer range, as produced by range literals (`0..100`, `0..=100`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeValue {
    pub start: i64,
    pub end: i64,
    pub end_inclusive: bool,
}

impl RangeValue {
    /// Inclusive `(lower, upper)` bounds of the range.
    ///
    /// Ranges may be written reversed (`100..0`) or end-exclusive; both are
    /// normalized before comparing a value against them.
    pub fn bounds(&self) -> (i64, i64) {
        let mut end = self.end;
        if end < self.start {
            if !self.end_inclusive {
                end = end.saturating_add(1);
            }
            (end, self.start)
        } else {
            if !self.end_inclusive {
                end = end.saturating_sub(1);
            }
            (self.start, end)
        }
    }

    pub fn contains(&self, value: i64) -> bool {
        if self.start == self.end && !self.end_inclusive {
            return false;
        }
        let (lower, upper) = self.bounds();
        lower <= value && value <= upper
    }
}

impl std::fmt::Display for RangeValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.end_inclusive {
            write!(f, "{}..={}", self.start, self.end)
        } else {
            write!(f, "{}..{}", self.start, self.end)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    Range(RangeValue),
    List(Vec<Value>),
    Option(Option<Box<Value>>),
    Object(BTreeMap<String, Value>),
}

/// Runtime kind of a [`Value`], without its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum ValueKind {
    Null,
    Int,
    Float,
    Bool,
    String,
    Range,
    List,
    Option,
    Object,
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Bool(_) => ValueKind::Bool,
            Value::String(_) => ValueKind::String,
            Value::Range(_) => ValueKind::Range,
            Value::List(_) => ValueKind::List,
            Value::Option(_) => ValueKind::Option,
            Value::Object(_) => ValueKind::Object,
        }
    }

    /// Build an object value from `(field, value)` pairs.
    pub fn object<K: Into<String>>(fields: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn some(value: Value) -> Self {
        Value::Option(Some(Box::new(value)))
    }

    pub fn none() -> Self {
        Value::Option(None)
    }

    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Value::Int(_) | Value::Float(_) | Value::Bool(_) | Value::String(_)
        )
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Object(fields) => fields.get(name),
            _ => None,
        }
    }

    /// Best-effort conversion of a JSON tree without a schema to guide it.
    ///
    /// Used to feed stale persisted blobs into [`migrate`](crate::schema::migrate);
    /// values that match a schema should go through
    /// [`decode`](crate::schema::decode) instead.
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            serde_json::Value::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Marshal into a loosely-typed JSON tree for external callers.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null | Value::Option(None) => serde_json::Value::Null,
            Value::Int(i) => json!(i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Bool(b) => json!(b),
            Value::String(s) => json!(s),
            Value::Range(r) => json!({
                "start": r.start,
                "end": r.end,
                "end_inclusive": r.end_inclusive,
            }),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Option(Some(inner)) => inner.to_json(),
            Value::Object(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{:?}", v),
            Value::Bool(b) => write!(f, "{}", b),
            Value::String(s) => write!(f, "{}", s),
            Value::Range(r) => write!(f, "{}", r),
            Value::List(items) => {
                write!(f, "[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Option(None) => write!(f, "none"),
            Value::Option(Some(inner)) => write!(f, "?{}", inner),
            Value::Object(fields) => {
                write!(f, "{{")?;
                for (idx, (name, value)) in fields.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, " {}: {}", name, value)?;
                }
                write!(f, " }}")
            }
        }
    }
}
