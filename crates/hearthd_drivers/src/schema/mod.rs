//! Structural configuration schemas derived from driver singletons.
//!
//! A [`ConfigSchema`] is the language-neutral shape of a singleton value. It
//! is used to gate configuration changes ([`validate`], [`decode`]), to carry
//! persisted state across script edits ([`migrate`]) and to describe the
//! configuration to user interfaces.

mod extract;
mod migrate;
mod validate;

use serde::Deserialize;
use serde::Serialize;

use crate::script::Value;

pub use extract::extract_driver_info;
pub use extract::extract_from_program;
pub use extract::lower_type;
pub use extract::DriverInfo;
pub use extract::Extraction;
pub use extract::DEVICE_SINGLETON;
pub use extract::DRIVER_SINGLETON;
pub use migrate::migrate;
pub use validate::decode;
pub use validate::validate;
pub use validate::ConfigError;
pub use validate::FieldAccess;
pub use validate::FieldPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum AtomKind {
    Int,
    Float,
    Bool,
    String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum CollectionKind {
    List,
    Option,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    pub schema: ConfigSchema,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum ConfigSchema {
    Atom {
        kind: AtomKind,
    },
    Collection {
        kind: CollectionKind,
        inner: Box<ConfigSchema>,
    },
    /// A valid value has exactly these fields, no more and no fewer.
    Struct {
        fields: Vec<SchemaField>,
    },
}

impl ConfigSchema {
    pub fn atom(kind: AtomKind) -> Self {
        ConfigSchema::Atom { kind }
    }

    pub fn list(inner: ConfigSchema) -> Self {
        ConfigSchema::Collection {
            kind: CollectionKind::List,
            inner: Box::new(inner),
        }
    }

    pub fn option(inner: ConfigSchema) -> Self {
        ConfigSchema::Collection {
            kind: CollectionKind::Option,
            inner: Box::new(inner),
        }
    }

    pub fn structure<K: Into<String>>(fields: impl IntoIterator<Item = (K, ConfigSchema)>) -> Self {
        ConfigSchema::Struct {
            fields: fields
                .into_iter()
                .map(|(name, schema)| SchemaField {
                    name: name.into(),
                    schema,
                })
                .collect(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&ConfigSchema> {
        match self {
            ConfigSchema::Struct { fields } => fields
                .iter()
                .find(|f| f.name == name)
                .map(|f| &f.schema),
            _ => None,
        }
    }

    /// Name of the schema's outermost kind, as used in error messages.
    pub fn kind_name(&self) -> String {
        match self {
            ConfigSchema::Atom { kind } => kind.to_string(),
            ConfigSchema::Collection { kind, .. } => kind.to_string(),
            ConfigSchema::Struct { .. } => "STRUCT".to_string(),
        }
    }

    /// Whether `value`'s runtime kind is the kind this schema describes.
    /// Only the outermost layer is compared.
    pub fn matches_kind(&self, value: &Value) -> bool {
        match (self, value) {
            (ConfigSchema::Atom { kind: AtomKind::Int }, Value::Int(_)) => true,
            (ConfigSchema::Atom { kind: AtomKind::Float }, Value::Float(_)) => true,
            (ConfigSchema::Atom { kind: AtomKind::Bool }, Value::Bool(_)) => true,
            (ConfigSchema::Atom { kind: AtomKind::String }, Value::String(_)) => true,
            (
                ConfigSchema::Collection {
                    kind: CollectionKind::List,
                    ..
                },
                Value::List(_),
            ) => true,
            (
                ConfigSchema::Collection {
                    kind: CollectionKind::Option,
                    ..
                },
                Value::Option(_),
            ) => true,
            (ConfigSchema::Struct { .. }, Value::Object(_)) => true,
            _ => false,
        }
    }

    /// The value a freshly created singleton of this shape starts with.
    pub fn zero_value(&self) -> Value {
        match self {
            ConfigSchema::Atom { kind } => match kind {
                AtomKind::Int => Value::Int(0),
                AtomKind::Float => Value::Float(0.0),
                AtomKind::Bool => Value::Bool(false),
                AtomKind::String => Value::String(String::new()),
            },
            ConfigSchema::Collection {
                kind: CollectionKind::List,
                ..
            } => Value::List(Vec::new()),
            ConfigSchema::Collection {
                kind: CollectionKind::Option,
                ..
            } => Value::none(),
            ConfigSchema::Struct { fields } => Value::Object(
                fields
                    .iter()
                    .map(|f| (f.name.clone(), f.schema.zero_value()))
                    .collect(),
            ),
        }
    }
}

impl std::fmt::Display for ConfigSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSchema::Atom { kind } => write!(f, "{}", kind),
            ConfigSchema::Collection {
                kind: CollectionKind::List,
                inner,
            } => write!(f, "[{}]", inner),
            ConfigSchema::Collection {
                kind: CollectionKind::Option,
                inner,
            } => write!(f, "?{}", inner),
            ConfigSchema::Struct { fields } => {
                write!(f, "{{")?;
                for (idx, field) in fields.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, " {}: {}", field.name, field.schema)?;
                }
                write!(f, " }}")
            }
        }
    }
}
