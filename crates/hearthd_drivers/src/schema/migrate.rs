use super::CollectionKind;
use super::ConfigSchema;
use crate::script::Value;

/// Carry `old` over to the shape described by `schema`.
///
/// Compatible data is kept, everything else is replaced by the schema's zero
/// value. Struct fields come from the new schema only, so removed fields are
/// dropped. Lists are judged by their first element alone.
pub fn migrate(old: &Value, schema: &ConfigSchema) -> Value {
    match schema {
        ConfigSchema::Atom { .. } => {
            if schema.matches_kind(old) {
                old.clone()
            } else {
                schema.zero_value()
            }
        }
        ConfigSchema::Collection {
            kind: CollectionKind::List,
            inner,
        } => match old {
            Value::List(items) if items.first().is_none_or(|first| inner.matches_kind(first)) => {
                old.clone()
            }
            _ => Value::List(Vec::new()),
        },
        ConfigSchema::Collection {
            kind: CollectionKind::Option,
            inner,
        } => match old {
            Value::Option(Some(held)) if inner.matches_kind(held) => old.clone(),
            _ => Value::none(),
        },
        ConfigSchema::Struct { fields } => Value::Object(
            fields
                .iter()
                .map(|field| {
                    let migrated = match old.field(&field.name) {
                        Some(previous) => migrate(previous, &field.schema),
                        None => field.schema.zero_value(),
                    };
                    (field.name.clone(), migrated)
                })
                .collect(),
        ),
    }
}
