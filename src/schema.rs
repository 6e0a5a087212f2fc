//! Derive a parse schema from a template's field sequence.

use std::collections::{BTreeMap, HashSet};

use uuid::Uuid;

use crate::converters::{ConvertOptions, ConverterFn};
use crate::error::{ImportError, Result};
use crate::field_types::{FieldTypeDescriptor, FieldTypeRegistry, Role};
use crate::store::EntityKind;
use crate::templates::ImportTemplate;
use crate::values::{CellValue, ValueType};

pub const IGNORE_PREFIX: &str = "_ignore_";

#[derive(Debug, Clone)]
pub struct ColumnSpec {
    /// Position in the CSV record: the template field index.
    pub position: usize,
    pub key: String,
    pub descriptor: FieldTypeDescriptor,
    pub value_type: ValueType,
    pub converter: Option<ConverterFn>,
}

impl ColumnSpec {
    pub fn is_ignored(&self) -> bool {
        self.key.starts_with(IGNORE_PREFIX)
    }

    /// Convert one raw cell. Soft converters yield `Empty` on garbage;
    /// boolean and integer columns reject it.
    pub fn convert(&self, raw: &str, opts: &ConvertOptions) -> Result<CellValue> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(CellValue::Empty);
        }
        let Some(conv) = self.converter else {
            return Ok(CellValue::Text(raw.to_string()));
        };
        let value = conv(raw, opts);
        let strict = matches!(self.value_type, ValueType::Boolean | ValueType::Integer);
        if strict && value.is_empty() {
            return Err(ImportError::Conversion {
                column: self.descriptor.name.to_string(),
                value: raw.to_string(),
                expected: self.value_type.as_str(),
            });
        }
        Ok(value)
    }
}

#[derive(Debug, Clone)]
pub struct ParseSchema {
    pub target_kind: EntityKind,
    pub columns: Vec<ColumnSpec>,
    /// Multi-value field type → its column keys in column order.
    pub multi_value_groups: BTreeMap<&'static str, Vec<String>>,
}

impl ParseSchema {
    pub fn column_keys(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.key.as_str()).collect()
    }

    /// Cells every record must have. Indices not mapped by the template are
    /// gap columns and are skipped.
    pub fn record_width(&self) -> usize {
        self.columns
            .iter()
            .map(|c| c.position + 1)
            .max()
            .unwrap_or(0)
    }

    /// Columns materialized into rows.
    pub fn materialized(&self) -> impl Iterator<Item = &ColumnSpec> {
        self.columns.iter().filter(|c| !c.is_ignored())
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.descriptor.name == name)
    }

    pub fn column_for(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.descriptor.name == name)
    }
}

fn column_key(descriptor: &FieldTypeDescriptor) -> String {
    match descriptor.role {
        Role::Ignore => format!("{}{}", IGNORE_PREFIX, Uuid::new_v4()),
        Role::MultiValue { .. } => format!("{}_{}", descriptor.name, Uuid::new_v4()),
        _ => descriptor.name.to_string(),
    }
}

/// Resolve every template field against the registry and assign column
/// keys. Unknown, disallowed and illegally repeated field types are
/// configuration errors.
pub fn derive_schema(registry: &FieldTypeRegistry, template: &ImportTemplate) -> Result<ParseSchema> {
    let kind = template.target_kind;
    let mut seen_indices = HashSet::new();
    let mut seen_plain = HashSet::new();
    let mut columns = Vec::with_capacity(template.fields.len());
    let mut multi_value_groups: BTreeMap<&'static str, Vec<String>> = BTreeMap::new();

    for field in template.field_sequence() {
        if !seen_indices.insert(field.index) {
            return Err(ImportError::config(format!(
                "column index {} is used twice",
                field.index
            )));
        }
        let descriptor = registry.get(&field.field_type).map_err(|_| {
            ImportError::config(format!("unknown field type {}", field.field_type))
        })?;
        if !descriptor.applies_to(kind) {
            return Err(ImportError::config(format!(
                "field type {} cannot be used for {}",
                descriptor.name,
                kind.plural()
            )));
        }
        if !descriptor.is_repeatable() && !seen_plain.insert(descriptor.name) {
            return Err(ImportError::config(format!(
                "field type {} appears more than once",
                descriptor.name
            )));
        }

        let key = column_key(descriptor);
        if let Role::MultiValue { .. } = descriptor.role {
            multi_value_groups
                .entry(descriptor.name)
                .or_default()
                .push(key.clone());
        }
        columns.push(ColumnSpec {
            position: field.index,
            key,
            descriptor: descriptor.clone(),
            value_type: descriptor.value_type,
            converter: registry.converter(descriptor.name),
        });
    }

    Ok(ParseSchema {
        target_kind: kind,
        columns,
        multi_value_groups,
    })
}
