//! Field type registry.
//!
//! A field type describes how one (or, for multi-value types, several) CSV
//! columns map onto an entity. Descriptors are registered on a
//! [`RegistryBuilder`] at startup and frozen into a [`FieldTypeRegistry`]
//! that is passed explicitly to the schema deriver and the importer.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::converters::ConverterFn;
use crate::error::{ImportError, Result};
use crate::settings::ImportSettings;
use crate::store::{Entity, EntityKind, EntityStore};
use crate::values::{CellValue, ValueType};

/// Everything a custom apply step may touch while processing one row.
pub struct ApplyContext<'a> {
    pub store: &'a mut dyn EntityStore,
    pub settings: &'a ImportSettings,
    /// Name of the field type being applied.
    pub field_type: &'static str,
    /// Reassembled values of every multi-value field type in this row.
    pub row_groups: &'a BTreeMap<&'static str, Vec<CellValue>>,
}

pub type ApplyFn = fn(&mut ApplyContext<'_>, &Entity, &[CellValue]) -> Result<()>;

#[derive(Clone, Copy)]
pub enum Role {
    /// Finds an existing entity. Lower priority numbers win.
    Match {
        priority: u32,
        identity_attribute: &'static str,
    },
    DirectMapping {
        target_attribute: &'static str,
    },
    /// Spans several columns, reassembled in column order.
    MultiValue { apply: ApplyFn },
    CustomProcess { apply: ApplyFn },
    Ignore,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Match { .. } => "match",
            Self::DirectMapping { .. } => "direct_mapping",
            Self::MultiValue { .. } => "multi_value",
            Self::CustomProcess { .. } => "custom_process",
            Self::Ignore => "ignore",
        }
    }

    /// Entity attribute written from this column, if any.
    pub fn target_attribute(&self) -> Option<&'static str> {
        match self {
            Self::Match {
                identity_attribute, ..
            } => Some(identity_attribute),
            Self::DirectMapping { target_attribute } => Some(target_attribute),
            _ => None,
        }
    }
}

impl fmt::Debug for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Match {
                priority,
                identity_attribute,
            } => f
                .debug_struct("Match")
                .field("priority", priority)
                .field("identity_attribute", identity_attribute)
                .finish(),
            Self::DirectMapping { target_attribute } => f
                .debug_struct("DirectMapping")
                .field("target_attribute", target_attribute)
                .finish(),
            Self::MultiValue { .. } => f.write_str("MultiValue"),
            Self::CustomProcess { .. } => f.write_str("CustomProcess"),
            Self::Ignore => f.write_str("Ignore"),
        }
    }
}

#[derive(Clone)]
pub struct FieldTypeDescriptor {
    pub name: &'static str,
    pub verbose_name: &'static str,
    pub entity_kinds: &'static [EntityKind],
    pub value_type: ValueType,
    pub converter: Option<ConverterFn>,
    pub role: Role,
    /// Field type whose column is used when this one is absent.
    pub alternative_of: Option<&'static str>,
    /// Plain field types may appear once per template unless marked here.
    pub repeatable: bool,
}

impl FieldTypeDescriptor {
    pub const fn new(name: &'static str, verbose_name: &'static str, role: Role) -> Self {
        Self {
            name,
            verbose_name,
            entity_kinds: &[],
            value_type: ValueType::Text,
            converter: None,
            role,
            alternative_of: None,
            repeatable: false,
        }
    }

    pub const fn kinds(mut self, kinds: &'static [EntityKind]) -> Self {
        self.entity_kinds = kinds;
        self
    }

    pub const fn value_type(mut self, value_type: ValueType) -> Self {
        self.value_type = value_type;
        self
    }

    pub const fn converter(mut self, converter: ConverterFn) -> Self {
        self.converter = Some(converter);
        self
    }

    pub const fn alternative(mut self, other: &'static str) -> Self {
        self.alternative_of = Some(other);
        self
    }

    pub const fn repeatable(mut self) -> Self {
        self.repeatable = true;
        self
    }

    pub fn is_repeatable(&self) -> bool {
        self.repeatable || matches!(self.role, Role::Ignore | Role::MultiValue { .. })
    }

    pub fn applies_to(&self, kind: EntityKind) -> bool {
        self.entity_kinds.contains(&kind)
    }
}

impl fmt::Debug for FieldTypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldTypeDescriptor")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("value_type", &self.value_type)
            .field("entity_kinds", &self.entity_kinds)
            .field("alternative_of", &self.alternative_of)
            .finish()
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    descriptors: Vec<FieldTypeDescriptor>,
    by_name: HashMap<&'static str, usize>,
    by_kind: BTreeMap<EntityKind, Vec<usize>>,
    converters: HashMap<&'static str, ConverterFn>,
    match_types: Vec<(u32, usize)>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: FieldTypeDescriptor) -> Result<&mut Self> {
        if self.by_name.contains_key(descriptor.name) {
            return Err(ImportError::DuplicateFieldType(descriptor.name.to_string()));
        }
        let idx = self.descriptors.len();
        self.by_name.insert(descriptor.name, idx);
        for kind in descriptor.entity_kinds {
            self.by_kind.entry(*kind).or_default().push(idx);
        }
        if let Some(conv) = descriptor.converter {
            self.converters.insert(descriptor.name, conv);
        }
        if let Role::Match { priority, .. } = descriptor.role {
            self.match_types.push((priority, idx));
        }
        self.descriptors.push(descriptor);
        Ok(self)
    }

    /// Freeze into an immutable registry. Fails if an `alternative_of`
    /// points at a field type that was never registered.
    pub fn build(mut self) -> Result<FieldTypeRegistry> {
        for d in &self.descriptors {
            if let Some(alt) = d.alternative_of {
                if !self.by_name.contains_key(alt) {
                    return Err(ImportError::UnknownFieldType(alt.to_string()));
                }
            }
        }
        // Stable: equal priorities keep registration order.
        self.match_types.sort_by_key(|(priority, _)| *priority);
        Ok(FieldTypeRegistry {
            descriptors: self.descriptors,
            by_name: self.by_name,
            by_kind: self.by_kind,
            converters: self.converters,
            match_types: self.match_types,
        })
    }
}

pub struct FieldTypeRegistry {
    descriptors: Vec<FieldTypeDescriptor>,
    by_name: HashMap<&'static str, usize>,
    by_kind: BTreeMap<EntityKind, Vec<usize>>,
    converters: HashMap<&'static str, ConverterFn>,
    match_types: Vec<(u32, usize)>,
}

impl FieldTypeRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn get(&self, name: &str) -> Result<&FieldTypeDescriptor> {
        self.by_name
            .get(name)
            .map(|&i| &self.descriptors[i])
            .ok_or_else(|| ImportError::UnknownFieldType(name.to_string()))
    }

    /// `(name, verbose_name)` in registration order.
    pub fn choices(&self) -> Vec<(&'static str, &'static str)> {
        self.descriptors
            .iter()
            .map(|d| (d.name, d.verbose_name))
            .collect()
    }

    pub fn allowed_for(&self, kind: EntityKind) -> Vec<&FieldTypeDescriptor> {
        self.by_kind
            .get(&kind)
            .map(|idx| idx.iter().map(|&i| &self.descriptors[i]).collect())
            .unwrap_or_default()
    }

    /// Entity kinds at least one field type applies to.
    pub fn allowed_kinds(&self) -> Vec<EntityKind> {
        self.by_kind.keys().copied().collect()
    }

    pub fn unique_references_by_priority(&self) -> Vec<&FieldTypeDescriptor> {
        self.match_types
            .iter()
            .map(|&(_, i)| &self.descriptors[i])
            .collect()
    }

    pub fn converter(&self, name: &str) -> Option<ConverterFn> {
        self.converters.get(name).copied()
    }

    /// Whether imports of `kind` can carry an active/inactive state.
    pub fn supports_active(&self, kind: EntityKind) -> bool {
        self.allowed_for(kind)
            .iter()
            .any(|d| d.role.target_attribute() == Some("is_active"))
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldTypeDescriptor> {
        self.descriptors.iter()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOTH: &[EntityKind] = &[EntityKind::Person, EntityKind::Group];

    fn match_type(name: &'static str, priority: u32) -> FieldTypeDescriptor {
        FieldTypeDescriptor::new(
            name,
            name,
            Role::Match {
                priority,
                identity_attribute: "import_ref_csv",
            },
        )
        .kinds(BOTH)
    }

    #[test]
    fn duplicate_registration_fails_and_leaves_registry_unchanged() {
        let mut b = FieldTypeRegistry::builder();
        b.register(match_type("ref", 1)).expect("first");
        let second = b.register(
            FieldTypeDescriptor::new(
                "ref",
                "Other",
                Role::DirectMapping {
                    target_attribute: "email",
                },
            )
            .kinds(&[EntityKind::Group]),
        );
        assert!(matches!(second, Err(ImportError::DuplicateFieldType(ref n)) if n == "ref"));

        let reg = b.build().expect("build");
        assert_eq!(reg.len(), 1);
        assert!(matches!(reg.get("ref").expect("get").role, Role::Match { .. }));
        assert_eq!(reg.allowed_for(EntityKind::Group).len(), 1);
        assert_eq!(reg.unique_references_by_priority().len(), 1);
    }

    #[test]
    fn match_types_sorted_by_priority_stable_for_ties() {
        let mut b = FieldTypeRegistry::builder();
        b.register(match_type("ten", 10))
            .and_then(|b| b.register(match_type("one", 1)))
            .and_then(|b| b.register(match_type("eight", 8)))
            .and_then(|b| b.register(match_type("eight_too", 8)))
            .expect("register");
        let reg = b.build().expect("build");
        let names: Vec<_> = reg
            .unique_references_by_priority()
            .iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["one", "eight", "eight_too", "ten"]);
    }

    #[test]
    fn unknown_lookup_and_dangling_alternative() {
        let mut b = FieldTypeRegistry::builder();
        b.register(match_type("ref", 1)).expect("register");
        let reg = b.build().expect("build");
        assert!(matches!(reg.get("nope"), Err(ImportError::UnknownFieldType(_))));

        let mut b = FieldTypeRegistry::builder();
        b.register(match_type("ref", 1).alternative("missing"))
            .expect("register");
        assert!(matches!(b.build(), Err(ImportError::UnknownFieldType(ref n)) if n == "missing"));
    }

    #[test]
    fn choices_follow_registration_order() {
        let mut b = FieldTypeRegistry::builder();
        b.register(match_type("b", 2))
            .and_then(|b| b.register(FieldTypeDescriptor::new("a", "Ignore", Role::Ignore).kinds(BOTH)))
            .expect("register");
        let reg = b.build().expect("build");
        assert_eq!(reg.choices(), vec![("b", "b"), ("a", "Ignore")]);
        assert!(reg.get("a").expect("a").is_repeatable());
        assert!(!reg.get("b").expect("b").is_repeatable());
    }
}
