//! Deactivation of entities marked inactive in the imported file.

use std::collections::BTreeMap;

use crate::field_types::FieldTypeRegistry;
use crate::store::{EntityKind, EntityStore, StoreError};

/// Identities of inactive rows, grouped by identity attribute.
#[derive(Debug, Default)]
pub struct InactiveBucket {
    by_attribute: BTreeMap<&'static str, Vec<String>>,
}

impl InactiveBucket {
    pub fn push(&mut self, attribute: &'static str, value: String) {
        self.by_attribute.entry(attribute).or_default().push(value);
    }

    pub fn is_empty(&self) -> bool {
        self.by_attribute.values().all(Vec::is_empty)
    }

    pub fn len(&self) -> usize {
        self.by_attribute.values().map(Vec::len).sum()
    }
}

/// One bulk deactivation per identity attribute. Returns the number of
/// previously active entities that were deactivated.
pub fn reconcile(
    registry: &FieldTypeRegistry,
    store: &mut dyn EntityStore,
    kind: EntityKind,
    bucket: &InactiveBucket,
) -> Result<usize, StoreError> {
    if bucket.is_empty() || !registry.supports_active(kind) {
        return Ok(0);
    }
    tracing::debug!(identities = bucket.len(), "reconciling inactive rows");
    let mut affected = 0;
    for (attribute, values) in &bucket.by_attribute {
        if values.is_empty() {
            continue;
        }
        let n = store.bulk_deactivate(kind, attribute, values)?;
        tracing::info!(kind = kind.as_str(), attribute, deactivated = n, "bulk deactivation");
        affected += n;
    }
    Ok(affected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin_fields::builtin_registry;
    use crate::db;
    use crate::store::{Payload, SqliteStore};
    use crate::values::CellValue;

    #[test]
    fn deactivates_per_attribute_and_skips_groups() {
        let conn = db::open_in_memory().expect("db");
        let reg = builtin_registry().expect("registry");
        let mut store = SqliteStore::new(&conn);
        let mut p = Payload::new();
        p.insert("first_name".into(), CellValue::from("A"));
        p.insert("last_name".into(), CellValue::from("B"));
        let (by_ref, _) = store
            .upsert(EntityKind::Person, "import_ref_csv", "100", &p)
            .expect("p1");
        let (by_short, _) = store
            .upsert(EntityKind::Person, "short_name", "AB", &p)
            .expect("p2");

        let mut bucket = InactiveBucket::default();
        assert_eq!(
            reconcile(&reg, &mut store, EntityKind::Person, &bucket).expect("noop"),
            0
        );
        bucket.push("import_ref_csv", "100".into());
        bucket.push("short_name", "AB".into());
        bucket.push("short_name", "ZZ".into());
        assert_eq!(bucket.len(), 3);
        assert_eq!(
            reconcile(&reg, &mut store, EntityKind::Person, &bucket).expect("run"),
            2
        );
        for e in [&by_ref, &by_short] {
            assert_eq!(store.attribute(e, "is_active").expect("read").as_deref(), Some("0"));
        }
        assert_eq!(
            reconcile(&reg, &mut store, EntityKind::Group, &bucket).expect("groups"),
            0
        );
    }
}
