//! Entity store consumed by the importer, and its SQLite implementation.

use chrono::Utc;
use rusqlite::{params_from_iter, types::Value as SqlValue, Connection, ErrorCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

use crate::values::CellValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Person,
    Group,
}

impl EntityKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "person" => Some(Self::Person),
            "group" => Some(Self::Group),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Group => "group",
        }
    }

    pub fn plural(self) -> &'static str {
        match self {
            Self::Person => "persons",
            Self::Group => "groups",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            Self::Person => "persons",
            Self::Group => "school_groups",
        }
    }

    fn attributes(self) -> &'static [&'static str] {
        match self {
            Self::Person => PERSON_ATTRIBUTES,
            Self::Group => GROUP_ATTRIBUTES,
        }
    }

    fn required(self) -> &'static [&'static str] {
        match self {
            Self::Person => &["first_name", "last_name"],
            Self::Group => &["name", "short_name"],
        }
    }
}

const PERSON_ATTRIBUTES: &[&str] = &[
    "import_ref_csv",
    "short_name",
    "first_name",
    "last_name",
    "additional_name",
    "email",
    "date_of_birth",
    "sex",
    "street",
    "housenumber",
    "postal_code",
    "place",
    "phone_number",
    "mobile_number",
    "is_active",
    "primary_group_id",
];

const GROUP_ATTRIBUTES: &[&str] = &[
    "import_ref_csv",
    "short_name",
    "name",
    "group_type",
    "subject",
    "school_term",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub kind: EntityKind,
    pub id: String,
}

/// Attribute name → value written by one upsert/update.
pub type Payload = BTreeMap<String, CellValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// person → group
    MemberOf,
    /// group → person
    Owner,
    /// group → group
    ParentGroup,
    /// person → person
    Guardian,
}

struct RelationSpec {
    table: &'static str,
    owner_col: &'static str,
    target_col: &'static str,
    owner_kind: EntityKind,
    target_kind: EntityKind,
}

impl Relation {
    fn spec(self) -> RelationSpec {
        match self {
            Self::MemberOf => RelationSpec {
                table: "group_members",
                owner_col: "person_id",
                target_col: "group_id",
                owner_kind: EntityKind::Person,
                target_kind: EntityKind::Group,
            },
            Self::Owner => RelationSpec {
                table: "group_owners",
                owner_col: "group_id",
                target_col: "person_id",
                owner_kind: EntityKind::Group,
                target_kind: EntityKind::Person,
            },
            Self::ParentGroup => RelationSpec {
                table: "group_parents",
                owner_col: "group_id",
                target_col: "parent_id",
                owner_kind: EntityKind::Group,
                target_kind: EntityKind::Group,
            },
            Self::Guardian => RelationSpec {
                table: "person_guardians",
                owner_col: "person_id",
                target_col: "guardian_id",
                owner_kind: EntityKind::Person,
                target_kind: EntityKind::Person,
            },
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Backend(#[from] rusqlite::Error),
}

pub trait EntityStore {
    fn find_one(
        &self,
        kind: EntityKind,
        attribute: &str,
        value: &str,
    ) -> Result<Option<Entity>, StoreError>;

    /// Find by `identity_attribute == identity_value`, update with `payload`,
    /// or create. Returns the entity and whether it was created.
    fn upsert(
        &mut self,
        kind: EntityKind,
        identity_attribute: &str,
        identity_value: &str,
        payload: &Payload,
    ) -> Result<(Entity, bool), StoreError>;

    fn update(&mut self, entity: &Entity, payload: &Payload) -> Result<(), StoreError>;

    /// Set every currently active entity whose identity is in `values` to
    /// inactive. Returns the number of entities changed.
    fn bulk_deactivate(
        &mut self,
        kind: EntityKind,
        identity_attribute: &str,
        values: &[String],
    ) -> Result<usize, StoreError>;

    fn add_membership(
        &mut self,
        relation: Relation,
        owner: &Entity,
        target: &Entity,
    ) -> Result<(), StoreError>;

    /// Replace the relation set of `owner` with `targets`.
    fn set_collection(
        &mut self,
        relation: Relation,
        owner: &Entity,
        targets: &[Entity],
    ) -> Result<(), StoreError>;
}

pub struct SqliteStore<'c> {
    conn: &'c Connection,
}

fn check_attribute(kind: EntityKind, attribute: &str) -> Result<(), StoreError> {
    if kind.attributes().contains(&attribute) {
        Ok(())
    } else {
        Err(StoreError::Validation(format!(
            "{} has no attribute {}",
            kind.as_str(),
            attribute
        )))
    }
}

fn to_sql(value: &CellValue) -> SqlValue {
    match value {
        CellValue::Empty => SqlValue::Null,
        CellValue::Bool(b) => SqlValue::Integer(i64::from(*b)),
        CellValue::Integer(n) => SqlValue::Integer(*n),
        other => other
            .to_text()
            .map(SqlValue::Text)
            .unwrap_or(SqlValue::Null),
    }
}

fn map_write_err(e: rusqlite::Error) -> StoreError {
    match e.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => StoreError::Conflict(e.to_string()),
        _ => StoreError::Backend(e),
    }
}

fn now_string() -> String {
    Utc::now().to_rfc3339()
}

impl<'c> SqliteStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    fn find_ids(
        &self,
        kind: EntityKind,
        attribute: &str,
        value: &str,
    ) -> Result<Vec<String>, StoreError> {
        check_attribute(kind, attribute)?;
        let sql = format!(
            "SELECT id FROM {} WHERE {} = ? LIMIT 2",
            kind.table(),
            attribute
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let ids = stmt
            .query_map([value], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn write_update(
        &self,
        kind: EntityKind,
        id: &str,
        payload: &Payload,
    ) -> Result<(), StoreError> {
        let mut sets = Vec::new();
        let mut values = Vec::new();
        for (attr, value) in payload {
            check_attribute(kind, attr)?;
            sets.push(format!("{} = ?", attr));
            values.push(to_sql(value));
        }
        sets.push("updated_at = ?".to_string());
        values.push(SqlValue::Text(now_string()));
        values.push(SqlValue::Text(id.to_string()));
        let sql = format!(
            "UPDATE {} SET {} WHERE id = ?",
            kind.table(),
            sets.join(", ")
        );
        let n = self
            .conn
            .execute(&sql, params_from_iter(values))
            .map_err(map_write_err)?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("{} {}", kind.as_str(), id)));
        }
        Ok(())
    }

    fn write_insert(
        &self,
        kind: EntityKind,
        identity_attribute: &str,
        identity_value: &str,
        payload: &Payload,
    ) -> Result<Entity, StoreError> {
        for req in kind.required() {
            let present = if *req == identity_attribute {
                !identity_value.trim().is_empty()
            } else {
                payload.get(*req).map(|v| !v.is_empty()).unwrap_or(false)
            };
            if !present {
                return Err(StoreError::Validation(format!(
                    "{} requires {}",
                    kind.as_str(),
                    req
                )));
            }
        }

        let id = Uuid::new_v4().to_string();
        let mut cols = vec!["id".to_string(), identity_attribute.to_string()];
        let mut values = vec![
            SqlValue::Text(id.clone()),
            SqlValue::Text(identity_value.to_string()),
        ];
        for (attr, value) in payload {
            check_attribute(kind, attr)?;
            if attr == identity_attribute {
                continue;
            }
            cols.push(attr.clone());
            values.push(to_sql(value));
        }
        cols.push("updated_at".to_string());
        values.push(SqlValue::Text(now_string()));
        let placeholders = vec!["?"; cols.len()].join(", ");
        let sql = format!(
            "INSERT INTO {}({}) VALUES({})",
            kind.table(),
            cols.join(", "),
            placeholders
        );
        self.conn
            .execute(&sql, params_from_iter(values))
            .map_err(map_write_err)?;
        Ok(Entity { kind, id })
    }
}

#[cfg(test)]
impl SqliteStore<'_> {
    /// Read a single attribute back as text.
    pub fn attribute(
        &self,
        entity: &Entity,
        attribute: &str,
    ) -> Result<Option<String>, StoreError> {
        check_attribute(entity.kind, attribute)?;
        let sql = format!(
            "SELECT CAST({} AS TEXT) FROM {} WHERE id = ?",
            attribute,
            entity.kind.table()
        );
        let v = self
            .conn
            .query_row(&sql, [&entity.id], |r| r.get::<_, Option<String>>(0))?;
        Ok(v)
    }

    /// Target ids of `relation` for `owner`, sorted.
    pub fn related_ids(
        &self,
        relation: Relation,
        owner: &Entity,
    ) -> Result<Vec<String>, StoreError> {
        let spec = relation.spec();
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ? ORDER BY {}",
            spec.target_col, spec.table, spec.owner_col, spec.target_col
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let ids = stmt
            .query_map([&owner.id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

fn check_relation(
    relation: Relation,
    owner: &Entity,
    target_kind: EntityKind,
) -> Result<RelationSpec, StoreError> {
    let spec = relation.spec();
    if owner.kind != spec.owner_kind || target_kind != spec.target_kind {
        return Err(StoreError::Validation(format!(
            "{:?} links {} to {}",
            relation,
            spec.owner_kind.as_str(),
            spec.target_kind.as_str()
        )));
    }
    Ok(spec)
}

impl EntityStore for SqliteStore<'_> {
    fn find_one(
        &self,
        kind: EntityKind,
        attribute: &str,
        value: &str,
    ) -> Result<Option<Entity>, StoreError> {
        let ids = self.find_ids(kind, attribute, value)?;
        match ids.len() {
            0 => Ok(None),
            1 => Ok(ids.into_iter().next().map(|id| Entity { kind, id })),
            _ => Err(StoreError::Conflict(format!(
                "several {} have {} = {}",
                kind.plural(),
                attribute,
                value
            ))),
        }
    }

    fn upsert(
        &mut self,
        kind: EntityKind,
        identity_attribute: &str,
        identity_value: &str,
        payload: &Payload,
    ) -> Result<(Entity, bool), StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let ids = self.find_ids(kind, identity_attribute, identity_value)?;
        let result = match ids.as_slice() {
            [] => self
                .write_insert(kind, identity_attribute, identity_value, payload)
                .map(|e| (e, true)),
            [id] => self
                .write_update(kind, id, payload)
                .map(|_| (Entity { kind, id: id.clone() }, false)),
            _ => Err(StoreError::Conflict(format!(
                "several {} have {} = {}",
                kind.plural(),
                identity_attribute,
                identity_value
            ))),
        };
        match result {
            Ok(v) => {
                tx.commit()?;
                Ok(v)
            }
            Err(e) => {
                let _ = tx.rollback();
                Err(e)
            }
        }
    }

    fn update(&mut self, entity: &Entity, payload: &Payload) -> Result<(), StoreError> {
        self.write_update(entity.kind, &entity.id, payload)
    }

    fn bulk_deactivate(
        &mut self,
        kind: EntityKind,
        identity_attribute: &str,
        values: &[String],
    ) -> Result<usize, StoreError> {
        if !kind.attributes().contains(&"is_active") {
            return Err(StoreError::Validation(format!(
                "{} cannot be deactivated",
                kind.plural()
            )));
        }
        check_attribute(kind, identity_attribute)?;
        let now = now_string();
        let tx = self.conn.unchecked_transaction()?;
        let mut affected = 0usize;
        for chunk in values.chunks(500) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "UPDATE {} SET is_active = 0, updated_at = ? WHERE is_active = 1 AND {} IN ({})",
                kind.table(),
                identity_attribute,
                placeholders
            );
            let mut params = vec![SqlValue::Text(now.clone())];
            params.extend(chunk.iter().map(|v| SqlValue::Text(v.clone())));
            affected += tx.execute(&sql, params_from_iter(params))?;
        }
        tx.commit()?;
        Ok(affected)
    }

    fn add_membership(
        &mut self,
        relation: Relation,
        owner: &Entity,
        target: &Entity,
    ) -> Result<(), StoreError> {
        let spec = check_relation(relation, owner, target.kind)?;
        let sql = format!(
            "INSERT OR IGNORE INTO {}({}, {}) VALUES(?, ?)",
            spec.table, spec.owner_col, spec.target_col
        );
        self.conn
            .execute(&sql, [&owner.id, &target.id])
            .map_err(map_write_err)?;
        Ok(())
    }

    fn set_collection(
        &mut self,
        relation: Relation,
        owner: &Entity,
        targets: &[Entity],
    ) -> Result<(), StoreError> {
        let spec = check_relation(relation, owner, relation.spec().target_kind)?;
        if let Some(bad) = targets.iter().find(|t| t.kind != spec.target_kind) {
            return Err(StoreError::Validation(format!(
                "{:?} cannot target {} {}",
                relation,
                bad.kind.as_str(),
                bad.id
            )));
        }
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            &format!("DELETE FROM {} WHERE {} = ?", spec.table, spec.owner_col),
            [&owner.id],
        )?;
        let sql = format!(
            "INSERT OR IGNORE INTO {}({}, {}) VALUES(?, ?)",
            spec.table, spec.owner_col, spec.target_col
        );
        for t in targets {
            tx.execute(&sql, [&owner.id, &t.id]).map_err(map_write_err)?;
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn person_payload(first: &str, last: &str) -> Payload {
        let mut p = Payload::new();
        p.insert("first_name".into(), CellValue::from(first));
        p.insert("last_name".into(), CellValue::from(last));
        p
    }

    #[test]
    fn upsert_creates_then_updates() {
        let conn = db::open_in_memory().expect("db");
        let mut store = SqliteStore::new(&conn);
        let (a, created) = store
            .upsert(EntityKind::Person, "import_ref_csv", "1001", &person_payload("Ada", "Lovelace"))
            .expect("create");
        assert!(created);
        let (b, created) = store
            .upsert(EntityKind::Person, "import_ref_csv", "1001", &person_payload("Ada", "King"))
            .expect("update");
        assert!(!created);
        assert_eq!(a, b);
        assert_eq!(store.attribute(&a, "last_name").expect("read").as_deref(), Some("King"));
    }

    #[test]
    fn create_without_required_names_is_validation_error() {
        let conn = db::open_in_memory().expect("db");
        let mut store = SqliteStore::new(&conn);
        let err = store
            .upsert(EntityKind::Person, "import_ref_csv", "1", &person_payload("", "Doe"))
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)), "{err}");
        assert!(store
            .find_one(EntityKind::Person, "import_ref_csv", "1")
            .expect("find")
            .is_none());
    }

    #[test]
    fn unknown_attribute_is_rejected() {
        let conn = db::open_in_memory().expect("db");
        let mut store = SqliteStore::new(&conn);
        let mut p = person_payload("A", "B");
        p.insert("shoe_size".into(), CellValue::Integer(44));
        let err = store
            .upsert(EntityKind::Person, "import_ref_csv", "1", &p)
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[test]
    fn duplicate_short_name_is_conflict() {
        let conn = db::open_in_memory().expect("db");
        let mut store = SqliteStore::new(&conn);
        let mut p = person_payload("A", "B");
        p.insert("short_name".into(), CellValue::from("AB"));
        store
            .upsert(EntityKind::Person, "import_ref_csv", "1", &p)
            .expect("first");
        let err = store
            .upsert(EntityKind::Person, "import_ref_csv", "2", &p)
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)), "{err}");
    }

    #[test]
    fn bulk_deactivate_counts_only_active() {
        let conn = db::open_in_memory().expect("db");
        let mut store = SqliteStore::new(&conn);
        for r in ["1", "2", "3"] {
            store
                .upsert(EntityKind::Person, "import_ref_csv", r, &person_payload("X", r))
                .expect("create");
        }
        let refs = vec!["1".to_string(), "2".to_string(), "9".to_string()];
        let n = store
            .bulk_deactivate(EntityKind::Person, "import_ref_csv", &refs)
            .expect("deactivate");
        assert_eq!(n, 2);
        let again = store
            .bulk_deactivate(EntityKind::Person, "import_ref_csv", &refs)
            .expect("deactivate again");
        assert_eq!(again, 0);
        assert!(store
            .bulk_deactivate(EntityKind::Group, "short_name", &refs)
            .is_err());
    }

    #[test]
    fn set_collection_replaces_relation() {
        let conn = db::open_in_memory().expect("db");
        let mut store = SqliteStore::new(&conn);
        let mut g = Payload::new();
        g.insert("name".into(), CellValue::from("Class 5a"));
        let (group, _) = store
            .upsert(EntityKind::Group, "short_name", "5a", &g)
            .expect("group");
        let (p1, _) = store
            .upsert(EntityKind::Person, "short_name", "AB", &person_payload("A", "B"))
            .expect("p1");
        let (p2, _) = store
            .upsert(EntityKind::Person, "short_name", "CD", &person_payload("C", "D"))
            .expect("p2");

        store
            .set_collection(Relation::Owner, &group, &[p1.clone(), p2.clone()])
            .expect("set");
        store
            .set_collection(Relation::Owner, &group, &[p2.clone()])
            .expect("reset");
        assert_eq!(store.related_ids(Relation::Owner, &group).expect("ids"), vec![p2.id.clone()]);

        let err = store
            .add_membership(Relation::MemberOf, &group, &p1)
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }
}
