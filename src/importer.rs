//! Row import engine.
//!
//! Rows are processed strictly in file order: a group created by row 3 must
//! be visible to the membership lookups of row 4. Per-row failures are
//! recorded and the loop moves on; only an unreadable file or a broken
//! template stops a run.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::converters::ConvertOptions;
use crate::csv_source::{read_records, RawRecord};
use crate::error::{ImportError, Result};
use crate::field_types::{ApplyContext, ApplyFn, FieldTypeRegistry, Role};
use crate::outcome::{self, ImportOutcome, Tally};
use crate::progress::{MessageLevel, ProgressSink};
use crate::reconcile::{reconcile, InactiveBucket};
use crate::schema::{derive_schema, ParseSchema};
use crate::settings::ImportSettings;
use crate::store::{Entity, EntityKind, EntityStore, Payload, Relation};
use crate::templates::ImportTemplate;
use crate::values::CellValue;

pub struct ImportRequest<'a> {
    pub template: &'a ImportTemplate,
    pub data: &'a [u8],
    /// Written onto every imported group.
    pub school_term: Option<&'a str>,
    pub settings: &'a ImportSettings,
    pub cancel: Option<Arc<AtomicBool>>,
}

/// Converted values of one CSV record, keyed by column key.
struct Row<'s> {
    schema: &'s ParseSchema,
    values: HashMap<&'s str, CellValue>,
}

impl<'s> Row<'s> {
    fn build(schema: &'s ParseSchema, record: &RawRecord, opts: &ConvertOptions) -> Result<Self> {
        let mut values = HashMap::new();
        for column in schema.materialized() {
            let raw = record
                .cells
                .get(column.position)
                .map(String::as_str)
                .unwrap_or("");
            values.insert(column.key.as_str(), column.convert(raw, opts)?);
        }
        Ok(Self {
            schema,
            values,
        })
    }

    /// Value of the (single) column of field type `name`.
    fn field(&self, name: &str) -> Option<&CellValue> {
        let column = self.schema.column_for(name)?;
        self.values.get(column.key.as_str())
    }

    fn group_values(&self, keys: &[String]) -> Vec<CellValue> {
        keys.iter()
            .map(|k| self.values.get(k.as_str()).cloned().unwrap_or(CellValue::Empty))
            .collect()
    }
}

enum RowResult {
    Upserted { created: bool, problems: Vec<String> },
    Deferred,
}

struct Engine<'a> {
    registry: &'a FieldTypeRegistry,
    schema: ParseSchema,
    template: &'a ImportTemplate,
    settings: &'a ImportSettings,
    opts: ConvertOptions,
    school_term: Option<&'a str>,
    base_group: Option<Entity>,
    supports_active: bool,
}

fn is_active_value(value: &CellValue) -> bool {
    matches!(
        value,
        CellValue::Empty | CellValue::Bool(true) | CellValue::Integer(2)
    )
}

impl<'a> Engine<'a> {
    fn kind(&self) -> EntityKind {
        self.schema.target_kind
    }

    fn liveness(&self, row: &Row<'_>) -> bool {
        if !self.supports_active {
            return true;
        }
        self.schema
            .materialized()
            .filter(|c| c.descriptor.role.target_attribute() == Some("is_active"))
            .filter_map(|c| row.values.get(c.key.as_str()))
            .all(is_active_value)
    }

    fn payload(&self, row: &Row<'_>) -> Payload {
        let mut payload = Payload::new();
        for column in self.schema.materialized() {
            let Some(target) = column.descriptor.role.target_attribute() else {
                continue;
            };
            if target == "is_active" {
                continue;
            }
            match row.values.get(column.key.as_str()) {
                Some(v) if !v.is_empty() => {
                    payload.insert(target.to_string(), v.clone());
                }
                _ => {}
            }
        }

        for descriptor in self.registry.allowed_for(self.kind()) {
            let Some(alternative) = descriptor.alternative_of else {
                continue;
            };
            let Some(target) = descriptor.role.target_attribute() else {
                continue;
            };
            if self.schema.has_field(descriptor.name) || !self.schema.has_field(alternative) {
                continue;
            }
            if let Some(v) = row.field(alternative).filter(|v| !v.is_empty()) {
                payload.insert(target.to_string(), v.clone());
            }
        }

        if self.supports_active {
            payload.insert("is_active".into(), CellValue::Bool(true));
        }
        if self.kind() == EntityKind::Group {
            if let Some(group_type) = &self.template.group_type {
                payload.insert("group_type".into(), CellValue::Text(group_type.clone()));
            }
            if let Some(term) = self.school_term {
                payload.insert("school_term".into(), CellValue::Text(term.to_string()));
            }
        }
        payload
    }

    /// First match field type, by priority, with a value in this row.
    fn identity(&self, row: &Row<'_>, payload: &Payload) -> Result<(&'static str, String)> {
        let mut tried = Vec::new();
        for descriptor in self.registry.unique_references_by_priority() {
            if !descriptor.applies_to(self.kind()) {
                continue;
            }
            let Role::Match {
                identity_attribute, ..
            } = descriptor.role
            else {
                continue;
            };
            tried.push(descriptor.name);
            let value = row
                .field(descriptor.name)
                .or_else(|| payload.get(identity_attribute))
                .and_then(CellValue::to_text)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
            if let Some(value) = value {
                return Ok((identity_attribute, value));
            }
        }
        Err(ImportError::MissingIdentity {
            tried: tried.join(", "),
        })
    }

    fn apply_steps(&self, row: &Row<'_>) -> Vec<(&'static str, ApplyFn, Vec<CellValue>)> {
        let mut steps = Vec::new();
        let mut seen = Vec::new();
        for column in self.schema.materialized() {
            let name = column.descriptor.name;
            match column.descriptor.role {
                Role::MultiValue { apply } => {
                    if seen.contains(&name) {
                        continue;
                    }
                    seen.push(name);
                    let values = self
                        .schema
                        .multi_value_groups
                        .get(name)
                        .map(|keys| row.group_values(keys))
                        .unwrap_or_default();
                    if values.iter().any(|v| !v.is_empty()) {
                        steps.push((name, apply, values));
                    }
                }
                Role::CustomProcess { apply } => {
                    if let Some(v) = row.values.get(column.key.as_str()).filter(|v| !v.is_empty()) {
                        steps.push((name, apply, vec![v.clone()]));
                    }
                }
                _ => {}
            }
        }
        steps
    }

    fn process_row(
        &self,
        store: &mut dyn EntityStore,
        row: &Row<'_>,
        inactive: &mut InactiveBucket,
    ) -> Result<RowResult> {
        let active = self.liveness(row);
        let payload = self.payload(row);
        let (identity_attribute, identity_value) = self.identity(row, &payload)?;

        if !active {
            inactive.push(identity_attribute, identity_value);
            return Ok(RowResult::Deferred);
        }

        let (entity, created) =
            store.upsert(self.kind(), identity_attribute, &identity_value, &payload)?;

        let row_groups: BTreeMap<&'static str, Vec<CellValue>> = self
            .schema
            .multi_value_groups
            .iter()
            .map(|(name, keys)| (*name, row.group_values(keys)))
            .collect();
        let mut problems = Vec::new();
        for (field_type, apply, values) in self.apply_steps(row) {
            let mut ctx = ApplyContext {
                store: &mut *store,
                settings: self.settings,
                field_type,
                row_groups: &row_groups,
            };
            if let Err(e) = apply(&mut ctx, &entity, &values) {
                problems.push(format!("{}: {}", field_type, e));
            }
        }

        if let Some(group) = &self.base_group {
            if let Err(e) = store.add_membership(Relation::MemberOf, &entity, group) {
                problems.push(format!("base group: {}", e));
            }
        }

        Ok(RowResult::Upserted { created, problems })
    }
}

fn cancelled(flag: &Option<Arc<AtomicBool>>) -> bool {
    flag.as_ref()
        .map(|f| f.load(Ordering::Relaxed))
        .unwrap_or(false)
}

/// Run one import. `Err` is reserved for template/configuration problems;
/// everything else ends up in the returned outcome.
pub fn run(
    registry: &FieldTypeRegistry,
    store: &mut dyn EntityStore,
    request: ImportRequest<'_>,
    progress: &mut dyn ProgressSink,
) -> Result<ImportOutcome> {
    let template = request.template;
    let kind = template.target_kind;
    let schema = derive_schema(registry, template)?;
    tracing::debug!(columns = ?schema.column_keys(), "derived schema");

    let base_group = match (&template.base_group, kind) {
        (Some(short_name), EntityKind::Person) => {
            match store.find_one(EntityKind::Group, "short_name", short_name)? {
                Some(g) => Some(g),
                None => {
                    return Err(ImportError::config(format!(
                        "base group {} does not exist",
                        short_name
                    )))
                }
            }
        }
        _ => None,
    };

    tracing::info!(template = %template.name, kind = kind.as_str(), "import started");

    let records = match read_records(
        request.data,
        template.separator,
        template.has_header_row,
        schema.record_width(),
    ) {
        Ok(r) => r,
        Err(e @ ImportError::FatalParse { .. }) => {
            let outcome = ImportOutcome::fatal(e.to_string());
            progress.add_message(MessageLevel::Error, e.to_string());
            outcome::report(&outcome, kind, progress);
            return Ok(outcome);
        }
        Err(e) => return Err(e),
    };

    let engine = Engine {
        registry,
        supports_active: registry.supports_active(kind),
        opts: request.settings.convert_options(),
        schema,
        template,
        settings: request.settings,
        school_term: request.school_term.map(str::trim).filter(|s| !s.is_empty()),
        base_group,
    };

    progress.set_total(records.len());
    progress.add_message(
        MessageLevel::Info,
        format!("Importing {} rows with template {}.", records.len(), template.name),
    );
    let mut tally = Tally::new(records.len());
    let mut inactive = InactiveBucket::default();
    let mut was_cancelled = false;

    for (i, record) in records.iter().enumerate() {
        if cancelled(&request.cancel) {
            was_cancelled = true;
            break;
        }
        let label = format!("Row {} (line {})", i + 1, record.line);
        let result = Row::build(&engine.schema, record, &engine.opts)
            .and_then(|row| engine.process_row(store, &row, &mut inactive));
        match result {
            Ok(RowResult::Upserted { created, problems }) => {
                if created {
                    tally.created += 1;
                } else {
                    tally.updated += 1;
                }
                for p in problems {
                    let msg = format!("{}: {}", label, p);
                    progress.add_message(MessageLevel::Error, msg.clone());
                    tally.errors.push(msg);
                }
            }
            Ok(RowResult::Deferred) => tally.inactive_rows += 1,
            Err(e) if e.is_row_level() => {
                let msg = format!("{}: {}", label, e);
                progress.add_message(MessageLevel::Error, msg.clone());
                tally.errors.push(msg);
            }
            Err(e) => return Err(e),
        }
        tally.processed_rows += 1;
        progress.set_progress(tally.processed_rows);
    }

    if !was_cancelled {
        match reconcile(registry, store, kind, &inactive) {
            Ok(n) => tally.deactivated = n,
            Err(e) => {
                let msg = format!("Deactivation failed: {}", e);
                progress.add_message(MessageLevel::Error, msg.clone());
                tally.errors.push(msg);
            }
        }
    }

    let outcome = tally.finish(was_cancelled);
    outcome::report(&outcome, kind, progress);
    tracing::info!(
        template = %template.name,
        state = ?outcome.state,
        created = outcome.created,
        updated = outcome.updated,
        deactivated = outcome.deactivated,
        errors = outcome.errors.len(),
        "import finished"
    );
    Ok(outcome)
}
