//! Built-in field types and their apply steps.

use crate::converters::{
    bool_cell, comma_separated_cell, date_cell, integer_cell, phone_number_cell, sex_cell,
};
use crate::error::{ImportError, Result};
use crate::field_types::{ApplyContext, FieldTypeDescriptor, FieldTypeRegistry, Role};
use crate::store::{Entity, EntityKind, Payload, Relation};
use crate::values::{CellValue, ValueType};

const PERSON: &[EntityKind] = &[EntityKind::Person];
const GROUP: &[EntityKind] = &[EntityKind::Group];
const BOTH: &[EntityKind] = &[EntityKind::Person, EntityKind::Group];

pub const GUARDIAN_FIELDS: [&str; 3] = [
    "guardian_first_name",
    "guardian_last_name",
    "guardian_email",
];

const fn direct(name: &'static str, verbose_name: &'static str, target: &'static str) -> FieldTypeDescriptor {
    FieldTypeDescriptor::new(
        name,
        verbose_name,
        Role::DirectMapping {
            target_attribute: target,
        },
    )
}

const fn multi(name: &'static str, verbose_name: &'static str, apply: crate::field_types::ApplyFn) -> FieldTypeDescriptor {
    FieldTypeDescriptor::new(name, verbose_name, Role::MultiValue { apply })
}

fn builtin_descriptors() -> Vec<FieldTypeDescriptor> {
    vec![
        FieldTypeDescriptor::new(
            "unique_reference",
            "Unique reference",
            Role::Match {
                priority: 10,
                identity_attribute: "import_ref_csv",
            },
        )
        .kinds(BOTH),
        direct("is_active", "Is active? (0/1)", "is_active")
            .kinds(PERSON)
            .value_type(ValueType::Boolean)
            .converter(bool_cell),
        direct(
            "is_active_schild_nrw_students",
            "Is active? (SchILD-NRW students)",
            "is_active",
        )
        .kinds(PERSON)
        .value_type(ValueType::Integer)
        .converter(integer_cell),
        direct("name", "Name", "name").kinds(GROUP).alternative("short_name"),
        direct("first_name", "First name", "first_name").kinds(PERSON),
        direct("last_name", "Last name", "last_name").kinds(PERSON),
        direct("additional_name", "Additional name", "additional_name").kinds(PERSON),
        FieldTypeDescriptor::new(
            "short_name",
            "Short name",
            Role::Match {
                priority: 8,
                identity_attribute: "short_name",
            },
        )
        .kinds(BOTH)
        .alternative("name"),
        direct("email", "Email", "email").kinds(PERSON),
        direct("date_of_birth", "Date of birth", "date_of_birth")
            .kinds(PERSON)
            .value_type(ValueType::Date)
            .converter(date_cell),
        direct("sex", "Sex", "sex")
            .kinds(PERSON)
            .value_type(ValueType::SexCode)
            .converter(sex_cell),
        direct("street", "Street", "street").kinds(PERSON),
        direct("housenumber", "Housenumber", "housenumber").kinds(PERSON),
        direct("postal_code", "Postal code", "postal_code").kinds(PERSON),
        direct("place", "Place", "place").kinds(PERSON),
        direct("phone_number", "Phone number", "phone_number")
            .kinds(PERSON)
            .value_type(ValueType::PhoneNumber)
            .converter(phone_number_cell),
        direct("mobile_number", "Mobile number", "mobile_number")
            .kinds(PERSON)
            .value_type(ValueType::PhoneNumber)
            .converter(phone_number_cell),
        FieldTypeDescriptor::new(
            "departments",
            "Comma-separated list of departments",
            Role::CustomProcess {
                apply: apply_departments,
            },
        )
        .kinds(PERSON)
        .value_type(ValueType::TextList)
        .converter(comma_separated_cell)
        .repeatable(),
        multi("group_short_name", "Short name of a group", apply_group_memberships).kinds(PERSON),
        FieldTypeDescriptor::new(
            "primary_group_short_name",
            "Short name of the primary group",
            Role::CustomProcess {
                apply: apply_primary_group,
            },
        )
        .kinds(PERSON),
        multi("guardian_first_name", "First name of a guardian", apply_guardians).kinds(PERSON),
        multi("guardian_last_name", "Last name of a guardian", apply_guardians).kinds(PERSON),
        multi("guardian_email", "Email address of a guardian", apply_guardians).kinds(PERSON),
        multi(
            "group_owner_shortname",
            "Short name of a group owner",
            apply_group_owners,
        )
        .kinds(GROUP),
        direct("subject_short_name", "Short name of the subject", "subject").kinds(GROUP),
        FieldTypeDescriptor::new(
            "pedasos_class_range",
            "Pedasos class range (e. g. 7a-d)",
            Role::CustomProcess {
                apply: apply_class_range,
            },
        )
        .kinds(GROUP),
        FieldTypeDescriptor::new("ignore", "Ignore data in this field", Role::Ignore).kinds(BOTH),
    ]
}

/// Registry with every built-in field type, frozen.
pub fn builtin_registry() -> Result<FieldTypeRegistry> {
    let mut builder = FieldTypeRegistry::builder();
    for descriptor in builtin_descriptors() {
        builder.register(descriptor)?;
    }
    builder.build()
}

fn non_empty_texts(values: &[CellValue]) -> Vec<String> {
    values
        .iter()
        .filter_map(|v| v.to_text())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn missing(what: &str, names: &[String]) -> ImportError {
    ImportError::Row {
        message: format!("unknown {}: {}", what, names.join(", ")),
    }
}

/// Resolve short names to entities, splitting off the ones not found.
fn resolve_short_names(
    ctx: &ApplyContext<'_>,
    kind: EntityKind,
    names: &[String],
) -> Result<(Vec<Entity>, Vec<String>)> {
    let mut found = Vec::new();
    let mut not_found = Vec::new();
    for name in names {
        match ctx.store.find_one(kind, "short_name", name)? {
            Some(e) => found.push(e),
            None => not_found.push(name.clone()),
        }
    }
    Ok((found, not_found))
}

fn apply_group_memberships(
    ctx: &mut ApplyContext<'_>,
    person: &Entity,
    values: &[CellValue],
) -> Result<()> {
    let names = non_empty_texts(values);
    let (groups, not_found) = resolve_short_names(ctx, EntityKind::Group, &names)?;
    for group in &groups {
        ctx.store.add_membership(Relation::MemberOf, person, group)?;
    }
    if !not_found.is_empty() {
        return Err(missing("groups", &not_found));
    }
    Ok(())
}

fn apply_primary_group(
    ctx: &mut ApplyContext<'_>,
    person: &Entity,
    values: &[CellValue],
) -> Result<()> {
    let Some(name) = non_empty_texts(values).into_iter().next() else {
        return Ok(());
    };
    let Some(group) = ctx.store.find_one(EntityKind::Group, "short_name", &name)? else {
        return Err(missing("primary group", &[name]));
    };
    let mut payload = Payload::new();
    payload.insert("primary_group_id".into(), CellValue::Text(group.id.clone()));
    ctx.store.update(person, &payload)?;
    ctx.store.add_membership(Relation::MemberOf, person, &group)?;
    Ok(())
}

fn apply_departments(
    ctx: &mut ApplyContext<'_>,
    person: &Entity,
    values: &[CellValue],
) -> Result<()> {
    let tokens: Vec<String> = values
        .iter()
        .flat_map(|v| match v {
            CellValue::List(items) => items.clone(),
            other => other.to_text().into_iter().collect(),
        })
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    for token in tokens {
        let short_name = ctx.settings.department_short_name(&token);
        let mut payload = Payload::new();
        payload.insert("name".into(), CellValue::Text(short_name.clone()));
        payload.insert(
            "group_type".into(),
            CellValue::Text(ctx.settings.department_group_type.clone()),
        );
        let (group, created) = ctx
            .store
            .upsert(EntityKind::Group, "short_name", &short_name, &payload)?;
        if created {
            tracing::debug!(department = %short_name, "created department group");
        }
        ctx.store.add_membership(Relation::MemberOf, person, &group)?;
    }
    Ok(())
}

fn guardian_column<'v>(ctx: &'v ApplyContext<'_>, field: &str, i: usize) -> &'v str {
    ctx.row_groups
        .get(field)
        .and_then(|vals| vals.get(i))
        .and_then(|v| v.as_text())
        .map(str::trim)
        .unwrap_or("")
}

/// Guardian columns are zipped by occurrence: the n-th first name, last name
/// and email together describe the n-th guardian. Only the first guardian
/// field type with a value in this row does the work.
fn apply_guardians(
    ctx: &mut ApplyContext<'_>,
    person: &Entity,
    _values: &[CellValue],
) -> Result<()> {
    let leader = GUARDIAN_FIELDS.iter().find(|f| {
        ctx.row_groups
            .get(**f)
            .map(|vals| vals.iter().any(|v| !v.is_empty()))
            .unwrap_or(false)
    });
    if leader != Some(&ctx.field_type) {
        return Ok(());
    }
    let count = GUARDIAN_FIELDS
        .iter()
        .filter_map(|f| ctx.row_groups.get(f).map(Vec::len))
        .max()
        .unwrap_or(0);

    let group = match ctx.settings.guardian_group_short_name.clone() {
        Some(short_name) => match ctx.store.find_one(EntityKind::Group, "short_name", &short_name)? {
            Some(g) => Some(g),
            None => return Err(missing("guardian group", &[short_name])),
        },
        None => None,
    };

    let mut guardians = Vec::new();
    let mut problems = Vec::new();
    for i in 0..count {
        let first = guardian_column(ctx, GUARDIAN_FIELDS[0], i).to_string();
        let last = guardian_column(ctx, GUARDIAN_FIELDS[1], i).to_string();
        let email = guardian_column(ctx, GUARDIAN_FIELDS[2], i).to_string();
        if first.is_empty() && last.is_empty() && email.is_empty() {
            continue;
        }
        if first.is_empty() || last.is_empty() {
            problems.push(format!("guardian {} needs first and last name", i + 1));
            continue;
        }
        let reference = format!("guardian:{}|{}|{}", last, first, email).to_lowercase();
        let mut payload = Payload::new();
        payload.insert("first_name".into(), CellValue::Text(first));
        payload.insert("last_name".into(), CellValue::Text(last));
        if !email.is_empty() {
            payload.insert("email".into(), CellValue::Text(email));
        }
        let (guardian, _) = ctx
            .store
            .upsert(EntityKind::Person, "import_ref_csv", &reference, &payload)?;
        if let Some(g) = &group {
            ctx.store.add_membership(Relation::MemberOf, &guardian, g)?;
        }
        guardians.push(guardian);
    }
    ctx.store.set_collection(Relation::Guardian, person, &guardians)?;

    if !problems.is_empty() {
        return Err(ImportError::Row {
            message: problems.join("; "),
        });
    }
    Ok(())
}

fn apply_group_owners(
    ctx: &mut ApplyContext<'_>,
    group: &Entity,
    values: &[CellValue],
) -> Result<()> {
    let names = non_empty_texts(values);
    let (owners, not_found) = resolve_short_names(ctx, EntityKind::Person, &names)?;
    ctx.store.set_collection(Relation::Owner, group, &owners)?;
    if !not_found.is_empty() {
        return Err(missing("owners", &not_found));
    }
    Ok(())
}

/// Expand a Pedasos class range: `7a-d` → 7a, 7b, 7c, 7d; `10` → 10;
/// `5a,6b` → 5a, 6b.
pub fn expand_class_range(value: &str) -> Option<Vec<String>> {
    let mut out = Vec::new();
    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let split = part
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(part.len());
        let (grade, suffix) = part.split_at(split);
        if grade.is_empty() {
            return None;
        }
        let letters: Vec<char> = suffix.chars().collect();
        match letters.as_slice() {
            [] => out.push(grade.to_string()),
            [c] if c.is_ascii_alphabetic() => out.push(part.to_string()),
            [from, '-', to]
                if from.is_ascii_alphabetic() && to.is_ascii_alphabetic() && from <= to =>
            {
                for c in *from..=*to {
                    out.push(format!("{}{}", grade, c));
                }
            }
            _ => return None,
        }
    }
    Some(out)
}

fn apply_class_range(
    ctx: &mut ApplyContext<'_>,
    group: &Entity,
    values: &[CellValue],
) -> Result<()> {
    let Some(raw) = non_empty_texts(values).into_iter().next() else {
        return Ok(());
    };
    let Some(classes) = expand_class_range(&raw) else {
        return Err(ImportError::Row {
            message: format!("invalid class range {:?}", raw),
        });
    };
    let (parents, not_found) = resolve_short_names(ctx, EntityKind::Group, &classes)?;
    ctx.store.set_collection(Relation::ParentGroup, group, &parents)?;
    if !not_found.is_empty() {
        return Err(missing("classes", &not_found));
    }
    Ok(())
}
