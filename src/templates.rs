//! Import templates: persisted column → field type mappings.

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::{ImportError, Result};
use crate::field_types::FieldTypeRegistry;
use crate::schema;
use crate::store::{EntityKind, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Separator {
    #[serde(rename = ",")]
    Comma,
    #[serde(rename = ";")]
    Semicolon,
    #[serde(rename = "\\s+")]
    Whitespace,
    #[serde(rename = "\t")]
    Tab,
}

impl Separator {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "," => Some(Self::Comma),
            ";" => Some(Self::Semicolon),
            "\\s+" => Some(Self::Whitespace),
            "\t" => Some(Self::Tab),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Comma => ",",
            Self::Semicolon => ";",
            Self::Whitespace => "\\s+",
            Self::Tab => "\t",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateField {
    pub index: usize,
    pub field_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportTemplate {
    pub name: String,
    pub verbose_name: String,
    pub target_kind: EntityKind,
    #[serde(default = "default_true")]
    pub has_header_row: bool,
    #[serde(default = "default_separator")]
    pub separator: Separator,
    /// Short name of a group every imported person joins.
    #[serde(default)]
    pub base_group: Option<String>,
    /// Group type written onto every imported group.
    #[serde(default)]
    pub group_type: Option<String>,
    #[serde(default)]
    pub fields: Vec<TemplateField>,
}

fn default_true() -> bool {
    true
}

fn default_separator() -> Separator {
    Separator::Comma
}

impl ImportTemplate {
    pub fn new(name: &str, verbose_name: &str, target_kind: EntityKind) -> Self {
        Self {
            name: name.to_string(),
            verbose_name: verbose_name.to_string(),
            target_kind,
            has_header_row: true,
            separator: Separator::Comma,
            base_group: None,
            group_type: None,
            fields: Vec::new(),
        }
    }

    pub fn with_fields(mut self, field_types: &[&str]) -> Self {
        self.fields = field_types
            .iter()
            .enumerate()
            .map(|(index, f)| TemplateField {
                index,
                field_type: f.to_string(),
            })
            .collect();
        self
    }

    /// Field types in column order.
    pub fn field_sequence(&self) -> Vec<&TemplateField> {
        let mut fields: Vec<&TemplateField> = self.fields.iter().collect();
        fields.sort_by_key(|f| f.index);
        fields
    }

    /// `base_group` only applies to persons, `group_type` only to groups.
    pub fn normalize(&mut self) {
        let trim = |v: &mut Option<String>| {
            *v = v
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
        };
        trim(&mut self.base_group);
        trim(&mut self.group_type);
        self.fields.sort_by_key(|f| f.index);
        if self.target_kind != EntityKind::Person {
            self.base_group = None;
        }
        if self.target_kind != EntityKind::Group {
            self.group_type = None;
        }
    }

    /// Save-time validation against the registry.
    pub fn validate(&self, registry: &FieldTypeRegistry) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ImportError::config("template name must not be empty"));
        }
        if self.fields.is_empty() {
            return Err(ImportError::config("template has no fields"));
        }
        schema::derive_schema(registry, self).map(|_| ())
    }
}

pub fn list(conn: &Connection) -> std::result::Result<Vec<ImportTemplate>, StoreError> {
    let mut stmt = conn.prepare("SELECT name FROM import_templates ORDER BY name")?;
    let names = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        if let Some(t) = load(conn, &name)? {
            out.push(t);
        }
    }
    Ok(out)
}

pub fn load(conn: &Connection, name: &str) -> std::result::Result<Option<ImportTemplate>, StoreError> {
    let row = conn
        .query_row(
            "SELECT name, verbose_name, target_kind, has_header_row, separator, base_group, group_type
             FROM import_templates WHERE name = ?",
            [name],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, i64>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, Option<String>>(5)?,
                    r.get::<_, Option<String>>(6)?,
                ))
            },
        )
        .optional()?;
    let Some((name, verbose_name, kind_raw, has_header_row, sep_raw, base_group, group_type)) = row
    else {
        return Ok(None);
    };
    let target_kind = EntityKind::parse(&kind_raw).ok_or_else(|| {
        StoreError::Validation(format!("template {} has unknown target kind {}", name, kind_raw))
    })?;
    let separator = Separator::parse(&sep_raw).ok_or_else(|| {
        StoreError::Validation(format!("template {} has unknown separator {:?}", name, sep_raw))
    })?;

    let mut stmt = conn.prepare(
        "SELECT idx, field_type FROM import_template_fields WHERE template = ? ORDER BY idx",
    )?;
    let fields = stmt
        .query_map([&name], |r| {
            Ok(TemplateField {
                index: r.get::<_, i64>(0)? as usize,
                field_type: r.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(Some(ImportTemplate {
        name,
        verbose_name,
        target_kind,
        has_header_row: has_header_row != 0,
        separator,
        base_group,
        group_type,
        fields,
    }))
}

/// Validate and write a template, replacing any template of the same name.
pub fn save(
    conn: &Connection,
    registry: &FieldTypeRegistry,
    mut template: ImportTemplate,
) -> Result<ImportTemplate> {
    template.normalize();
    template.validate(registry)?;

    let tx = conn.unchecked_transaction().map_err(StoreError::from)?;
    tx.execute(
        "INSERT INTO import_templates(name, verbose_name, target_kind, has_header_row, separator, base_group, group_type)
         VALUES(?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(name) DO UPDATE SET
           verbose_name = excluded.verbose_name,
           target_kind = excluded.target_kind,
           has_header_row = excluded.has_header_row,
           separator = excluded.separator,
           base_group = excluded.base_group,
           group_type = excluded.group_type",
        (
            &template.name,
            &template.verbose_name,
            template.target_kind.as_str(),
            i64::from(template.has_header_row),
            template.separator.as_str(),
            &template.base_group,
            &template.group_type,
        ),
    )
    .map_err(StoreError::from)?;
    tx.execute(
        "DELETE FROM import_template_fields WHERE template = ?",
        [&template.name],
    )
    .map_err(StoreError::from)?;
    for field in template.field_sequence() {
        tx.execute(
            "INSERT INTO import_template_fields(template, idx, field_type) VALUES(?, ?, ?)",
            (&template.name, field.index as i64, &field.field_type),
        )
        .map_err(StoreError::from)?;
    }
    tx.commit().map_err(StoreError::from)?;
    tracing::info!(template = %template.name, fields = template.fields.len(), "template saved");
    Ok(template)
}

pub fn delete(conn: &Connection, name: &str) -> std::result::Result<bool, StoreError> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM import_template_fields WHERE template = ?", [name])?;
    let n = tx.execute("DELETE FROM import_templates WHERE name = ?", [name])?;
    tx.commit()?;
    Ok(n > 0)
}

fn pedasos(name: &str, verbose_name: &str, kind: EntityKind, fields: &[&str]) -> ImportTemplate {
    let mut t = ImportTemplate::new(name, verbose_name, kind).with_fields(fields);
    t.separator = Separator::Tab;
    t.has_header_row = true;
    t
}

pub fn default_templates() -> Vec<ImportTemplate> {
    let mut students = vec![
        "unique_reference",
        "last_name",
        "first_name",
        "date_of_birth",
        "sex",
        "primary_group_short_name",
    ];
    // Mother, then father.
    for _ in 0..2 {
        students.extend(["guardian_last_name", "guardian_first_name", "guardian_email"]);
    }
    // Courses 1 to 21.
    students.extend(std::iter::repeat("group_short_name").take(21));

    vec![
        pedasos(
            "pedasos_teachers",
            "Pedasos: Teachers",
            EntityKind::Person,
            &[
                "short_name",
                "last_name",
                "first_name",
                "date_of_birth",
                "sex",
                "departments",
                "ignore",
            ],
        ),
        pedasos(
            "pedasos_classes",
            "Pedasos: Classes",
            EntityKind::Group,
            &["short_name", "group_owner_shortname", "group_owner_shortname"],
        ),
        pedasos(
            "pedasos_courses",
            "Pedasos: Courses",
            EntityKind::Group,
            &[
                "short_name",
                "pedasos_class_range",
                "subject_short_name",
                "group_owner_shortname",
            ],
        ),
        pedasos(
            "pedasos_students",
            "Pedasos: Students",
            EntityKind::Person,
            &students,
        ),
    ]
}

/// Create or refresh the bundled Pedasos templates.
pub fn install_defaults(conn: &Connection, registry: &FieldTypeRegistry) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for template in default_templates() {
        let saved = save(conn, registry, template)?;
        names.push(saved.name);
    }
    Ok(names)
}
