//! The `setup.csvImport` preferences section.

use rusqlite::Connection;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::converters::{is_known_region, ConvertOptions};
use crate::db;

pub const SECTION_KEY: &str = "setup.csvImport";

/// Typed view of the section, read once per import run.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSettings {
    pub phone_region: String,
    pub true_values: Vec<String>,
    pub false_values: Vec<String>,
    pub department_group_type: String,
    pub department_group_prefix: String,
    pub guardian_group_short_name: Option<String>,
}

impl Default for ImportSettings {
    fn default() -> Self {
        // The defaults object is always well-formed.
        serde_json::from_value(default_section()).unwrap_or_else(|_| Self {
            phone_region: "DE".into(),
            true_values: vec!["+".into(), "Ja".into()],
            false_values: vec!["-".into(), "Nein".into()],
            department_group_type: "Department".into(),
            department_group_prefix: String::new(),
            guardian_group_short_name: None,
        })
    }
}

impl ImportSettings {
    pub fn convert_options(&self) -> ConvertOptions {
        ConvertOptions {
            phone_region: self.phone_region.clone(),
            true_values: self.true_values.clone(),
            false_values: self.false_values.clone(),
        }
    }

    /// `"<prefix> <value>"`, or `value` when no prefix is configured.
    pub fn department_short_name(&self, value: &str) -> String {
        let prefix = self.department_group_prefix.trim();
        if prefix.is_empty() {
            value.to_string()
        } else {
            format!("{} {}", prefix, value)
        }
    }
}

pub fn default_section() -> Value {
    json!({
        "phoneRegion": "DE",
        "trueValues": ["+", "Ja"],
        "falseValues": ["-", "Nein"],
        "departmentGroupType": "Department",
        "departmentGroupPrefix": "",
        "guardianGroupShortName": null
    })
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn parse_token_list(v: &Value, key: &str) -> Result<Vec<String>, String> {
    let arr = v
        .as_array()
        .ok_or_else(|| format!("{} must be an array of strings", key))?;
    if arr.len() > 16 {
        return Err(format!("{} must have at most 16 entries", key));
    }
    let mut out = Vec::with_capacity(arr.len());
    for item in arr {
        let s = parse_string_max(item, key, 16)?;
        if s.is_empty() {
            return Err(format!("{} entries must not be empty", key));
        }
        out.push(s);
    }
    Ok(out)
}

pub fn merge_patch(current: &mut Value, patch: &Map<String, Value>) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match k.as_str() {
            "phoneRegion" => {
                let s = parse_string_max(v, k, 2)?.to_ascii_uppercase();
                if !is_known_region(&s) {
                    return Err(format!("unsupported phone region: {}", s));
                }
                obj.insert(k.clone(), Value::String(s));
            }
            "trueValues" | "falseValues" => {
                let tokens = parse_token_list(v, k)?;
                obj.insert(k.clone(), json!(tokens));
            }
            "departmentGroupType" => {
                let s = parse_string_max(v, k, 64)?;
                if s.is_empty() {
                    return Err("departmentGroupType must not be empty".into());
                }
                obj.insert(k.clone(), Value::String(s));
            }
            "departmentGroupPrefix" => {
                obj.insert(k.clone(), Value::String(parse_string_max(v, k, 32)?));
            }
            "guardianGroupShortName" => {
                let value = if v.is_null() {
                    Value::Null
                } else {
                    match parse_string_max(v, k, 64)? {
                        s if s.is_empty() => Value::Null,
                        s => Value::String(s),
                    }
                };
                obj.insert(k.clone(), value);
            }
            _ => return Err(format!("unknown csvImport field: {}", k)),
        }
    }

    let overlap = obj
        .get("trueValues")
        .and_then(|t| t.as_array())
        .zip(obj.get("falseValues").and_then(|f| f.as_array()))
        .map(|(t, f)| t.iter().any(|x| f.contains(x)))
        .unwrap_or(false);
    if overlap {
        return Err("trueValues and falseValues must not overlap".into());
    }
    Ok(())
}

pub fn load_section(conn: &Connection) -> anyhow::Result<Value> {
    let mut current = default_section();
    if let Some(saved) = db::settings_get_json(conn, SECTION_KEY)? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed saved values fall back to defaults.
            let mut candidate = current.clone();
            if merge_patch(&mut candidate, saved_obj).is_ok() {
                current = candidate;
            } else {
                tracing::warn!("ignoring malformed {} settings", SECTION_KEY);
            }
        }
    }
    Ok(current)
}

pub fn load(conn: &Connection) -> anyhow::Result<ImportSettings> {
    let section = load_section(conn)?;
    Ok(serde_json::from_value(section)?)
}

pub fn update(conn: &Connection, patch: &Map<String, Value>) -> anyhow::Result<Result<Value, String>> {
    let mut current = load_section(conn)?;
    if let Err(msg) = merge_patch(&mut current, patch) {
        return Ok(Err(msg));
    }
    db::settings_set_json(conn, SECTION_KEY, &current)?;
    Ok(Ok(current))
}
