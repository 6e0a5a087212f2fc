mod test_support;

use serde_json::json;
use std::io::{BufRead, Write};
use test_support::{error_code, request, request_ok, spawn_sidecar, temp_dir};

#[test]
fn health_reports_registry_and_workspace() {
    let workspace = temp_dir("csvimportd-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health["workspacePath"].is_null());
    assert!(health["fieldTypes"].as_u64().unwrap_or(0) >= 20);

    let selected = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert_eq!(
        selected["workspacePath"].as_str(),
        Some(workspace.to_string_lossy().as_ref())
    );
    assert!(workspace.join("csvimport.sqlite3").exists());

    let health = request_ok(&mut stdin, &mut reader, "3", "health", json!({}));
    assert!(health["workspacePath"].is_string());

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn unknown_method_and_missing_workspace() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let resp = request(&mut stdin, &mut reader, "1", "grades.compute", json!({}));
    assert_eq!(error_code(&resp), Some("not_implemented"));

    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "import.run",
        json!({ "templateName": "x", "inPath": "/nonexistent.csv" }),
    );
    assert_eq!(error_code(&resp), Some("no_workspace"));

    let resp = request(&mut stdin, &mut reader, "3", "workspace.select", json!({}));
    assert_eq!(error_code(&resp), Some("bad_params"));

    // Listing endpoints answer empty without a workspace.
    let templates = request_ok(&mut stdin, &mut reader, "4", "templates.list", json!({}));
    assert_eq!(templates["templates"], json!([]));
    let persons = request_ok(&mut stdin, &mut reader, "5", "persons.list", json!({}));
    assert_eq!(persons["persons"], json!([]));

    let _ = child.kill();
}

#[test]
fn malformed_json_gets_bad_json_reply_and_loop_continues() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    writeln!(stdin, "{{not json").expect("write");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("json");
    assert_eq!(value["ok"], json!(false));
    assert_eq!(value["error"]["code"], json!("bad_json"));

    request_ok(&mut stdin, &mut reader, "after", "health", json!({}));
    let _ = child.kill();
}

#[test]
fn field_type_catalog_filters_by_entity_kind() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let all = request_ok(&mut stdin, &mut reader, "1", "fieldTypes.list", json!({}));
    let names: Vec<&str> = all["fieldTypes"]
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|f| f["name"].as_str())
        .collect();
    assert!(names.contains(&"unique_reference"));
    assert!(names.contains(&"pedasos_class_range"));
    assert_eq!(all["entityKinds"], json!(["person", "group"]));
    let choices = all["choices"].as_array().expect("choices");
    assert_eq!(choices.len(), names.len());
    assert_eq!(choices[0]["value"], json!("unique_reference"));
    assert!(choices[0]["label"].as_str().is_some_and(|l| !l.is_empty()));

    let groups = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "fieldTypes.list",
        json!({ "entityKind": "group" }),
    );
    let group_names: Vec<&str> = groups["fieldTypes"]
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|f| f["name"].as_str())
        .collect();
    assert!(group_names.contains(&"group_owner_shortname"));
    assert!(!group_names.contains(&"first_name"));

    let reference = all["fieldTypes"]
        .as_array()
        .expect("array")
        .iter()
        .find(|f| f["name"] == json!("unique_reference"))
        .expect("unique_reference");
    assert_eq!(reference["role"], json!("match"));
    assert_eq!(reference["priority"], json!(10));

    let resp = request(
        &mut stdin,
        &mut reader,
        "3",
        "fieldTypes.list",
        json!({ "entityKind": "room" }),
    );
    assert_eq!(error_code(&resp), Some("bad_params"));

    let _ = child.kill();
}
