use crate::field_types::FieldTypeDescriptor;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::store::EntityKind;
use serde_json::json;

fn descriptor_json(d: &FieldTypeDescriptor) -> serde_json::Value {
    let kinds: Vec<&str> = d.entity_kinds.iter().map(|k| k.as_str()).collect();
    let mut v = json!({
        "name": d.name,
        "verboseName": d.verbose_name,
        "entityKinds": kinds,
        "role": d.role.as_str(),
        "valueType": d.value_type,
        "repeatable": d.is_repeatable(),
        "alternativeOf": d.alternative_of,
        "targetAttribute": d.role.target_attribute(),
    });
    if let crate::field_types::Role::Match { priority, .. } = d.role {
        v["priority"] = json!(priority);
    }
    v
}

fn handle_field_types_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let kind = match req.params.get("entityKind") {
        None | Some(serde_json::Value::Null) => None,
        Some(v) => match v.as_str().and_then(EntityKind::parse) {
            Some(k) => Some(k),
            None => return err(&req.id, "bad_params", "entityKind must be person or group", None),
        },
    };
    let field_types: Vec<serde_json::Value> = match kind {
        Some(k) => state
            .registry
            .allowed_for(k)
            .into_iter()
            .map(descriptor_json)
            .collect(),
        None => state.registry.iter().map(descriptor_json).collect(),
    };
    let kinds: Vec<&str> = state
        .registry
        .allowed_kinds()
        .into_iter()
        .map(|k| k.as_str())
        .collect();
    // Select options for template editors: every field type, registration order.
    let choices: Vec<serde_json::Value> = state
        .registry
        .choices()
        .into_iter()
        .map(|(value, label)| json!({ "value": value, "label": label }))
        .collect();
    ok(
        &req.id,
        json!({ "fieldTypes": field_types, "entityKinds": kinds, "choices": choices }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "fieldTypes.list" => Some(handle_field_types_list(state, req)),
        _ => None,
    }
}
