use crate::ipc::error::{err, import_err, ok, store_err};
use crate::ipc::types::{AppState, Request};
use crate::templates::{self, ImportTemplate};
use serde_json::json;

fn handle_templates_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "templates": [] }));
    };
    match templates::list(conn) {
        Ok(list) => {
            let items: Vec<serde_json::Value> = list
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "verboseName": t.verbose_name,
                        "targetKind": t.target_kind,
                        "fieldCount": t.fields.len()
                    })
                })
                .collect();
            ok(&req.id, json!({ "templates": items }))
        }
        Err(e) => store_err(&req.id, &e),
    }
}

fn handle_templates_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(name) = req.params.get("name").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing name", None);
    };
    match templates::load(conn, name) {
        Ok(Some(t)) => ok(&req.id, json!({ "template": t })),
        Ok(None) => err(&req.id, "not_found", format!("template not found: {}", name), None),
        Err(e) => store_err(&req.id, &e),
    }
}

fn handle_templates_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let raw = req.params.get("template").cloned().unwrap_or(serde_json::Value::Null);
    let template: ImportTemplate = match serde_json::from_value(raw) {
        Ok(t) => t,
        Err(e) => return err(&req.id, "bad_params", format!("invalid template: {}", e), None),
    };
    match templates::save(conn, &state.registry, template) {
        Ok(saved) => ok(&req.id, json!({ "template": saved })),
        Err(e) => import_err(&req.id, &e),
    }
}

fn handle_templates_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(name) = req.params.get("name").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing name", None);
    };
    match templates::delete(conn, name) {
        Ok(true) => ok(&req.id, json!({ "ok": true })),
        Ok(false) => err(&req.id, "not_found", format!("template not found: {}", name), None),
        Err(e) => store_err(&req.id, &e),
    }
}

fn handle_templates_install_defaults(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match templates::install_defaults(conn, &state.registry) {
        Ok(names) => ok(&req.id, json!({ "installed": names })),
        Err(e) => import_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "templates.list" => Some(handle_templates_list(state, req)),
        "templates.get" => Some(handle_templates_get(state, req)),
        "templates.save" => Some(handle_templates_save(state, req)),
        "templates.delete" => Some(handle_templates_delete(state, req)),
        "templates.installDefaults" => Some(handle_templates_install_defaults(state, req)),
        _ => None,
    }
}
