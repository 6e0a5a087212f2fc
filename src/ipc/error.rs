use serde_json::json;

use crate::error::ImportError;
use crate::store::StoreError;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

pub fn store_err(id: &str, e: &StoreError) -> serde_json::Value {
    let code = match e {
        StoreError::Validation(_) => "validation_failed",
        StoreError::Conflict(_) => "conflict",
        StoreError::NotFound(_) => "not_found",
        StoreError::Backend(_) => "db_query_failed",
    };
    err(id, code, e.to_string(), None)
}

pub fn import_err(id: &str, e: &ImportError) -> serde_json::Value {
    let code = match e {
        ImportError::Configuration(_)
        | ImportError::DuplicateFieldType(_)
        | ImportError::UnknownFieldType(_) => "config_invalid",
        ImportError::FatalParse { .. } => "parse_failed",
        ImportError::Store(inner) => return store_err(id, inner),
        ImportError::Row { .. }
        | ImportError::MissingIdentity { .. }
        | ImportError::Conversion { .. } => "row_failed",
    };
    err(id, code, e.to_string(), None)
}
