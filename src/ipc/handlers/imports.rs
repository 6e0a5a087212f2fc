use std::path::PathBuf;

use crate::importer::{self, ImportRequest};
use crate::ipc::error::{err, import_err, ok, store_err};
use crate::ipc::types::{AppState, Request};
use crate::progress::RecordingProgress;
use crate::settings;
use crate::store::SqliteStore;
use crate::{jobs, templates};
use serde_json::json;

fn handle_import_run(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(template_name) = req.params.get("templateName").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing templateName", None);
    };
    let Some(in_path) = req.params.get("inPath").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing inPath", None);
    };
    let school_term = req
        .params
        .get("schoolTerm")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let template = match templates::load(conn, template_name) {
        Ok(Some(t)) => t,
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                format!("template not found: {}", template_name),
                None,
            )
        }
        Err(e) => return store_err(&req.id, &e),
    };
    let data = match std::fs::read(PathBuf::from(in_path)) {
        Ok(d) => d,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                format!("cannot read {}: {}", in_path, e),
                None,
            )
        }
    };
    let import_settings = match settings::load(conn) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let job_id = match jobs::create(conn, &template.name, in_path, &data, school_term) {
        Ok(id) => id,
        Err(e) => return store_err(&req.id, &e),
    };

    let mut store = SqliteStore::new(conn);
    let mut progress = RecordingProgress::new();
    let result = importer::run(
        &state.registry,
        &mut store,
        ImportRequest {
            template: &template,
            data: &data,
            school_term,
            settings: &import_settings,
            cancel: None,
        },
        &mut progress,
    );

    match result {
        Ok(outcome) => {
            if let Err(e) = jobs::finish_with_outcome(conn, &job_id, &outcome) {
                return store_err(&req.id, &e);
            }
            ok(
                &req.id,
                json!({
                    "jobId": job_id,
                    "anyFailed": outcome.any_failed(),
                    "outcome": outcome,
                    "messages": progress.messages(),
                    "elapsedMs": progress.elapsed_ms() as u64
                }),
            )
        }
        Err(e) => {
            if let Err(audit) = jobs::finish(
                conn,
                &job_id,
                &json!({ "state": "rejected", "error": e.to_string() }),
            ) {
                tracing::warn!(job = %job_id, "cannot record rejected import job: {}", audit);
            }
            import_err(&req.id, &e)
        }
    }
}

fn handle_jobs_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "jobs": [] }));
    };
    let template = req.params.get("templateName").and_then(|v| v.as_str());
    match jobs::list(conn, template) {
        Ok(list) => ok(&req.id, json!({ "jobs": list })),
        Err(e) => store_err(&req.id, &e),
    }
}

fn handle_jobs_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(job_id) = req.params.get("jobId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing jobId", None);
    };
    match jobs::get(conn, job_id) {
        Ok(Some(job)) => ok(&req.id, json!({ "job": job })),
        Ok(None) => err(&req.id, "not_found", format!("job not found: {}", job_id), None),
        Err(e) => store_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "import.run" => Some(handle_import_run(state, req)),
        "import.jobs.list" => Some(handle_jobs_list(state, req)),
        "import.jobs.get" => Some(handle_jobs_get(state, req)),
        _ => None,
    }
}
