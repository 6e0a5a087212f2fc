mod builtin_fields;
mod converters;
mod csv_source;
mod db;
mod error;
mod field_types;
mod importer;
mod ipc;
mod jobs;
mod outcome;
mod progress;
mod reconcile;
mod schema;
mod settings;
mod store;
mod templates;
mod values;

use std::io::{self, BufRead, Write};

fn main() {
    // stdout carries the IPC protocol; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();

    let registry = match builtin_fields::builtin_registry() {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("field type registry: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!(field_types = registry.len(), "csvimportd ready");
    let mut state = ipc::AppState::new(registry);

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id.
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        tracing::debug!(method = %req.method, id = %req.id, "request");
        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}
