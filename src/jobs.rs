//! Audit records of import runs.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::outcome::ImportOutcome;
use crate::store::StoreError;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportJob {
    pub id: String,
    pub template: String,
    pub data_file: String,
    pub data_sha256: Option<String>,
    pub school_term: Option<String>,
    pub created_at: String,
    pub finished_at: Option<String>,
    pub result: Option<serde_json::Value>,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn create(
    conn: &Connection,
    template: &str,
    data_file: &str,
    data: &[u8],
    school_term: Option<&str>,
) -> Result<String, StoreError> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO import_jobs(id, template, data_file, data_sha256, school_term, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &id,
            template,
            data_file,
            sha256_hex(data),
            school_term,
            Utc::now().to_rfc3339(),
        ),
    )?;
    Ok(id)
}

/// Record the final result. A job can only be finished once.
pub fn finish(conn: &Connection, id: &str, result: &serde_json::Value) -> Result<(), StoreError> {
    let n = conn.execute(
        "UPDATE import_jobs SET finished_at = ?, result_json = ?
         WHERE id = ? AND finished_at IS NULL",
        (Utc::now().to_rfc3339(), result.to_string(), id),
    )?;
    if n == 0 {
        return Err(StoreError::NotFound(format!("unfinished job {}", id)));
    }
    Ok(())
}

pub fn finish_with_outcome(
    conn: &Connection,
    id: &str,
    outcome: &ImportOutcome,
) -> Result<(), StoreError> {
    let result = serde_json::to_value(outcome)
        .map_err(|e| StoreError::Validation(format!("cannot encode outcome: {}", e)))?;
    finish(conn, id, &result)
}

fn row_to_job(r: &rusqlite::Row<'_>) -> rusqlite::Result<ImportJob> {
    let result_raw: Option<String> = r.get(7)?;
    Ok(ImportJob {
        id: r.get(0)?,
        template: r.get(1)?,
        data_file: r.get(2)?,
        data_sha256: r.get(3)?,
        school_term: r.get(4)?,
        created_at: r.get(5)?,
        finished_at: r.get(6)?,
        result: result_raw.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

const JOB_COLUMNS: &str =
    "id, template, data_file, data_sha256, school_term, created_at, finished_at, result_json";

pub fn get(conn: &Connection, id: &str) -> Result<Option<ImportJob>, StoreError> {
    let sql = format!("SELECT {} FROM import_jobs WHERE id = ?", JOB_COLUMNS);
    Ok(conn.query_row(&sql, [id], row_to_job).optional()?)
}

/// Newest first, optionally filtered by template.
pub fn list(conn: &Connection, template: Option<&str>) -> Result<Vec<ImportJob>, StoreError> {
    let sql = format!(
        "SELECT {} FROM import_jobs WHERE (?1 IS NULL OR template = ?1)
         ORDER BY created_at DESC, rowid DESC",
        JOB_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let jobs = stmt
        .query_map([template], row_to_job)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(jobs)
}
