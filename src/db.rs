use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("csvimport.sqlite3");
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

#[cfg(test)]
pub fn open_in_memory() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS school_groups(
            id TEXT PRIMARY KEY,
            import_ref_csv TEXT,
            short_name TEXT UNIQUE,
            name TEXT NOT NULL,
            group_type TEXT,
            subject TEXT,
            updated_at TEXT
        )",
        [],
    )?;
    ensure_groups_school_term(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_groups_import_ref ON school_groups(import_ref_csv)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS persons(
            id TEXT PRIMARY KEY,
            import_ref_csv TEXT,
            short_name TEXT UNIQUE,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            additional_name TEXT,
            email TEXT,
            date_of_birth TEXT,
            sex TEXT,
            street TEXT,
            housenumber TEXT,
            postal_code TEXT,
            place TEXT,
            phone_number TEXT,
            mobile_number TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            primary_group_id TEXT,
            updated_at TEXT,
            FOREIGN KEY(primary_group_id) REFERENCES school_groups(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_persons_import_ref ON persons(import_ref_csv)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS group_members(
            group_id TEXT NOT NULL,
            person_id TEXT NOT NULL,
            PRIMARY KEY(group_id, person_id),
            FOREIGN KEY(group_id) REFERENCES school_groups(id),
            FOREIGN KEY(person_id) REFERENCES persons(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS group_owners(
            group_id TEXT NOT NULL,
            person_id TEXT NOT NULL,
            PRIMARY KEY(group_id, person_id),
            FOREIGN KEY(group_id) REFERENCES school_groups(id),
            FOREIGN KEY(person_id) REFERENCES persons(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS group_parents(
            group_id TEXT NOT NULL,
            parent_id TEXT NOT NULL,
            PRIMARY KEY(group_id, parent_id),
            FOREIGN KEY(group_id) REFERENCES school_groups(id),
            FOREIGN KEY(parent_id) REFERENCES school_groups(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS person_guardians(
            person_id TEXT NOT NULL,
            guardian_id TEXT NOT NULL,
            PRIMARY KEY(person_id, guardian_id),
            FOREIGN KEY(person_id) REFERENCES persons(id),
            FOREIGN KEY(guardian_id) REFERENCES persons(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_group_members_person ON group_members(person_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS import_templates(
            name TEXT PRIMARY KEY,
            verbose_name TEXT NOT NULL,
            target_kind TEXT NOT NULL,
            has_header_row INTEGER NOT NULL DEFAULT 1,
            separator TEXT NOT NULL DEFAULT ',',
            base_group TEXT,
            group_type TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS import_template_fields(
            template TEXT NOT NULL,
            idx INTEGER NOT NULL,
            field_type TEXT NOT NULL,
            FOREIGN KEY(template) REFERENCES import_templates(name) ON DELETE CASCADE,
            UNIQUE(template, idx)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS import_jobs(
            id TEXT PRIMARY KEY,
            template TEXT NOT NULL,
            data_file TEXT NOT NULL,
            data_sha256 TEXT,
            school_term TEXT,
            created_at TEXT NOT NULL,
            finished_at TEXT,
            result_json TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_import_jobs_template ON import_jobs(template)",
        [],
    )?;

    Ok(())
}

// Workspaces created before term-scoped group imports lack the column.
fn ensure_groups_school_term(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "school_groups", "school_term")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE school_groups ADD COLUMN school_term TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, value.to_string()),
    )?;
    Ok(())
}
