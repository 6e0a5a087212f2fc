use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

fn short_names(conn: &Connection, sql: &str, id: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn list_persons(conn: &Connection, include_inactive: bool) -> rusqlite::Result<Vec<serde_json::Value>> {
    let mut stmt = conn.prepare(
        "SELECT p.id, p.import_ref_csv, p.short_name, p.first_name, p.last_name,
                p.additional_name, p.email, p.date_of_birth, p.sex, p.phone_number,
                p.mobile_number, p.is_active,
                (SELECT g.short_name FROM school_groups g WHERE g.id = p.primary_group_id)
         FROM persons p
         WHERE (?1 = 1 OR p.is_active = 1)
         ORDER BY p.last_name, p.first_name, p.id",
    )?;
    let base = stmt
        .query_map([i64::from(include_inactive)], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "importRef": r.get::<_, Option<String>>(1)?,
                "shortName": r.get::<_, Option<String>>(2)?,
                "firstName": r.get::<_, String>(3)?,
                "lastName": r.get::<_, String>(4)?,
                "additionalName": r.get::<_, Option<String>>(5)?,
                "email": r.get::<_, Option<String>>(6)?,
                "dateOfBirth": r.get::<_, Option<String>>(7)?,
                "sex": r.get::<_, Option<String>>(8)?,
                "phoneNumber": r.get::<_, Option<String>>(9)?,
                "mobileNumber": r.get::<_, Option<String>>(10)?,
                "isActive": r.get::<_, i64>(11)? != 0,
                "primaryGroup": r.get::<_, Option<String>>(12)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(base.len());
    for mut p in base {
        let id = p["id"].as_str().unwrap_or_default().to_string();
        p["memberOf"] = json!(short_names(
            conn,
            "SELECT g.short_name FROM group_members m JOIN school_groups g ON g.id = m.group_id
             WHERE m.person_id = ? ORDER BY g.short_name",
            &id,
        )?);
        p["guardians"] = json!(short_names(
            conn,
            "SELECT x.import_ref_csv FROM person_guardians pg JOIN persons x ON x.id = pg.guardian_id
             WHERE pg.person_id = ? ORDER BY x.import_ref_csv",
            &id,
        )?);
        out.push(p);
    }
    Ok(out)
}

fn list_groups(conn: &Connection) -> rusqlite::Result<Vec<serde_json::Value>> {
    let mut stmt = conn.prepare(
        "SELECT g.id, g.import_ref_csv, g.short_name, g.name, g.group_type, g.subject,
                g.school_term,
                (SELECT COUNT(*) FROM group_members m WHERE m.group_id = g.id)
         FROM school_groups g
         ORDER BY g.short_name, g.id",
    )?;
    let base = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "importRef": r.get::<_, Option<String>>(1)?,
                "shortName": r.get::<_, Option<String>>(2)?,
                "name": r.get::<_, String>(3)?,
                "groupType": r.get::<_, Option<String>>(4)?,
                "subject": r.get::<_, Option<String>>(5)?,
                "schoolTerm": r.get::<_, Option<String>>(6)?,
                "memberCount": r.get::<_, i64>(7)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(base.len());
    for mut g in base {
        let id = g["id"].as_str().unwrap_or_default().to_string();
        g["owners"] = json!(short_names(
            conn,
            "SELECT p.short_name FROM group_owners o JOIN persons p ON p.id = o.person_id
             WHERE o.group_id = ? AND p.short_name IS NOT NULL ORDER BY p.short_name",
            &id,
        )?);
        g["parents"] = json!(short_names(
            conn,
            "SELECT x.short_name FROM group_parents gp JOIN school_groups x ON x.id = gp.parent_id
             WHERE gp.group_id = ? ORDER BY x.short_name",
            &id,
        )?);
        out.push(g);
    }
    Ok(out)
}

fn handle_persons_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "persons": [] }));
    };
    let include_inactive = req
        .params
        .get("includeInactive")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    match list_persons(conn, include_inactive) {
        Ok(persons) => ok(&req.id, json!({ "persons": persons })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_groups_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "groups": [] }));
    };
    match list_groups(conn) {
        Ok(groups) => ok(&req.id, json!({ "groups": groups })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "persons.list" => Some(handle_persons_list(state, req)),
        "groups.list" => Some(handle_groups_list(state, req)),
        _ => None,
    }
}
