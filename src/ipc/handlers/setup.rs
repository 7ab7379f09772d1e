use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_i64, optional_str, required_str, require_row};
use crate::ipc::types::{AppState, Request};
use rusqlite::params;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

/// Roster catalog: sessions, terms, classes and their arms, subjects and
/// the ordered per-class subject list, students. Plain storage, no
/// scoring logic.

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NamedRow {
    id: String,
    name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClassSummary {
    id: String,
    name: String,
    sort_order: i64,
    arm_count: i64,
    subject_count: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClassArmSummary {
    id: String,
    class_id: String,
    name: String,
    student_count: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClassSubjectRow {
    subject_id: String,
    name: String,
    sort_order: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StudentRow {
    id: String,
    class_arm_id: String,
    last_name: String,
    first_name: String,
    admission_no: String,
    active: bool,
    sort_order: i64,
}

fn clean_name(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    let raw = required_str(req, key)?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(err(
            &req.id,
            "bad_params",
            format!("params.{key} must not be blank"),
            None,
        ));
    }
    Ok(trimmed.to_string())
}

fn next_sort_order(
    conn: &rusqlite::Connection,
    req: &Request,
    sql: &str,
) -> Result<i64, serde_json::Value> {
    conn.query_row(sql, [], |row| row.get(0)).map_err(|e| {
        err(
            &req.id,
            "db_query_failed",
            format!("count rows: {e}"),
            None,
        )
    })
}

fn handle_sessions_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let name = match clean_name(req, "name") {
        Ok(n) => n,
        Err(resp) => return resp,
    };
    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO sessions (id, name) VALUES (?1, ?2)",
        params![id, name],
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            format!("insert session: {e}"),
            None,
        );
    }
    ok(&req.id, json!({ "sessionId": id }))
}

fn handle_sessions_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let mut stmt = match conn.prepare("SELECT id, name FROM sessions ORDER BY name") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", format!("{e}"), None),
    };
    let rows = stmt
        .query_map([], |row| {
            Ok(NamedRow {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(items) => ok(&req.id, json!({ "sessions": items })),
        Err(e) => err(&req.id, "db_query_failed", format!("{e}"), None),
    }
}

fn handle_terms_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let name = match clean_name(req, "name") {
        Ok(n) => n,
        Err(resp) => return resp,
    };
    let sort_order = match optional_i64(req, "sortOrder") {
        Some(v) => v,
        None => match next_sort_order(conn, req, "SELECT COUNT(*) FROM terms") {
            Ok(v) => v,
            Err(resp) => return resp,
        },
    };
    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO terms (id, name, sort_order) VALUES (?1, ?2, ?3)",
        params![id, name, sort_order],
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            format!("insert term: {e}"),
            None,
        );
    }
    ok(&req.id, json!({ "termId": id }))
}

fn handle_terms_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let mut stmt = match conn.prepare("SELECT id, name FROM terms ORDER BY sort_order") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", format!("{e}"), None),
    };
    let rows = stmt
        .query_map([], |row| {
            Ok(NamedRow {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(items) => ok(&req.id, json!({ "terms": items })),
        Err(e) => err(&req.id, "db_query_failed", format!("{e}"), None),
    }
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let name = match clean_name(req, "name") {
        Ok(n) => n,
        Err(resp) => return resp,
    };
    let sort_order = match optional_i64(req, "sortOrder") {
        Some(v) => v,
        None => match next_sort_order(conn, req, "SELECT COUNT(*) FROM classes") {
            Ok(v) => v,
            Err(resp) => return resp,
        },
    };
    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO classes (id, name, sort_order) VALUES (?1, ?2, ?3)",
        params![id, name, sort_order],
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            format!("insert class: {e}"),
            None,
        );
    }
    ok(&req.id, json!({ "classId": id }))
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let mut stmt = match conn.prepare(
        "SELECT c.id, c.name, c.sort_order,
                (SELECT COUNT(*) FROM class_arms a WHERE a.class_id = c.id) AS arm_count,
                (SELECT COUNT(*) FROM class_subjects cs WHERE cs.class_id = c.id) AS subject_count
         FROM classes c
         ORDER BY c.sort_order, c.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", format!("{e}"), None),
    };
    let rows = stmt
        .query_map([], |row| {
            Ok(ClassSummary {
                id: row.get(0)?,
                name: row.get(1)?,
                sort_order: row.get(2)?,
                arm_count: row.get(3)?,
                subject_count: row.get(4)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(items) => ok(&req.id, json!({ "classes": items })),
        Err(e) => err(&req.id, "db_query_failed", format!("{e}"), None),
    }
}

fn handle_class_arms_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let name = match clean_name(req, "name") {
        Ok(n) => n,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_row(
        conn,
        req,
        "SELECT 1 FROM classes WHERE id = ?1",
        class_id,
        "class",
    ) {
        return resp;
    }
    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO class_arms (id, class_id, name) VALUES (?1, ?2, ?3)",
        params![id, class_id, name],
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            format!("insert class arm: {e}"),
            None,
        );
    }
    ok(&req.id, json!({ "classArmId": id }))
}

fn handle_class_arms_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let mut stmt = match conn.prepare(
        "SELECT a.id, a.class_id, a.name,
                (SELECT COUNT(*) FROM students s
                 WHERE s.class_arm_id = a.id AND s.active = 1) AS student_count
         FROM class_arms a
         WHERE a.class_id = ?1
         ORDER BY a.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", format!("{e}"), None),
    };
    let rows = stmt
        .query_map(params![class_id], |row| {
            Ok(ClassArmSummary {
                id: row.get(0)?,
                class_id: row.get(1)?,
                name: row.get(2)?,
                student_count: row.get(3)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(items) => ok(&req.id, json!({ "classArms": items })),
        Err(e) => err(&req.id, "db_query_failed", format!("{e}"), None),
    }
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let name = match clean_name(req, "name") {
        Ok(n) => n,
        Err(resp) => return resp,
    };
    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects (id, name) VALUES (?1, ?2)",
        params![id, name],
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            format!("insert subject: {e}"),
            None,
        );
    }
    ok(&req.id, json!({ "subjectId": id }))
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let mut stmt = match conn.prepare("SELECT id, name FROM subjects ORDER BY name") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", format!("{e}"), None),
    };
    let rows = stmt
        .query_map([], |row| {
            Ok(NamedRow {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(items) => ok(&req.id, json!({ "subjects": items })),
        Err(e) => err(&req.id, "db_query_failed", format!("{e}"), None),
    }
}

/// Full replace of a class's subject list; payload order becomes the
/// teaching order used everywhere downstream.
fn handle_class_subjects_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_row(
        conn,
        req,
        "SELECT 1 FROM classes WHERE id = ?1",
        class_id,
        "class",
    ) {
        return resp;
    }
    let subject_ids: Vec<String> = match req.params.get("subjectIds") {
        Some(v) => match serde_json::from_value(v.clone()) {
            Ok(ids) => ids,
            Err(e) => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("params.subjectIds: {e}"),
                    None,
                )
            }
        },
        None => return err(&req.id, "bad_params", "missing params.subjectIds", None),
    };
    let mut seen = std::collections::HashSet::new();
    for subject_id in &subject_ids {
        if !seen.insert(subject_id.as_str()) {
            return err(
                &req.id,
                "bad_params",
                format!("duplicate subject {subject_id}"),
                None,
            );
        }
        if let Err(resp) = require_row(
            conn,
            req,
            "SELECT 1 FROM subjects WHERE id = ?1",
            subject_id,
            "subject",
        ) {
            return resp;
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_tx_failed", format!("{e}"), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM class_subjects WHERE class_id = ?1",
        params![class_id],
    ) {
        return err(&req.id, "db_update_failed", format!("{e}"), None);
    }
    for (idx, subject_id) in subject_ids.iter().enumerate() {
        if let Err(e) = tx.execute(
            "INSERT INTO class_subjects (class_id, subject_id, sort_order) VALUES (?1, ?2, ?3)",
            params![class_id, subject_id, idx as i64],
        ) {
            return err(&req.id, "db_insert_failed", format!("{e}"), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", format!("{e}"), None);
    }
    ok(
        &req.id,
        json!({ "classId": class_id, "subjectIds": subject_ids }),
    )
}

fn handle_class_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let mut stmt = match conn.prepare(
        "SELECT cs.subject_id, s.name, cs.sort_order
         FROM class_subjects cs
         JOIN subjects s ON s.id = cs.subject_id
         WHERE cs.class_id = ?1
         ORDER BY cs.sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", format!("{e}"), None),
    };
    let rows = stmt
        .query_map(params![class_id], |row| {
            Ok(ClassSubjectRow {
                subject_id: row.get(0)?,
                name: row.get(1)?,
                sort_order: row.get(2)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(items) => ok(&req.id, json!({ "subjects": items })),
        Err(e) => err(&req.id, "db_query_failed", format!("{e}"), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_arm_id = match required_str(req, "classArmId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let last_name = match clean_name(req, "lastName") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let first_name = match clean_name(req, "firstName") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_row(
        conn,
        req,
        "SELECT 1 FROM class_arms WHERE id = ?1",
        class_arm_id,
        "class arm",
    ) {
        return resp;
    }
    let admission_no = optional_str(req, "admissionNo").unwrap_or("");
    let sort_order = match optional_i64(req, "sortOrder") {
        Some(v) => v,
        None => {
            let count: Result<i64, _> = conn.query_row(
                "SELECT COUNT(*) FROM students WHERE class_arm_id = ?1",
                params![class_arm_id],
                |row| row.get(0),
            );
            match count {
                Ok(v) => v,
                Err(e) => {
                    return err(&req.id, "db_query_failed", format!("{e}"), None);
                }
            }
        }
    };
    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students (id, class_arm_id, last_name, first_name, admission_no, active, sort_order)
         VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
        params![id, class_arm_id, last_name, first_name, admission_no, sort_order],
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            format!("insert student: {e}"),
            None,
        );
    }
    ok(&req.id, json!({ "studentId": id }))
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_arm_id = match required_str(req, "classArmId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let mut stmt = match conn.prepare(
        "SELECT id, class_arm_id, last_name, first_name, admission_no, active, sort_order
         FROM students
         WHERE class_arm_id = ?1
         ORDER BY sort_order, last_name, first_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", format!("{e}"), None),
    };
    let rows = stmt
        .query_map(params![class_arm_id], |row| {
            Ok(StudentRow {
                id: row.get(0)?,
                class_arm_id: row.get(1)?,
                last_name: row.get(2)?,
                first_name: row.get(3)?,
                admission_no: row.get(4)?,
                active: row.get::<_, i64>(5)? != 0,
                sort_order: row.get(6)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(items) => ok(&req.id, json!({ "students": items })),
        Err(e) => err(&req.id, "db_query_failed", format!("{e}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sessions.create" => Some(handle_sessions_create(state, req)),
        "sessions.list" => Some(handle_sessions_list(state, req)),
        "terms.create" => Some(handle_terms_create(state, req)),
        "terms.list" => Some(handle_terms_list(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.list" => Some(handle_classes_list(state, req)),
        "classArms.create" => Some(handle_class_arms_create(state, req)),
        "classArms.list" => Some(handle_class_arms_list(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "classSubjects.set" => Some(handle_class_subjects_set(state, req)),
        "classSubjects.list" => Some(handle_class_subjects_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        _ => None,
    }
}
