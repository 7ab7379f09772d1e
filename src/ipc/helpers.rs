use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use crate::store::TermScope;
use rusqlite::Connection;

/// Param extraction helpers shared by the handlers. Each returns the
/// ready-to-send error envelope on the Err side so call sites can use
/// `match`/`?`-style early returns.

pub fn required_str<'a>(req: &'a Request, key: &str) -> Result<&'a str, serde_json::Value> {
    match req.params.get(key).and_then(|v| v.as_str()) {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(err(
            &req.id,
            "bad_params",
            format!("missing params.{key}"),
            None,
        )),
    }
}

pub fn optional_str<'a>(req: &'a Request, key: &str) -> Option<&'a str> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
}

pub fn required_f64(req: &Request, key: &str) -> Result<f64, serde_json::Value> {
    req.params.get(key).and_then(|v| v.as_f64()).ok_or_else(|| {
        err(
            &req.id,
            "bad_params",
            format!("missing params.{key}"),
            None,
        )
    })
}

pub fn optional_i64(req: &Request, key: &str) -> Option<i64> {
    req.params.get(key).and_then(|v| v.as_i64())
}

/// The four ids every score operation is scoped by.
pub fn term_scope(req: &Request) -> Result<TermScope, serde_json::Value> {
    Ok(TermScope {
        session_id: required_str(req, "sessionId")?.to_string(),
        class_id: required_str(req, "classId")?.to_string(),
        class_arm_id: required_str(req, "classArmId")?.to_string(),
        term_id: required_str(req, "termId")?.to_string(),
    })
}

pub fn db_conn<'a>(
    state: &'a AppState,
    req: &Request,
) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

/// Scope ids must point at real rows and the arm must belong to the class.
pub fn require_term_rows(
    conn: &Connection,
    req: &Request,
    scope: &TermScope,
) -> Result<(), serde_json::Value> {
    require_row(
        conn,
        req,
        "SELECT 1 FROM sessions WHERE id = ?1",
        &scope.session_id,
        "session",
    )?;
    require_row(
        conn,
        req,
        "SELECT 1 FROM classes WHERE id = ?1",
        &scope.class_id,
        "class",
    )?;
    require_row(
        conn,
        req,
        "SELECT 1 FROM terms WHERE id = ?1",
        &scope.term_id,
        "term",
    )?;
    use rusqlite::OptionalExtension;
    let class_of_arm: Option<String> = conn
        .query_row(
            "SELECT class_id FROM class_arms WHERE id = ?1",
            rusqlite::params![scope.class_arm_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| {
            err(
                &req.id,
                "db_query_failed",
                format!("load class arm: {e}"),
                None,
            )
        })?;
    match class_of_arm {
        None => Err(err(
            &req.id,
            "not_found",
            format!("class arm {} not found", scope.class_arm_id),
            None,
        )),
        Some(cid) if cid != scope.class_id => Err(err(
            &req.id,
            "bad_params",
            format!(
                "class arm {} does not belong to class {}",
                scope.class_arm_id, scope.class_id
            ),
            None,
        )),
        Some(_) => Ok(()),
    }
}

pub fn require_subject_assigned(
    conn: &Connection,
    req: &Request,
    class_id: &str,
    subject_id: &str,
) -> Result<(), serde_json::Value> {
    require_row(
        conn,
        req,
        "SELECT 1 FROM subjects WHERE id = ?1",
        subject_id,
        "subject",
    )?;
    use rusqlite::OptionalExtension;
    let assigned: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM class_subjects WHERE class_id = ?1 AND subject_id = ?2",
            rusqlite::params![class_id, subject_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| {
            err(
                &req.id,
                "db_query_failed",
                format!("load class subject: {e}"),
                None,
            )
        })?;
    if assigned.is_none() {
        return Err(err(
            &req.id,
            "bad_params",
            format!("subject {subject_id} is not offered by class {class_id}"),
            None,
        ));
    }
    Ok(())
}

/// Existence probe for scope ids; the Err side carries a `not_found`
/// envelope naming the missing row.
pub fn require_row(
    conn: &Connection,
    req: &Request,
    sql: &str,
    id: &str,
    what: &str,
) -> Result<(), serde_json::Value> {
    use rusqlite::OptionalExtension;
    let found: Result<Option<i64>, _> = conn
        .query_row(sql, rusqlite::params![id], |row| row.get(0))
        .optional();
    match found {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(err(
            &req.id,
            "not_found",
            format!("{what} {id} not found"),
            None,
        )),
        Err(e) => Err(err(
            &req.id,
            "db_query_failed",
            format!("load {what}: {e}"),
            None,
        )),
    }
}
