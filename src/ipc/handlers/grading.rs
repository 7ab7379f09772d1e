use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_str, required_str, require_row};
use crate::ipc::types::{AppState, Request};
use crate::scheme::{self, GradeBand};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

fn parse_bands(req: &Request) -> Result<Vec<GradeBand>, serde_json::Value> {
    let raw = match req.params.get("grades") {
        Some(v) => v.clone(),
        None => return Err(err(&req.id, "bad_params", "missing params.grades", None)),
    };
    let bands: Vec<GradeBand> = serde_json::from_value(raw)
        .map_err(|e| err(&req.id, "bad_params", format!("params.grades: {e}"), None))?;
    if bands.is_empty() {
        return Err(err(
            &req.id,
            "bad_params",
            "params.grades must not be empty",
            None,
        ));
    }
    for band in &bands {
        if band.name.trim().is_empty() {
            return Err(err(
                &req.id,
                "bad_params",
                "grade band name must not be blank",
                None,
            ));
        }
    }
    Ok(bands)
}

fn check_bands(req: &Request, bands: &[GradeBand]) -> Result<(), serde_json::Value> {
    let findings = scheme::validate_bands(bands);
    if findings.is_empty() {
        Ok(())
    } else {
        Err(err(
            &req.id,
            "validation_failed",
            "grade bands are invalid",
            Some(json!({ "findings": findings })),
        ))
    }
}

fn insert_bands(
    tx: &rusqlite::Transaction,
    scheme_id: &str,
    bands: &[GradeBand],
) -> rusqlite::Result<()> {
    for (idx, band) in bands.iter().enumerate() {
        tx.execute(
            "INSERT INTO grade_bands
               (id, grading_scheme_id, name, score_start_point, score_end_point,
                remark, teacher_comment, principal_comment, sort_order)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                Uuid::new_v4().to_string(),
                scheme_id,
                band.name,
                band.score_start_point,
                band.score_end_point,
                band.remark,
                band.teacher_comment,
                band.principal_comment,
                idx as i64
            ],
        )?;
    }
    Ok(())
}

fn assigned_class_ids(
    conn: &rusqlite::Connection,
    scheme_id: &str,
) -> rusqlite::Result<Vec<String>> {
    conn.prepare(
        "SELECT gsc.class_id FROM grading_scheme_classes gsc
         JOIN classes c ON c.id = gsc.class_id
         WHERE gsc.grading_scheme_id = ?1
         ORDER BY c.sort_order, c.name",
    )?
    .query_map(params![scheme_id], |row| row.get(0))
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
}

/// Dry-run check of a band set, no writes.
fn handle_validate(_state: &mut AppState, req: &Request) -> serde_json::Value {
    let bands = match parse_bands(req) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let findings = scheme::validate_bands(&bands);
    ok(
        &req.id,
        json!({ "valid": findings.is_empty(), "findings": findings }),
    )
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v.trim().to_string(),
        Err(resp) => return resp,
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be blank", None);
    }
    let bands = match parse_bands(req) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    if let Err(resp) = check_bands(req, &bands) {
        return resp;
    }

    let id = Uuid::new_v4().to_string();
    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_tx_failed", format!("{e}"), None),
    };
    if let Err(e) = tx.execute(
        "INSERT INTO grading_schemes (id, name) VALUES (?1, ?2)",
        params![id, name],
    ) {
        return err(&req.id, "db_insert_failed", format!("{e}"), None);
    }
    if let Err(e) = insert_bands(&tx, &id, &bands) {
        return err(&req.id, "db_insert_failed", format!("{e}"), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", format!("{e}"), None);
    }
    info!(scheme = %name, bands = bands.len(), "grading scheme created");
    ok(
        &req.id,
        json!({ "gradingSystem": { "id": id, "name": name, "grades": bands } }),
    )
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GradingSummary {
    id: String,
    name: String,
    band_count: i64,
    assigned_class_ids: Vec<String>,
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let rows = conn
        .prepare(
            "SELECT gs.id, gs.name,
                    (SELECT COUNT(*) FROM grade_bands gb WHERE gb.grading_scheme_id = gs.id)
             FROM grading_schemes gs
             ORDER BY gs.name",
        )
        .and_then(|mut stmt| {
            stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        });
    let rows = match rows {
        Ok(r) => r,
        Err(e) => return err(&req.id, "db_query_failed", format!("{e}"), None),
    };
    let mut summaries = Vec::with_capacity(rows.len());
    for (id, name, band_count) in rows {
        let assigned = match assigned_class_ids(conn, &id) {
            Ok(a) => a,
            Err(e) => return err(&req.id, "db_query_failed", format!("{e}"), None),
        };
        summaries.push(GradingSummary {
            id,
            name,
            band_count,
            assigned_class_ids: assigned,
        });
    }
    ok(&req.id, json!({ "gradingSystems": summaries }))
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let id = match required_str(req, "id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let scheme = match calc::load_grading_scheme(conn, id) {
        Ok(Some(s)) => s,
        Ok(None) => {
            return err(&req.id, "not_found", format!("grading scheme {id} not found"), None)
        }
        Err(e) => return err(&req.id, e.code, e.message, e.details),
    };
    let assigned = match assigned_class_ids(conn, id) {
        Ok(a) => a,
        Err(e) => return err(&req.id, "db_query_failed", format!("{e}"), None),
    };
    ok(
        &req.id,
        json!({
            "gradingSystem": scheme,
            "assignedClassIds": assigned,
            "findings": scheme::validate_bands(&scheme.grades),
        }),
    )
}

/// Rename and/or replace the whole band set.
fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let id = match required_str(req, "id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_row(
        conn,
        req,
        "SELECT 1 FROM grading_schemes WHERE id = ?1",
        id,
        "grading scheme",
    ) {
        return resp;
    }
    let name = optional_str(req, "name").map(|v| v.trim().to_string());
    if let Some(name) = &name {
        if name.is_empty() {
            return err(&req.id, "bad_params", "name must not be blank", None);
        }
    }
    let bands = if req.params.get("grades").is_some() {
        let bands = match parse_bands(req) {
            Ok(b) => b,
            Err(resp) => return resp,
        };
        if let Err(resp) = check_bands(req, &bands) {
            return resp;
        }
        Some(bands)
    } else {
        None
    };
    if name.is_none() && bands.is_none() {
        return err(&req.id, "bad_params", "nothing to update", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_tx_failed", format!("{e}"), None),
    };
    if let Some(name) = &name {
        if let Err(e) = tx.execute(
            "UPDATE grading_schemes SET name = ?1 WHERE id = ?2",
            params![name, id],
        ) {
            return err(&req.id, "db_update_failed", format!("{e}"), None);
        }
    }
    if let Some(bands) = &bands {
        if let Err(e) = tx.execute(
            "DELETE FROM grade_bands WHERE grading_scheme_id = ?1",
            params![id],
        ) {
            return err(&req.id, "db_update_failed", format!("{e}"), None);
        }
        if let Err(e) = insert_bands(&tx, id, bands) {
            return err(&req.id, "db_insert_failed", format!("{e}"), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", format!("{e}"), None);
    }

    match calc::load_grading_scheme(conn, id) {
        Ok(Some(scheme)) => ok(&req.id, json!({ "gradingSystem": scheme })),
        Ok(None) => err(&req.id, "not_found", format!("grading scheme {id} not found"), None),
        Err(e) => err(&req.id, e.code, e.message, e.details),
    }
}

/// Full replace of a scheme's class assignments. A class carries at most one
/// grading scheme, so assigning it here detaches it from any other scheme.
fn handle_assign_classes(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let id = match required_str(req, "id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_row(
        conn,
        req,
        "SELECT 1 FROM grading_schemes WHERE id = ?1",
        id,
        "grading scheme",
    ) {
        return resp;
    }
    let class_ids: Vec<String> = match req.params.get("classIds") {
        Some(v) => match serde_json::from_value(v.clone()) {
            Ok(ids) => ids,
            Err(e) => {
                return err(&req.id, "bad_params", format!("params.classIds: {e}"), None)
            }
        },
        None => return err(&req.id, "bad_params", "missing params.classIds", None),
    };
    let mut seen = std::collections::HashSet::new();
    for class_id in &class_ids {
        if !seen.insert(class_id.as_str()) {
            return err(
                &req.id,
                "bad_params",
                format!("duplicate class id {class_id}"),
                None,
            );
        }
        let exists: Option<i64> = match conn
            .query_row(
                "SELECT 1 FROM classes WHERE id = ?1",
                params![class_id],
                |row| row.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", format!("{e}"), None),
        };
        if exists.is_none() {
            return err(&req.id, "not_found", format!("class {class_id} not found"), None);
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_tx_failed", format!("{e}"), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM grading_scheme_classes WHERE grading_scheme_id = ?1",
        params![id],
    ) {
        return err(&req.id, "db_update_failed", format!("{e}"), None);
    }
    let assigned_at = chrono::Utc::now().to_rfc3339();
    for class_id in &class_ids {
        if let Err(e) = tx.execute(
            "INSERT OR REPLACE INTO grading_scheme_classes (class_id, grading_scheme_id, assigned_at)
             VALUES (?1, ?2, ?3)",
            params![class_id, id, assigned_at],
        ) {
            return err(&req.id, "db_insert_failed", format!("{e}"), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", format!("{e}"), None);
    }

    let assigned = match assigned_class_ids(conn, id) {
        Ok(a) => a,
        Err(e) => return err(&req.id, "db_query_failed", format!("{e}"), None),
    };
    info!(scheme = id, classes = assigned.len(), "grading scheme assigned");
    ok(&req.id, json!({ "id": id, "assignedClassIds": assigned }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grading.validate" => Some(handle_validate(state, req)),
        "grading.create" => Some(handle_create(state, req)),
        "grading.list" => Some(handle_list(state, req)),
        "grading.get" => Some(handle_get(state, req)),
        "grading.update" => Some(handle_update(state, req)),
        "grading.assignClasses" => Some(handle_assign_classes(state, req)),
        _ => None,
    }
}
