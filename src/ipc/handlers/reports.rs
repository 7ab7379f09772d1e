use crate::calc::{self, CalcContext, ResultBatchModel};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_str, required_str, require_row};
use crate::ipc::types::{AppState, Request};
use crate::scheme;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use tracing::info;

/// Fixed conduct rows on the printed report card; filled in by hand.
const BEHAVIORAL_FIELDS: [&str; 6] = [
    "Punctuality",
    "Attentiveness",
    "Class Participation",
    "Neatness",
    "Politeness",
    "Honesty",
];

fn load_batch_model(
    conn: &rusqlite::Connection,
    req: &Request,
    batch_id: &str,
) -> Result<ResultBatchModel, serde_json::Value> {
    let snapshot: Option<String> = conn
        .query_row(
            "SELECT snapshot FROM result_batches WHERE id = ?1",
            params![batch_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", format!("load batch: {e}"), None))?;
    let Some(snapshot) = snapshot else {
        return Err(err(
            &req.id,
            "not_found",
            format!("result batch {batch_id} not found"),
            None,
        ));
    };
    serde_json::from_str(&snapshot).map_err(|e| {
        err(
            &req.id,
            "db_query_failed",
            format!("decode batch snapshot: {e}"),
            None,
        )
    })
}

/// Compute a full result batch for the scope and freeze it. Reports read
/// the frozen snapshot, so later score edits never shift a published
/// batch.
fn handle_generate_batch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let session_id = match required_str(req, "sessionId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let class_arm_id = match required_str(req, "classArmId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let term_id = match required_str(req, "termId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let title = optional_str(req, "title");

    let ctx = CalcContext {
        conn,
        session_id,
        class_id,
        class_arm_id,
        term_id,
    };
    let model = match calc::compute_result_batch(&ctx, title) {
        Ok(m) => m,
        Err(e) => return err(&req.id, e.code, e.message, e.details),
    };
    let snapshot = match serde_json::to_string(&model) {
        Ok(s) => s,
        Err(e) => {
            return err(
                &req.id,
                "db_insert_failed",
                format!("encode batch snapshot: {e}"),
                None,
            )
        }
    };
    if let Err(e) = conn.execute(
        "INSERT INTO result_batches
           (id, session_id, class_id, class_arm_id, term_id, title, generated_at, snapshot)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            model.batch.id,
            model.batch.session_id,
            model.batch.class_id,
            model.batch.class_arm_id,
            model.batch.term_id,
            model.batch.title,
            model.batch.generated_at,
            snapshot
        ],
    ) {
        return err(&req.id, "db_insert_failed", format!("{e}"), None);
    }
    info!(
        batch = %model.batch.id,
        students = model.students.len(),
        "result batch generated"
    );
    ok(
        &req.id,
        json!({
            "resultBatch": model.batch,
            "classStats": model.class_stats,
            "studentCount": model.students.len(),
        }),
    )
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchRow {
    id: String,
    title: String,
    session_id: String,
    class_id: String,
    class_arm_id: String,
    term_id: String,
    generated_at: String,
}

fn handle_list_batches(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let mut sql = String::from(
        "SELECT id, title, session_id, class_id, class_arm_id, term_id, generated_at
         FROM result_batches",
    );
    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<SqlValue> = Vec::new();
    for (key, clause) in [
        ("sessionId", "session_id = ?"),
        ("classId", "class_id = ?"),
        ("classArmId", "class_arm_id = ?"),
        ("termId", "term_id = ?"),
    ] {
        if let Some(v) = optional_str(req, key) {
            clauses.push(clause);
            binds.push(SqlValue::Text(v.to_string()));
        }
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY generated_at DESC");

    let rows = conn.prepare(&sql).and_then(|mut stmt| {
        stmt.query_map(params_from_iter(binds), |row| {
            Ok(BatchRow {
                id: row.get(0)?,
                title: row.get(1)?,
                session_id: row.get(2)?,
                class_id: row.get(3)?,
                class_arm_id: row.get(4)?,
                term_id: row.get(5)?,
                generated_at: row.get(6)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    });
    match rows {
        Ok(batches) => ok(&req.id, json!({ "resultBatches": batches })),
        Err(e) => err(&req.id, "db_query_failed", format!("{e}"), None),
    }
}

fn handle_get_batch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let batch_id = match required_str(req, "batchId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match load_batch_model(conn, req, batch_id) {
        Ok(model) => ok(&req.id, json!({ "model": model })),
        Err(resp) => resp,
    }
}

/// One student's report card, projected from a frozen batch. Nothing is
/// recomputed here.
fn handle_report_card_model(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let batch_id = match required_str(req, "batchId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let model = match load_batch_model(conn, req, batch_id) {
        Ok(m) => m,
        Err(resp) => return resp,
    };
    let Some(student) = model.students.iter().find(|s| s.student_id == student_id) else {
        return err(
            &req.id,
            "not_found",
            format!("student {student_id} is not in batch {batch_id}"),
            None,
        );
    };
    ok(
        &req.id,
        json!({
            "batch": model.batch,
            "student": student,
            "columns": model.scheme.columns,
            "totalObtainable": model.scheme.total_obtainable,
            "subjects": model.subjects,
            "classStats": model.class_stats,
            "gradeLegend": model.grading_system.as_ref().map(|g| &g.grades),
            "behavioralFields": BEHAVIORAL_FIELDS,
        }),
    )
}

/// Live view of a class's marking layout and grading legend, independent
/// of any batch.
fn handle_scheme_summary_model(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let term_id = match required_str(req, "termId") {
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
    if let Err(resp) = require_row(
        conn,
        req,
        "SELECT 1 FROM terms WHERE id = ?1",
        term_id,
        "term",
    ) {
        return resp;
    }
    let marking = match calc::load_marking_scheme(conn, class_id, term_id) {
        Ok(s) => s,
        Err(e) => return err(&req.id, e.code, e.message, e.details),
    };
    let grading = match calc::load_grading_scheme_for_class(conn, class_id) {
        Ok(g) => g,
        Err(e) => return err(&req.id, e.code, e.message, e.details),
    };
    ok(
        &req.id,
        json!({
            "classId": class_id,
            "termId": term_id,
            "components": marking.components,
            "columns": scheme::layout(&marking),
            "totalObtainable": marking.total_obtainable(),
            "warnings": scheme::scheme_warnings(&marking.components),
            "gradingSystem": grading,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.generateBatch" => Some(handle_generate_batch(state, req)),
        "results.listBatches" => Some(handle_list_batches(state, req)),
        "results.getBatch" => Some(handle_get_batch(state, req)),
        "reports.reportCardModel" => Some(handle_report_card_model(state, req)),
        "reports.schemeSummaryModel" => Some(handle_scheme_summary_model(state, req)),
        _ => None,
    }
}
