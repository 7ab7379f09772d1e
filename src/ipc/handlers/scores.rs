use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, optional_i64, optional_str, required_str, require_subject_assigned,
    require_term_rows, term_scope,
};
use crate::ipc::types::{AppState, Request};
use crate::scheme::{ComponentRef, MarkingScheme};
use crate::store::{ScoreEntry, ScoreScope, ScoreStore, SqliteScoreStore};
use rusqlite::params;
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;

/// Raw score access for sync tooling and spreadsheets. The entry.* session
/// methods are the guided path; these endpoints expose the same store
/// directly.
fn handle_fetch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let scope = match term_scope(req) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_term_rows(conn, req, &scope) {
        return resp;
    }
    let subject_id = optional_str(req, "subjectId");
    let student_id = optional_str(req, "studentId");
    if let Some(subject_id) = subject_id {
        if let Err(resp) = require_subject_assigned(conn, req, &scope.class_id, subject_id) {
            return resp;
        }
    }

    let store = SqliteScoreStore::new(conn);
    match (subject_id, student_id) {
        (Some(subject_id), Some(student_id)) => {
            let scores = match store.fetch_subject(&ScoreScope::new(&scope, subject_id)) {
                Ok(s) => s,
                Err(e) => return err(&req.id, e.code, e.message, None),
            };
            let entries: Vec<ScoreEntry> = scores
                .entries
                .into_iter()
                .filter(|e| e.student_id == student_id)
                .collect();
            ok(
                &req.id,
                json!({ "scores": entries, "version": scores.version }),
            )
        }
        (Some(subject_id), None) => {
            match store.fetch_subject(&ScoreScope::new(&scope, subject_id)) {
                Ok(s) => ok(
                    &req.id,
                    json!({ "scores": s.entries, "version": s.version }),
                ),
                Err(e) => err(&req.id, e.code, e.message, None),
            }
        }
        (None, Some(student_id)) => match store.fetch_student(&scope, student_id) {
            Ok(s) => ok(
                &req.id,
                json!({ "scores": s.entries, "versions": s.versions }),
            ),
            Err(e) => err(&req.id, e.code, e.message, None),
        },
        (None, None) => match store.fetch_term(&scope) {
            Ok(s) => ok(
                &req.id,
                json!({ "scores": s.entries, "versions": s.versions }),
            ),
            Err(e) => err(&req.id, e.code, e.message, None),
        },
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EntryDiagnostic {
    index: usize,
    student_id: String,
    component_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sub_component_id: Option<String>,
    code: &'static str,
    message: String,
}

fn check_entries(
    conn: &rusqlite::Connection,
    scope: &ScoreScope,
    scheme: &MarkingScheme,
    entries: &[ScoreEntry],
) -> Result<Vec<EntryDiagnostic>, rusqlite::Error> {
    let roster: HashSet<String> = conn
        .prepare("SELECT id FROM students WHERE class_arm_id = ?1 AND active = 1")?
        .query_map(params![scope.term.class_arm_id], |row| row.get(0))
        .and_then(|it| it.collect::<Result<HashSet<_>, _>>())?;
    let leaf_max: std::collections::HashMap<ComponentRef, f64> =
        scheme.leaf_refs().into_iter().collect();

    let mut diagnostics = Vec::new();
    let mut push = |index: usize, entry: &ScoreEntry, code: &'static str, message: String| {
        diagnostics.push(EntryDiagnostic {
            index,
            student_id: entry.student_id.clone(),
            component_id: entry.component_id.clone(),
            sub_component_id: entry.sub_component_id.clone(),
            code,
            message,
        });
    };

    for (index, entry) in entries.iter().enumerate() {
        if entry.subject_id != scope.subject_id {
            push(
                index,
                entry,
                "subject_mismatch",
                format!(
                    "entry subject {} differs from submission subject {}",
                    entry.subject_id, scope.subject_id
                ),
            );
            continue;
        }
        if !roster.contains(&entry.student_id) {
            push(
                index,
                entry,
                "unknown_student",
                format!("student {} is not on the arm roster", entry.student_id),
            );
            continue;
        }
        if !entry.score.is_finite() || !entry.max_score.is_finite() {
            push(index, entry, "bad_score", "score must be a number".to_string());
            continue;
        }
        if entry.score < 0.0 || entry.score > entry.max_score {
            push(
                index,
                entry,
                "out_of_range",
                format!(
                    "score {} outside 0..={}",
                    entry.score, entry.max_score
                ),
            );
            continue;
        }
        if !leaf_max.is_empty() {
            let key = ComponentRef {
                component_id: entry.component_id.clone(),
                sub_component_id: entry.sub_component_id.clone(),
            };
            match leaf_max.get(&key) {
                None => push(
                    index,
                    entry,
                    "unknown_component",
                    "entry does not match a scoreable scheme column".to_string(),
                ),
                Some(max) if (entry.max_score - max).abs() > f64::EPSILON => push(
                    index,
                    entry,
                    "max_mismatch",
                    format!("entry maxScore {} differs from scheme {}", entry.max_score, max),
                ),
                Some(_) => {}
            }
        }
    }
    Ok(diagnostics)
}

fn handle_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let term = match term_scope(req) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_term_rows(conn, req, &term) {
        return resp;
    }
    if let Err(resp) = require_subject_assigned(conn, req, &term.class_id, subject_id) {
        return resp;
    }
    let entries: Vec<ScoreEntry> = match req.params.get("entries") {
        Some(v) => match serde_json::from_value(v.clone()) {
            Ok(e) => e,
            Err(e) => {
                return err(&req.id, "bad_params", format!("params.entries: {e}"), None)
            }
        },
        None => return err(&req.id, "bad_params", "missing params.entries", None),
    };
    if entries.is_empty() {
        return err(&req.id, "bad_params", "params.entries must not be empty", None);
    }

    let scope = ScoreScope::new(&term, subject_id);
    let scheme = match calc::load_marking_scheme(conn, &term.class_id, &term.term_id) {
        Ok(s) => s,
        Err(e) => return err(&req.id, e.code, e.message, e.details),
    };
    let diagnostics = match check_entries(conn, &scope, &scheme, &entries) {
        Ok(d) => d,
        Err(e) => return err(&req.id, "db_query_failed", format!("{e}"), None),
    };
    if !diagnostics.is_empty() {
        return err(
            &req.id,
            "validation_failed",
            format!("{} entries rejected", diagnostics.len()),
            Some(json!({ "diagnostics": diagnostics })),
        );
    }

    let expected_version = optional_i64(req, "expectedVersion");
    let store = SqliteScoreStore::new(conn);
    match store.submit_subject(&scope, &entries, expected_version) {
        Ok(version) => ok(
            &req.id,
            json!({ "version": version, "entryCount": entries.len() }),
        ),
        Err(e) => err(&req.id, e.code, e.message, None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scores.fetch" => Some(handle_fetch(state, req)),
        "scores.submit" => Some(handle_submit(state, req)),
        _ => None,
    }
}
