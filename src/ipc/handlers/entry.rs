use crate::calc::{self, SubjectInfo};
use crate::entry::{ClassEntry, EntrySession, EntrySessions, RosterStudent, SubjectEntry};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    optional_i64, optional_str, required_f64, required_str, require_subject_assigned,
    require_term_rows, term_scope,
};
use crate::ipc::types::{AppState, Request};
use crate::scheme::{self, ComponentRef};
use crate::store::{ScoreScope, SqliteScoreStore, SubjectVersion};
use rusqlite::{params, Connection};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

/// Guided score entry. Each open call loads roster and scheme, creates a
/// state machine keyed by an opaque session id, and every later call
/// drives that machine. The daemon holds the sessions in memory; they do
/// not survive a restart or a workspace switch.

fn load_roster(conn: &Connection, class_arm_id: &str) -> rusqlite::Result<Vec<RosterStudent>> {
    conn.prepare(
        "SELECT id, last_name, first_name FROM students
         WHERE class_arm_id = ?1 AND active = 1
         ORDER BY sort_order, last_name, first_name",
    )?
    .query_map(params![class_arm_id], |row| {
        let last: String = row.get(1)?;
        let first: String = row.get(2)?;
        Ok(RosterStudent {
            id: row.get(0)?,
            display_name: format!("{last} {first}"),
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
}

fn load_subjects(conn: &Connection, class_id: &str) -> rusqlite::Result<Vec<SubjectInfo>> {
    conn.prepare(
        "SELECT s.id, s.name FROM class_subjects cs
         JOIN subjects s ON s.id = cs.subject_id
         WHERE cs.class_id = ?1
         ORDER BY cs.sort_order",
    )?
    .query_map(params![class_id], |row| {
        Ok(SubjectInfo {
            id: row.get(0)?,
            name: row.get(1)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
}

fn component_ref(req: &Request) -> Result<ComponentRef, serde_json::Value> {
    Ok(ComponentRef {
        component_id: required_str(req, "componentId")?.to_string(),
        sub_component_id: optional_str(req, "subComponentId").map(str::to_string),
    })
}

fn subject_session<'a>(
    sessions: &'a mut EntrySessions,
    req: &Request,
    session_id: &str,
) -> Result<&'a mut SubjectEntry, serde_json::Value> {
    match sessions.sessions.get_mut(session_id) {
        Some(EntrySession::Subject(s)) => Ok(s),
        Some(EntrySession::Class(_)) => Err(err(
            &req.id,
            "bad_params",
            format!("{session_id} is a class entry session"),
            None,
        )),
        None => Err(err(
            &req.id,
            "not_found",
            format!("entry session {session_id} not found"),
            None,
        )),
    }
}

fn class_session<'a>(
    sessions: &'a mut EntrySessions,
    req: &Request,
    session_id: &str,
) -> Result<&'a mut ClassEntry, serde_json::Value> {
    match sessions.sessions.get_mut(session_id) {
        Some(EntrySession::Class(s)) => Ok(s),
        Some(EntrySession::Subject(_)) => Err(err(
            &req.id,
            "bad_params",
            format!("{session_id} is a subject entry session"),
            None,
        )),
        None => Err(err(
            &req.id,
            "not_found",
            format!("entry session {session_id} not found"),
            None,
        )),
    }
}

fn subject_view(session_id: &str, session: &SubjectEntry) -> serde_json::Value {
    json!({
        "entrySessionId": session_id,
        "mode": "subject",
        "state": session.state.as_str(),
        "scope": session.scope,
        "columns": scheme::layout(&session.scheme),
        "totalObtainable": session.scheme.total_obtainable(),
        "students": session.students,
        "scores": session.entries(),
        "version": session.version,
        "lastError": session.last_error,
    })
}

fn class_view(session_id: &str, session: &ClassEntry) -> serde_json::Value {
    let obtainable = session.scheme.total_obtainable();
    let overall_obtainable = obtainable * session.subjects.len() as f64;
    let overall_total = session.overall_total();
    let subject_totals: Vec<serde_json::Value> = session
        .subject_totals()
        .into_iter()
        .map(|(subject_id, total)| json!({ "subjectId": subject_id, "total": total }))
        .collect();
    let versions: Vec<SubjectVersion> = session
        .subjects
        .iter()
        .map(|s| SubjectVersion {
            subject_id: s.id.clone(),
            version: session.version_of(&s.id),
        })
        .collect();
    json!({
        "entrySessionId": session_id,
        "mode": "class",
        "state": session.state.as_str(),
        "scope": session.term,
        "columns": scheme::layout(&session.scheme),
        "totalObtainable": obtainable,
        "subjects": session.subjects,
        "students": session.students,
        "studentIndex": session.index,
        "student": session.current_student(),
        "scores": session.entries(),
        "versions": versions,
        "subjectTotals": subject_totals,
        "overallTotal": overall_total,
        "overallObtainable": overall_obtainable,
        "overallPercentage": calc::round2(calc::percentage(overall_total, overall_obtainable)),
        "lastError": session.last_error,
    })
}

fn handle_subject_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let AppState { db, entry, .. } = state;
    let Some(conn) = db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
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

    let marking = match calc::load_marking_scheme(conn, &term.class_id, &term.term_id) {
        Ok(s) => s,
        Err(e) => return err(&req.id, e.code, e.message, e.details),
    };
    let students = match load_roster(conn, &term.class_arm_id) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", format!("{e}"), None),
    };
    let scope = ScoreScope::new(&term, subject_id);
    let mut session = SubjectEntry::new(scope, marking, students);
    if let Err(e) = session.reload(&SqliteScoreStore::new(conn)) {
        return err(&req.id, e.code, e.message, None);
    }
    let session_id = Uuid::new_v4().to_string();
    let view = subject_view(&session_id, &session);
    entry
        .sessions
        .insert(session_id.clone(), EntrySession::Subject(session));
    info!(session = %session_id, subject = subject_id, "subject entry opened");
    ok(&req.id, view)
}

fn handle_subject_edit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session_id = match required_str(req, "entrySessionId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let key = match component_ref(req) {
        Ok(k) => k,
        Err(resp) => return resp,
    };
    let score = match required_f64(req, "score") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let session = match subject_session(&mut state.entry, req, session_id) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    match session.edit(student_id, &key, score) {
        Ok(()) => ok(
            &req.id,
            json!({
                "entrySessionId": session_id,
                "state": session.state.as_str(),
                "studentId": student_id,
                "studentTotal": session.student_total(student_id),
                "version": session.version,
            }),
        ),
        Err(e) => err(
            &req.id,
            e.code,
            e.message,
            Some(json!({ "state": session.state.as_str() })),
        ),
    }
}

fn handle_subject_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let AppState { db, entry, .. } = state;
    let Some(conn) = db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let session_id = match required_str(req, "entrySessionId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let session = match subject_session(entry, req, session_id) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    match session.submit(&SqliteScoreStore::new(conn)) {
        Ok(version) => {
            info!(session = session_id, version, "subject entry submitted");
            ok(&req.id, subject_view(session_id, session))
        }
        Err(e) => err(
            &req.id,
            e.code,
            e.message,
            Some(json!({
                "state": session.state.as_str(),
                "lastError": session.last_error,
            })),
        ),
    }
}

fn handle_subject_state(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session_id = match required_str(req, "entrySessionId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match subject_session(&mut state.entry, req, session_id) {
        Ok(session) => ok(&req.id, subject_view(session_id, session)),
        Err(resp) => resp,
    }
}

/// Drop pending edits and re-fetch from the store, picking up writes made
/// by anyone else since the last load.
fn handle_subject_reload(state: &mut AppState, req: &Request) -> serde_json::Value {
    let AppState { db, entry, .. } = state;
    let Some(conn) = db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let session_id = match required_str(req, "entrySessionId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let session = match subject_session(entry, req, session_id) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    match session.reload(&SqliteScoreStore::new(conn)) {
        Ok(()) => ok(&req.id, subject_view(session_id, session)),
        Err(e) => err(
            &req.id,
            e.code,
            e.message,
            Some(json!({ "state": session.state.as_str() })),
        ),
    }
}

fn handle_class_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let AppState { db, entry, .. } = state;
    let Some(conn) = db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let term = match term_scope(req) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_term_rows(conn, req, &term) {
        return resp;
    }
    let start_index = match optional_i64(req, "studentIndex") {
        Some(v) if v < 0 => {
            return err(&req.id, "bad_params", "studentIndex must not be negative", None)
        }
        Some(v) => v as usize,
        None => 0,
    };

    let marking = match calc::load_marking_scheme(conn, &term.class_id, &term.term_id) {
        Ok(s) => s,
        Err(e) => return err(&req.id, e.code, e.message, e.details),
    };
    let subjects = match load_subjects(conn, &term.class_id) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", format!("{e}"), None),
    };
    let students = match load_roster(conn, &term.class_arm_id) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", format!("{e}"), None),
    };
    let mut session = match ClassEntry::new(term, marking, subjects, students, start_index) {
        Ok(s) => s,
        Err(e) => return err(&req.id, e.code, e.message, None),
    };
    if let Err(e) = session.reload(&SqliteScoreStore::new(conn)) {
        return err(&req.id, e.code, e.message, None);
    }
    let session_id = Uuid::new_v4().to_string();
    let view = class_view(&session_id, &session);
    entry
        .sessions
        .insert(session_id.clone(), EntrySession::Class(session));
    info!(session = %session_id, "class entry opened");
    ok(&req.id, view)
}

fn handle_class_edit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session_id = match required_str(req, "entrySessionId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let key = match component_ref(req) {
        Ok(k) => k,
        Err(resp) => return resp,
    };
    let score = match required_f64(req, "score") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let session = match class_session(&mut state.entry, req, session_id) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    match session.edit(subject_id, &key, score) {
        Ok(()) => {
            let subject_total =
                calc::subject_total(&session.scheme, &session.subject_score_map(subject_id));
            ok(
                &req.id,
                json!({
                    "entrySessionId": session_id,
                    "state": session.state.as_str(),
                    "subjectId": subject_id,
                    "subjectTotal": subject_total,
                    "overallTotal": session.overall_total(),
                }),
            )
        }
        Err(e) => err(
            &req.id,
            e.code,
            e.message,
            Some(json!({ "state": session.state.as_str() })),
        ),
    }
}

fn handle_class_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let AppState { db, entry, .. } = state;
    let Some(conn) = db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let session_id = match required_str(req, "entrySessionId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let session = match class_session(entry, req, session_id) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    match session.submit(&SqliteScoreStore::new(conn)) {
        Ok(outcome) => {
            info!(
                session = session_id,
                submitted = outcome.submitted.len(),
                failed = outcome.failed.is_some(),
                "class entry submit pass finished"
            );
            ok(
                &req.id,
                json!({
                    "entrySessionId": session_id,
                    "state": session.state.as_str(),
                    "submitted": outcome.submitted,
                    "failed": outcome.failed,
                    "lastError": session.last_error,
                }),
            )
        }
        Err(e) => err(
            &req.id,
            e.code,
            e.message,
            Some(json!({ "state": session.state.as_str() })),
        ),
    }
}

fn handle_class_move(state: &mut AppState, req: &Request, forward: bool) -> serde_json::Value {
    let AppState { db, entry, .. } = state;
    let Some(conn) = db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let session_id = match required_str(req, "entrySessionId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let session = match class_session(entry, req, session_id) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    let store = SqliteScoreStore::new(conn);
    let moved = if forward {
        session.next(&store)
    } else {
        session.previous(&store)
    };
    match moved {
        Ok(moved) => {
            let mut view = class_view(session_id, session);
            view["moved"] = json!(moved);
            ok(&req.id, view)
        }
        Err(e) => err(
            &req.id,
            e.code,
            e.message,
            Some(json!({ "state": session.state.as_str() })),
        ),
    }
}

fn handle_class_state(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session_id = match required_str(req, "entrySessionId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match class_session(&mut state.entry, req, session_id) {
        Ok(session) => ok(&req.id, class_view(session_id, session)),
        Err(resp) => resp,
    }
}

fn handle_class_reload(state: &mut AppState, req: &Request) -> serde_json::Value {
    let AppState { db, entry, .. } = state;
    let Some(conn) = db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let session_id = match required_str(req, "entrySessionId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let session = match class_session(entry, req, session_id) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    match session.reload(&SqliteScoreStore::new(conn)) {
        Ok(()) => ok(&req.id, class_view(session_id, session)),
        Err(e) => err(
            &req.id,
            e.code,
            e.message,
            Some(json!({ "state": session.state.as_str() })),
        ),
    }
}

fn handle_close(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session_id = match required_str(req, "entrySessionId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match state.entry.sessions.remove(session_id) {
        Some(_) => {
            info!(session = session_id, "entry session closed");
            ok(&req.id, json!({ "closed": true }))
        }
        None => err(
            &req.id,
            "not_found",
            format!("entry session {session_id} not found"),
            None,
        ),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "entry.subjectOpen" => Some(handle_subject_open(state, req)),
        "entry.subjectEdit" => Some(handle_subject_edit(state, req)),
        "entry.subjectSubmit" => Some(handle_subject_submit(state, req)),
        "entry.subjectReload" => Some(handle_subject_reload(state, req)),
        "entry.subjectState" => Some(handle_subject_state(state, req)),
        "entry.classOpen" => Some(handle_class_open(state, req)),
        "entry.classEdit" => Some(handle_class_edit(state, req)),
        "entry.classSubmit" => Some(handle_class_submit(state, req)),
        "entry.classNext" => Some(handle_class_move(state, req, true)),
        "entry.classPrevious" => Some(handle_class_move(state, req, false)),
        "entry.classReload" => Some(handle_class_reload(state, req)),
        "entry.classState" => Some(handle_class_state(state, req)),
        "entry.close" => Some(handle_close(state, req)),
        _ => None,
    }
}
