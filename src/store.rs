use rusqlite::{params, params_from_iter, types::Value, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Scope of one term's scores for a class arm, before picking a subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TermScope {
    pub session_id: String,
    pub class_id: String,
    pub class_arm_id: String,
    pub term_id: String,
}

/// Submission scope: one subject inside a term scope. Submitting replaces
/// every entry for the students present in the payload, so callers must
/// send complete component sets per student.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreScope {
    #[serde(flatten)]
    pub term: TermScope,
    pub subject_id: String,
}

impl ScoreScope {
    pub fn new(term: &TermScope, subject_id: &str) -> ScoreScope {
        ScoreScope {
            term: term.clone(),
            subject_id: subject_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreEntry {
    pub student_id: String,
    pub subject_id: String,
    pub component_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_component_id: Option<String>,
    pub score: f64,
    pub max_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectVersion {
    pub subject_id: String,
    pub version: i64,
}

#[derive(Debug)]
pub struct SubjectScores {
    pub entries: Vec<ScoreEntry>,
    pub version: i64,
}

#[derive(Debug)]
pub struct StudentScores {
    pub entries: Vec<ScoreEntry>,
    pub versions: Vec<SubjectVersion>,
}

#[derive(Debug)]
pub struct TermScores {
    pub entries: Vec<ScoreEntry>,
    pub versions: Vec<SubjectVersion>,
}

#[derive(Debug)]
pub struct StoreError {
    pub code: &'static str,
    pub message: String,
}

impl StoreError {
    pub fn new(code: &'static str, message: &str) -> StoreError {
        StoreError {
            code,
            message: message.to_string(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.code == "conflict"
    }
}

/// Remote score store boundary. Implementations hold no scheme knowledge;
/// they replace and return entries verbatim and track one version counter
/// per (term scope, subject).
pub trait ScoreStore {
    /// All entries for every student of one subject in the scope.
    fn fetch_subject(&self, scope: &ScoreScope) -> Result<SubjectScores, StoreError>;

    /// All entries for one student across every subject in the scope.
    fn fetch_student(&self, term: &TermScope, student_id: &str)
        -> Result<StudentScores, StoreError>;

    /// Every entry in the term scope, with all subject versions.
    fn fetch_term(&self, term: &TermScope) -> Result<TermScores, StoreError>;

    /// Full replace for the students present in `entries`: their previous
    /// entries in the scope vanish and the payload becomes the record.
    /// With `expected_version` set, the write is refused with a conflict
    /// error when the scope has moved on. Returns the new version.
    fn submit_subject(
        &self,
        scope: &ScoreScope,
        entries: &[ScoreEntry],
        expected_version: Option<i64>,
    ) -> Result<i64, StoreError>;
}

/// Workspace-database implementation.
pub struct SqliteScoreStore<'a> {
    pub conn: &'a Connection,
}

impl<'a> SqliteScoreStore<'a> {
    pub fn new(conn: &'a Connection) -> SqliteScoreStore<'a> {
        SqliteScoreStore { conn }
    }

    fn current_version(&self, scope: &ScoreScope) -> Result<i64, StoreError> {
        let version: Option<i64> = self
            .conn
            .query_row(
                "SELECT version FROM score_scope_versions
                 WHERE session_id = ?1 AND class_id = ?2 AND class_arm_id = ?3
                   AND term_id = ?4 AND subject_id = ?5",
                params![
                    scope.term.session_id,
                    scope.term.class_id,
                    scope.term.class_arm_id,
                    scope.term.term_id,
                    scope.subject_id
                ],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::new("db_query_failed", &format!("load version: {e}")))?;
        Ok(version.unwrap_or(0))
    }

    fn term_versions(&self, term: &TermScope) -> Result<Vec<SubjectVersion>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT subject_id, version FROM score_scope_versions
                 WHERE session_id = ?1 AND class_id = ?2 AND class_arm_id = ?3 AND term_id = ?4
                 ORDER BY subject_id",
            )
            .map_err(|e| StoreError::new("db_query_failed", &format!("prepare versions: {e}")))?;
        stmt.query_map(
            params![term.session_id, term.class_id, term.class_arm_id, term.term_id],
            |row| {
                Ok(SubjectVersion {
                    subject_id: row.get(0)?,
                    version: row.get(1)?,
                })
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| StoreError::new("db_query_failed", &format!("load versions: {e}")))
    }
}

fn entry_from_row(row: &rusqlite::Row) -> rusqlite::Result<ScoreEntry> {
    let sub: String = row.get(3)?;
    Ok(ScoreEntry {
        student_id: row.get(0)?,
        subject_id: row.get(1)?,
        component_id: row.get(2)?,
        sub_component_id: if sub.is_empty() { None } else { Some(sub) },
        score: row.get(4)?,
        max_score: row.get(5)?,
    })
}

impl<'a> ScoreStore for SqliteScoreStore<'a> {
    fn fetch_subject(&self, scope: &ScoreScope) -> Result<SubjectScores, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT student_id, subject_id, component_id, sub_component_id, score, max_score
                 FROM score_entries
                 WHERE session_id = ?1 AND class_id = ?2 AND class_arm_id = ?3
                   AND term_id = ?4 AND subject_id = ?5
                 ORDER BY student_id, component_id, sub_component_id",
            )
            .map_err(|e| StoreError::new("db_query_failed", &format!("prepare fetch: {e}")))?;
        let entries = stmt
            .query_map(
                params![
                    scope.term.session_id,
                    scope.term.class_id,
                    scope.term.class_arm_id,
                    scope.term.term_id,
                    scope.subject_id
                ],
                |row| entry_from_row(row),
            )
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| StoreError::new("db_query_failed", &format!("fetch subject: {e}")))?;
        let version = self.current_version(scope)?;
        debug!(
            subject = %scope.subject_id,
            entries = entries.len(),
            version,
            "fetched subject scores"
        );
        Ok(SubjectScores { entries, version })
    }

    fn fetch_student(
        &self,
        term: &TermScope,
        student_id: &str,
    ) -> Result<StudentScores, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT student_id, subject_id, component_id, sub_component_id, score, max_score
                 FROM score_entries
                 WHERE session_id = ?1 AND class_id = ?2 AND class_arm_id = ?3
                   AND term_id = ?4 AND student_id = ?5
                 ORDER BY subject_id, component_id, sub_component_id",
            )
            .map_err(|e| StoreError::new("db_query_failed", &format!("prepare fetch: {e}")))?;
        let entries = stmt
            .query_map(
                params![
                    term.session_id,
                    term.class_id,
                    term.class_arm_id,
                    term.term_id,
                    student_id
                ],
                |row| entry_from_row(row),
            )
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| StoreError::new("db_query_failed", &format!("fetch student: {e}")))?;
        let versions = self.term_versions(term)?;
        Ok(StudentScores { entries, versions })
    }

    fn fetch_term(&self, term: &TermScope) -> Result<TermScores, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT student_id, subject_id, component_id, sub_component_id, score, max_score
                 FROM score_entries
                 WHERE session_id = ?1 AND class_id = ?2 AND class_arm_id = ?3 AND term_id = ?4
                 ORDER BY subject_id, student_id, component_id, sub_component_id",
            )
            .map_err(|e| StoreError::new("db_query_failed", &format!("prepare fetch: {e}")))?;
        let entries = stmt
            .query_map(
                params![term.session_id, term.class_id, term.class_arm_id, term.term_id],
                |row| entry_from_row(row),
            )
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| StoreError::new("db_query_failed", &format!("fetch term: {e}")))?;
        let versions = self.term_versions(term)?;
        Ok(TermScores { entries, versions })
    }

    fn submit_subject(
        &self,
        scope: &ScoreScope,
        entries: &[ScoreEntry],
        expected_version: Option<i64>,
    ) -> Result<i64, StoreError> {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(|e| StoreError::new("db_tx_failed", &format!("begin submit: {e}")))?;

        let current = self.current_version(scope)?;
        if let Some(expected) = expected_version {
            if expected != current {
                warn!(
                    subject = %scope.subject_id,
                    expected,
                    current,
                    "rejecting stale score submission"
                );
                return Err(StoreError::new(
                    "conflict",
                    &format!(
                        "scores for this subject changed since they were loaded (expected version {expected}, current {current})"
                    ),
                ));
            }
        }

        let students: BTreeSet<&str> =
            entries.iter().map(|e| e.student_id.as_str()).collect();
        if !students.is_empty() {
            let placeholders = std::iter::repeat("?")
                .take(students.len())
                .collect::<Vec<_>>()
                .join(",");
            let sql = format!(
                "DELETE FROM score_entries
                 WHERE session_id = ? AND class_id = ? AND class_arm_id = ?
                   AND term_id = ? AND subject_id = ? AND student_id IN ({placeholders})"
            );
            let mut bind: Vec<Value> = vec![
                Value::Text(scope.term.session_id.clone()),
                Value::Text(scope.term.class_id.clone()),
                Value::Text(scope.term.class_arm_id.clone()),
                Value::Text(scope.term.term_id.clone()),
                Value::Text(scope.subject_id.clone()),
            ];
            for student in &students {
                bind.push(Value::Text((*student).to_string()));
            }
            tx.execute(&sql, params_from_iter(bind))
                .map_err(|e| StoreError::new("db_update_failed", &format!("clear scope: {e}")))?;
        }

        for entry in entries {
            tx.execute(
                "INSERT INTO score_entries (id, session_id, class_id, class_arm_id, term_id,
                     subject_id, student_id, component_id, sub_component_id, score, max_score)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    Uuid::new_v4().to_string(),
                    scope.term.session_id,
                    scope.term.class_id,
                    scope.term.class_arm_id,
                    scope.term.term_id,
                    scope.subject_id,
                    entry.student_id,
                    entry.component_id,
                    entry.sub_component_id.as_deref().unwrap_or(""),
                    entry.score,
                    entry.max_score
                ],
            )
            .map_err(|e| StoreError::new("db_insert_failed", &format!("insert entry: {e}")))?;
        }

        let next = current + 1;
        tx.execute(
            "INSERT OR REPLACE INTO score_scope_versions
                 (session_id, class_id, class_arm_id, term_id, subject_id, version, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                scope.term.session_id,
                scope.term.class_id,
                scope.term.class_arm_id,
                scope.term.term_id,
                scope.subject_id,
                next,
                chrono::Utc::now().to_rfc3339()
            ],
        )
        .map_err(|e| StoreError::new("db_update_failed", &format!("bump version: {e}")))?;

        tx.commit()
            .map_err(|e| StoreError::new("db_tx_failed", &format!("commit submit: {e}")))?;
        info!(
            subject = %scope.subject_id,
            students = students.len(),
            entries = entries.len(),
            version = next,
            "replaced subject scores"
        );
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn scope() -> ScoreScope {
        ScoreScope {
            term: TermScope {
                session_id: "sess".to_string(),
                class_id: "jss1".to_string(),
                class_arm_id: "jss1a".to_string(),
                term_id: "term1".to_string(),
            },
            subject_id: "math".to_string(),
        }
    }

    fn entry(student: &str, component: &str, sub: Option<&str>, score: f64, max: f64) -> ScoreEntry {
        ScoreEntry {
            student_id: student.to_string(),
            subject_id: "math".to_string(),
            component_id: component.to_string(),
            sub_component_id: sub.map(|s| s.to_string()),
            score,
            max_score: max,
        }
    }

    fn open_store_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn submit_then_fetch_round_trips() {
        let conn = open_store_conn();
        let store = SqliteScoreStore::new(&conn);
        let payload = vec![
            entry("st1", "ca1", Some("t1"), 8.0, 10.0),
            entry("st1", "ca1", Some("t2"), 9.0, 10.0),
            entry("st1", "exam", None, 70.0, 80.0),
        ];
        let version = store.submit_subject(&scope(), &payload, None).unwrap();
        assert_eq!(version, 1);

        let fetched = store.fetch_subject(&scope()).unwrap();
        assert_eq!(fetched.version, 1);
        assert_eq!(fetched.entries.len(), 3);
        let exam = fetched
            .entries
            .iter()
            .find(|e| e.component_id == "exam")
            .unwrap();
        assert_eq!(exam.score, 70.0);
        assert_eq!(exam.sub_component_id, None);
        let t2 = fetched
            .entries
            .iter()
            .find(|e| e.sub_component_id.as_deref() == Some("t2"))
            .unwrap();
        assert_eq!(t2.score, 9.0);
    }

    #[test]
    fn resubmit_replaces_student_scope_completely() {
        let conn = open_store_conn();
        let store = SqliteScoreStore::new(&conn);
        store
            .submit_subject(
                &scope(),
                &[
                    entry("st1", "ca1", Some("t1"), 8.0, 10.0),
                    entry("st1", "exam", None, 70.0, 80.0),
                ],
                None,
            )
            .unwrap();
        // Second submission omits the exam entry; the omission wins.
        store
            .submit_subject(&scope(), &[entry("st1", "ca1", Some("t1"), 5.0, 10.0)], None)
            .unwrap();

        let fetched = store.fetch_subject(&scope()).unwrap();
        assert_eq!(fetched.entries.len(), 1);
        assert_eq!(fetched.entries[0].score, 5.0);
        assert_eq!(fetched.version, 2);
    }

    #[test]
    fn submit_leaves_other_students_untouched() {
        let conn = open_store_conn();
        let store = SqliteScoreStore::new(&conn);
        store
            .submit_subject(
                &scope(),
                &[
                    entry("st1", "exam", None, 70.0, 80.0),
                    entry("st2", "exam", None, 55.0, 80.0),
                ],
                None,
            )
            .unwrap();
        store
            .submit_subject(&scope(), &[entry("st1", "exam", None, 60.0, 80.0)], None)
            .unwrap();

        let fetched = store.fetch_subject(&scope()).unwrap();
        let st2 = fetched
            .entries
            .iter()
            .find(|e| e.student_id == "st2")
            .unwrap();
        assert_eq!(st2.score, 55.0);
    }

    #[test]
    fn submit_scopes_by_subject() {
        let conn = open_store_conn();
        let store = SqliteScoreStore::new(&conn);
        let math = scope();
        let eng = ScoreScope::new(&math.term, "eng");
        store
            .submit_subject(&math, &[entry("st1", "exam", None, 70.0, 80.0)], None)
            .unwrap();
        let mut eng_entry = entry("st1", "exam", None, 40.0, 80.0);
        eng_entry.subject_id = "eng".to_string();
        store.submit_subject(&eng, &[eng_entry], None).unwrap();

        assert_eq!(store.fetch_subject(&math).unwrap().entries.len(), 1);
        assert_eq!(store.fetch_subject(&eng).unwrap().entries.len(), 1);

        let term = store.fetch_term(&math.term).unwrap();
        assert_eq!(term.entries.len(), 2);
        assert_eq!(term.versions.len(), 2);

        let student = store.fetch_student(&math.term, "st1").unwrap();
        assert_eq!(student.entries.len(), 2);
    }

    #[test]
    fn stale_expected_version_is_refused() {
        let conn = open_store_conn();
        let store = SqliteScoreStore::new(&conn);
        store
            .submit_subject(&scope(), &[entry("st1", "exam", None, 70.0, 80.0)], Some(0))
            .unwrap();

        // A second writer still holding version 0 must not clobber.
        let err = store
            .submit_subject(&scope(), &[entry("st1", "exam", None, 10.0, 80.0)], Some(0))
            .unwrap_err();
        assert!(err.is_conflict());

        let fetched = store.fetch_subject(&scope()).unwrap();
        assert_eq!(fetched.entries[0].score, 70.0);
        assert_eq!(fetched.version, 1);
    }

    #[test]
    fn omitted_expected_version_overwrites() {
        let conn = open_store_conn();
        let store = SqliteScoreStore::new(&conn);
        store
            .submit_subject(&scope(), &[entry("st1", "exam", None, 70.0, 80.0)], None)
            .unwrap();
        let version = store
            .submit_subject(&scope(), &[entry("st1", "exam", None, 65.0, 80.0)], None)
            .unwrap();
        assert_eq!(version, 2);
        let fetched = store.fetch_subject(&scope()).unwrap();
        assert_eq!(fetched.entries[0].score, 65.0);
    }
}
