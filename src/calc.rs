use crate::scheme::{
    self, ComponentKind, ComponentRef, GradeBand, GradingScheme, HeaderColumn, MarkingComponent,
    MarkingScheme,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Entered scores for one student in one subject, keyed by entry cell.
pub type ScoreMap = HashMap<ComponentRef, f64>;

/// Recursive total of one component. Leaves read their cell from the
/// map, absent cells count as zero. Composites sum their children and
/// never read a cell of their own.
pub fn component_total(component: &MarkingComponent, scores: &ScoreMap) -> f64 {
    subtree_total(None, component, scores)
}

fn subtree_total(parent: Option<&str>, node: &MarkingComponent, scores: &ScoreMap) -> f64 {
    if !node.sub_components.is_empty() {
        return node
            .sub_components
            .iter()
            .map(|sub| subtree_total(Some(&node.id), sub, scores))
            .sum();
    }
    let key = match parent {
        None => ComponentRef::top(&node.id),
        Some(parent_id) => ComponentRef::nested(parent_id, &node.id),
    };
    scores.get(&key).copied().unwrap_or(0.0)
}

pub fn subject_total(scheme: &MarkingScheme, scores: &ScoreMap) -> f64 {
    scheme
        .components
        .iter()
        .map(|c| component_total(c, scores))
        .sum()
}

pub fn overall_total<I>(subject_totals: I) -> f64
where
    I: IntoIterator<Item = f64>,
{
    subject_totals.into_iter().sum()
}

/// Zero obtainable yields zero percent, never a division error.
pub fn percentage(total: f64, obtainable: f64) -> f64 {
    if obtainable > 0.0 {
        total / obtainable * 100.0
    } else {
        0.0
    }
}

pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

pub fn grade<'a>(percentage: f64, grading: &'a GradingScheme) -> Option<&'a GradeBand> {
    scheme::lookup_band(&grading.grades, percentage)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassStats {
    pub highest_score: f64,
    pub lowest_score: f64,
    pub average_score: f64,
    pub total_students: i64,
}

pub fn class_stats(totals: &[f64]) -> ClassStats {
    if totals.is_empty() {
        return ClassStats {
            highest_score: 0.0,
            lowest_score: 0.0,
            average_score: 0.0,
            total_students: 0,
        };
    }
    let mut highest = totals[0];
    let mut lowest = totals[0];
    let mut sum = 0.0;
    for &t in totals {
        if t > highest {
            highest = t;
        }
        if t < lowest {
            lowest = t;
        }
        sum += t;
    }
    ClassStats {
        highest_score: highest,
        lowest_score: lowest,
        average_score: round2(sum / totals.len() as f64),
        total_students: totals.len() as i64,
    }
}

#[derive(Debug, Serialize)]
pub struct CalcError {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &'static str, message: &str) -> CalcError {
        CalcError {
            code,
            message: message.to_string(),
            details: None,
        }
    }
}

pub struct CalcContext<'a> {
    pub conn: &'a Connection,
    pub session_id: &'a str,
    pub class_id: &'a str,
    pub class_arm_id: &'a str,
    pub term_id: &'a str,
}

/// Marking scheme for a (class, term), or the empty scheme when nothing
/// is configured yet. Aggregation over the empty scheme is all zeros.
pub fn load_marking_scheme(
    conn: &Connection,
    class_id: &str,
    term_id: &str,
) -> Result<MarkingScheme, CalcError> {
    let scheme_id: Option<String> = conn
        .query_row(
            "SELECT id FROM marking_schemes WHERE class_id = ?1 AND term_id = ?2",
            params![class_id, term_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", &format!("load marking scheme: {e}")))?;
    let Some(scheme_id) = scheme_id else {
        return Ok(MarkingScheme::empty(class_id, term_id));
    };

    struct ComponentRow {
        id: String,
        parent_id: Option<String>,
        name: String,
        kind: String,
        max_score: f64,
    }

    let mut stmt = conn
        .prepare(
            "SELECT id, parent_id, name, kind, max_score
             FROM marking_components
             WHERE scheme_id = ?1
             ORDER BY sort_order",
        )
        .map_err(|e| CalcError::new("db_query_failed", &format!("prepare components: {e}")))?;
    let rows = stmt
        .query_map(params![scheme_id], |row| {
            Ok(ComponentRow {
                id: row.get(0)?,
                parent_id: row.get(1)?,
                name: row.get(2)?,
                kind: row.get(3)?,
                max_score: row.get(4)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", &format!("load components: {e}")))?;

    let to_component = |row: &ComponentRow| -> Result<MarkingComponent, CalcError> {
        let kind = ComponentKind::parse(&row.kind).ok_or_else(|| {
            CalcError::new(
                "db_query_failed",
                &format!("component {} has unknown kind {}", row.id, row.kind),
            )
        })?;
        Ok(MarkingComponent {
            id: row.id.clone(),
            name: row.name.clone(),
            kind,
            max_score: row.max_score,
            sub_components: Vec::new(),
        })
    };

    let mut components: Vec<MarkingComponent> = Vec::new();
    for row in rows.iter().filter(|r| r.parent_id.is_none()) {
        components.push(to_component(row)?);
    }
    for row in &rows {
        let Some(parent_id) = row.parent_id.as_deref() else {
            continue;
        };
        let Some(parent) = components.iter_mut().find(|c| c.id == parent_id) else {
            return Err(CalcError::new(
                "db_query_failed",
                &format!("component {} has missing parent {}", row.id, parent_id),
            ));
        };
        parent.sub_components.push(to_component(row)?);
    }

    Ok(MarkingScheme {
        id: scheme_id,
        class_id: class_id.to_string(),
        term_id: term_id.to_string(),
        components,
    })
}

pub fn load_grading_scheme(
    conn: &Connection,
    grading_scheme_id: &str,
) -> Result<Option<GradingScheme>, CalcError> {
    let name: Option<String> = conn
        .query_row(
            "SELECT name FROM grading_schemes WHERE id = ?1",
            params![grading_scheme_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", &format!("load grading scheme: {e}")))?;
    let Some(name) = name else {
        return Ok(None);
    };
    let mut stmt = conn
        .prepare(
            "SELECT name, score_start_point, score_end_point, remark,
                    teacher_comment, principal_comment
             FROM grade_bands
             WHERE grading_scheme_id = ?1
             ORDER BY sort_order",
        )
        .map_err(|e| CalcError::new("db_query_failed", &format!("prepare bands: {e}")))?;
    let grades = stmt
        .query_map(params![grading_scheme_id], |row| {
            Ok(GradeBand {
                name: row.get(0)?,
                score_start_point: row.get(1)?,
                score_end_point: row.get(2)?,
                remark: row.get(3)?,
                teacher_comment: row.get(4)?,
                principal_comment: row.get(5)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", &format!("load bands: {e}")))?;
    Ok(Some(GradingScheme {
        id: grading_scheme_id.to_string(),
        name,
        grades,
    }))
}

/// Grading scheme currently assigned to the class, if any.
pub fn load_grading_scheme_for_class(
    conn: &Connection,
    class_id: &str,
) -> Result<Option<GradingScheme>, CalcError> {
    let scheme_id: Option<String> = conn
        .query_row(
            "SELECT grading_scheme_id FROM grading_scheme_classes WHERE class_id = ?1",
            params![class_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", &format!("load class grading: {e}")))?;
    match scheme_id {
        Some(id) => load_grading_scheme(conn, &id),
        None => Ok(None),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMeta {
    pub id: String,
    pub title: String,
    pub session_id: String,
    pub session_name: String,
    pub class_id: String,
    pub class_name: String,
    pub class_arm_id: String,
    pub class_arm_name: String,
    pub term_id: String,
    pub term_name: String,
    pub generated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemeStructure {
    pub components: Vec<MarkingComponent>,
    pub columns: Vec<HeaderColumn>,
    pub total_obtainable: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentScore {
    #[serde(flatten)]
    pub key: ComponentRef,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectGrade {
    pub name: String,
    pub remark: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectResult {
    pub subject_id: String,
    pub subject_name: String,
    pub component_scores: Vec<ComponentScore>,
    pub total: f64,
    pub percentage: f64,
    pub grade: Option<SubjectGrade>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverallGrade {
    pub name: String,
    pub remark: String,
    pub teacher_comment: String,
    pub principal_comment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentResult {
    pub student_id: String,
    pub student_name: String,
    pub admission_no: String,
    pub subjects: Vec<SubjectResult>,
    pub total_score: f64,
    pub total_obtainable: f64,
    pub percentage: f64,
    pub grade: Option<OverallGrade>,
}

/// Everything a result batch captures at generation time. Stored as one
/// document; report rendering reads it back and never recomputes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultBatchModel {
    pub batch: BatchMeta,
    pub scheme: SchemeStructure,
    pub subjects: Vec<SubjectInfo>,
    pub students: Vec<StudentResult>,
    pub class_stats: ClassStats,
    pub grading_system: Option<GradingScheme>,
}

struct BatchStudent {
    id: String,
    last_name: String,
    first_name: String,
    admission_no: String,
}

pub fn compute_result_batch(
    ctx: &CalcContext,
    title: Option<&str>,
) -> Result<ResultBatchModel, CalcError> {
    let conn = ctx.conn;

    let session_name = require_name(
        conn,
        "SELECT name FROM sessions WHERE id = ?1",
        ctx.session_id,
        "session",
    )?;
    let class_name = require_name(
        conn,
        "SELECT name FROM classes WHERE id = ?1",
        ctx.class_id,
        "class",
    )?;
    let term_name = require_name(
        conn,
        "SELECT name FROM terms WHERE id = ?1",
        ctx.term_id,
        "term",
    )?;
    let class_arm_name: Option<String> = conn
        .query_row(
            "SELECT name FROM class_arms WHERE id = ?1 AND class_id = ?2",
            params![ctx.class_arm_id, ctx.class_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", &format!("load class arm: {e}")))?;
    let Some(class_arm_name) = class_arm_name else {
        return Err(CalcError::new(
            "not_found",
            &format!(
                "class arm {} not found in class {}",
                ctx.class_arm_id, ctx.class_id
            ),
        ));
    };

    let scheme = load_marking_scheme(conn, ctx.class_id, ctx.term_id)?;
    let columns = scheme::layout(&scheme);
    let obtainable = scheme.total_obtainable();
    let leaf_refs = scheme.leaf_refs();

    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.name
             FROM class_subjects cs
             JOIN subjects s ON s.id = cs.subject_id
             WHERE cs.class_id = ?1
             ORDER BY cs.sort_order",
        )
        .map_err(|e| CalcError::new("db_query_failed", &format!("prepare subjects: {e}")))?;
    let subjects = stmt
        .query_map(params![ctx.class_id], |row| {
            Ok(SubjectInfo {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", &format!("load subjects: {e}")))?;

    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, admission_no
             FROM students
             WHERE class_arm_id = ?1 AND active = 1
             ORDER BY sort_order, last_name, first_name",
        )
        .map_err(|e| CalcError::new("db_query_failed", &format!("prepare students: {e}")))?;
    let students = stmt
        .query_map(params![ctx.class_arm_id], |row| {
            Ok(BatchStudent {
                id: row.get(0)?,
                last_name: row.get(1)?,
                first_name: row.get(2)?,
                admission_no: row.get(3)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", &format!("load students: {e}")))?;

    // All entered scores for the scope, keyed per subject and student.
    let mut stmt = conn
        .prepare(
            "SELECT subject_id, student_id, component_id, sub_component_id, score
             FROM score_entries
             WHERE session_id = ?1 AND class_id = ?2 AND class_arm_id = ?3 AND term_id = ?4",
        )
        .map_err(|e| CalcError::new("db_query_failed", &format!("prepare scores: {e}")))?;
    let score_rows = stmt
        .query_map(
            params![ctx.session_id, ctx.class_id, ctx.class_arm_id, ctx.term_id],
            |row| {
                let subject_id: String = row.get(0)?;
                let student_id: String = row.get(1)?;
                let component_id: String = row.get(2)?;
                let sub_component_id: String = row.get(3)?;
                let score: f64 = row.get(4)?;
                Ok((subject_id, student_id, component_id, sub_component_id, score))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", &format!("load scores: {e}")))?;
    let mut score_maps: HashMap<(String, String), ScoreMap> = HashMap::new();
    for (subject_id, student_id, component_id, sub_component_id, score) in score_rows {
        let key = ComponentRef {
            component_id,
            sub_component_id: if sub_component_id.is_empty() {
                None
            } else {
                Some(sub_component_id)
            },
        };
        score_maps
            .entry((subject_id, student_id))
            .or_default()
            .insert(key, score);
    }

    let grading_system = load_grading_scheme_for_class(conn, ctx.class_id)?;
    let empty_map = ScoreMap::new();

    let overall_obtainable = obtainable * subjects.len() as f64;
    let mut results: Vec<StudentResult> = Vec::with_capacity(students.len());
    let mut totals: Vec<f64> = Vec::with_capacity(students.len());
    for student in &students {
        let mut subject_results: Vec<SubjectResult> = Vec::with_capacity(subjects.len());
        let mut total_score = 0.0;
        for subject in &subjects {
            let scores = score_maps
                .get(&(subject.id.clone(), student.id.clone()))
                .unwrap_or(&empty_map);
            let component_scores = leaf_refs
                .iter()
                .map(|(key, _)| ComponentScore {
                    key: key.clone(),
                    score: scores.get(key).copied().unwrap_or(0.0),
                })
                .collect();
            let total = subject_total(&scheme, scores);
            let pct = round2(percentage(total, obtainable));
            let band = grading_system.as_ref().and_then(|g| grade(pct, g));
            subject_results.push(SubjectResult {
                subject_id: subject.id.clone(),
                subject_name: subject.name.clone(),
                component_scores,
                total,
                percentage: pct,
                grade: band.map(|b| SubjectGrade {
                    name: b.name.clone(),
                    remark: b.remark.clone(),
                }),
            });
            total_score += total;
        }
        let pct = round2(percentage(total_score, overall_obtainable));
        let band = grading_system.as_ref().and_then(|g| grade(pct, g));
        totals.push(total_score);
        results.push(StudentResult {
            student_id: student.id.clone(),
            student_name: format!("{} {}", student.last_name, student.first_name),
            admission_no: student.admission_no.clone(),
            subjects: subject_results,
            total_score,
            total_obtainable: overall_obtainable,
            percentage: pct,
            grade: band.map(|b| OverallGrade {
                name: b.name.clone(),
                remark: b.remark.clone(),
                teacher_comment: b.teacher_comment.clone(),
                principal_comment: b.principal_comment.clone(),
            }),
        });
    }

    let stats = class_stats(&totals);
    let default_title = format!(
        "{} {} {} {}",
        class_name, class_arm_name, term_name, session_name
    );
    Ok(ResultBatchModel {
        batch: BatchMeta {
            id: Uuid::new_v4().to_string(),
            title: title
                .map(|t| t.to_string())
                .filter(|t| !t.is_empty())
                .unwrap_or(default_title),
            session_id: ctx.session_id.to_string(),
            session_name,
            class_id: ctx.class_id.to_string(),
            class_name,
            class_arm_id: ctx.class_arm_id.to_string(),
            class_arm_name,
            term_id: ctx.term_id.to_string(),
            term_name,
            generated_at: chrono::Utc::now().to_rfc3339(),
        },
        scheme: SchemeStructure {
            components: scheme.components,
            columns,
            total_obtainable: obtainable,
        },
        subjects,
        students: results,
        class_stats: stats,
        grading_system,
    })
}

fn require_name(
    conn: &Connection,
    sql: &str,
    id: &str,
    what: &str,
) -> Result<String, CalcError> {
    let name: Option<String> = conn
        .query_row(sql, params![id], |row| row.get(0))
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", &format!("load {what}: {e}")))?;
    name.ok_or_else(|| CalcError::new("not_found", &format!("{what} {id} not found")))
}
