use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_str, require_row};
use crate::ipc::types::{AppState, Request};
use crate::scheme::{
    self, AssessmentComponentDef, ComponentKind, MarkingComponent, MarkingScheme,
};
use rusqlite::params;
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ComponentInput {
    #[serde(default)]
    id: Option<String>,
    name: String,
    kind: String,
    max_score: f64,
    #[serde(default)]
    sub_components: Vec<SubComponentInput>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubComponentInput {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    kind: Option<String>,
    max_score: f64,
    /// Present only to catch deeper nesting in the payload.
    #[serde(default)]
    sub_components: Option<serde_json::Value>,
}

fn parse_components(
    req: &Request,
) -> Result<Vec<MarkingComponent>, serde_json::Value> {
    let raw = match req.params.get("components") {
        Some(v) => v.clone(),
        None => {
            return Err(err(
                &req.id,
                "bad_params",
                "missing params.components",
                None,
            ))
        }
    };
    let inputs: Vec<ComponentInput> = serde_json::from_value(raw).map_err(|e| {
        err(
            &req.id,
            "bad_params",
            format!("params.components: {e}"),
            None,
        )
    })?;

    let mut components = Vec::with_capacity(inputs.len());
    let mut ids = std::collections::HashSet::new();
    for input in inputs {
        let name = input.name.trim().to_string();
        if name.is_empty() {
            return Err(err(
                &req.id,
                "bad_params",
                "component name must not be blank",
                None,
            ));
        }
        let Some(kind) = ComponentKind::parse(&input.kind) else {
            return Err(err(
                &req.id,
                "bad_params",
                format!("{name}: kind must be 'ca' or 'exam'"),
                None,
            ));
        };
        if !input.max_score.is_finite() || input.max_score < 0.0 {
            return Err(err(
                &req.id,
                "bad_params",
                format!("{name}: maxScore must be a non-negative number"),
                None,
            ));
        }
        let id = input
            .id
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if !ids.insert(id.clone()) {
            return Err(err(
                &req.id,
                "bad_params",
                format!("duplicate component id {id}"),
                None,
            ));
        }

        let mut sub_components = Vec::with_capacity(input.sub_components.len());
        for sub in input.sub_components {
            let sub_name = sub.name.trim().to_string();
            if sub_name.is_empty() {
                return Err(err(
                    &req.id,
                    "bad_params",
                    format!("{name}: sub-component name must not be blank"),
                    None,
                ));
            }
            if sub
                .sub_components
                .as_ref()
                .map(|v| !v.is_null())
                .unwrap_or(false)
            {
                return Err(err(
                    &req.id,
                    "bad_params",
                    format!("{sub_name}: sub-components cannot be nested further"),
                    None,
                ));
            }
            let sub_kind = match &sub.kind {
                None => kind,
                Some(raw) => match ComponentKind::parse(raw) {
                    Some(k) => k,
                    None => {
                        return Err(err(
                            &req.id,
                            "bad_params",
                            format!("{sub_name}: kind must be 'ca' or 'exam'"),
                            None,
                        ))
                    }
                },
            };
            if !sub.max_score.is_finite() || sub.max_score < 0.0 {
                return Err(err(
                    &req.id,
                    "bad_params",
                    format!("{sub_name}: maxScore must be a non-negative number"),
                    None,
                ));
            }
            let sub_id = sub
                .id
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            if !ids.insert(sub_id.clone()) {
                return Err(err(
                    &req.id,
                    "bad_params",
                    format!("duplicate component id {sub_id}"),
                    None,
                ));
            }
            sub_components.push(MarkingComponent {
                id: sub_id,
                name: sub_name,
                kind: sub_kind,
                max_score: sub.max_score,
                sub_components: Vec::new(),
            });
        }

        components.push(MarkingComponent {
            id,
            name,
            kind,
            max_score: input.max_score,
            sub_components,
        });
    }
    Ok(components)
}

fn scheme_result(scheme: &MarkingScheme) -> serde_json::Value {
    json!({
        "markingScheme": {
            "id": scheme.id,
            "classId": scheme.class_id,
            "termId": scheme.term_id,
            "components": scheme.components,
        },
        "totalObtainable": scheme.total_obtainable(),
        "columns": scheme::layout(scheme),
        "warnings": scheme::scheme_warnings(&scheme.components),
    })
}

fn handle_scheme_get(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    match calc::load_marking_scheme(conn, class_id, term_id) {
        Ok(scheme) => ok(&req.id, scheme_result(&scheme)),
        Err(e) => err(&req.id, e.code, e.message, e.details),
    }
}

fn write_scheme(
    conn: &rusqlite::Connection,
    req: &Request,
    class_id: &str,
    term_id: &str,
    components: &[MarkingComponent],
) -> Result<String, serde_json::Value> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| err(&req.id, "db_tx_failed", format!("{e}"), None))?;

    use rusqlite::OptionalExtension;
    let existing: Option<String> = tx
        .query_row(
            "SELECT id FROM marking_schemes WHERE class_id = ?1 AND term_id = ?2",
            params![class_id, term_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", format!("{e}"), None))?;
    let scheme_id = match existing {
        Some(id) => {
            tx.execute(
                "DELETE FROM marking_components WHERE scheme_id = ?1",
                params![id],
            )
            .map_err(|e| err(&req.id, "db_update_failed", format!("{e}"), None))?;
            id
        }
        None => {
            let id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO marking_schemes (id, class_id, term_id) VALUES (?1, ?2, ?3)",
                params![id, class_id, term_id],
            )
            .map_err(|e| err(&req.id, "db_insert_failed", format!("{e}"), None))?;
            id
        }
    };

    for (idx, comp) in components.iter().enumerate() {
        tx.execute(
            "INSERT INTO marking_components (id, scheme_id, parent_id, name, kind, max_score, sort_order)
             VALUES (?1, ?2, NULL, ?3, ?4, ?5, ?6)",
            params![
                comp.id,
                scheme_id,
                comp.name,
                comp.kind.as_str(),
                comp.max_score,
                idx as i64
            ],
        )
        .map_err(|e| err(&req.id, "db_insert_failed", format!("{e}"), None))?;
        for (sub_idx, sub) in comp.sub_components.iter().enumerate() {
            tx.execute(
                "INSERT INTO marking_components (id, scheme_id, parent_id, name, kind, max_score, sort_order)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    sub.id,
                    scheme_id,
                    comp.id,
                    sub.name,
                    sub.kind.as_str(),
                    sub.max_score,
                    sub_idx as i64
                ],
            )
            .map_err(|e| err(&req.id, "db_insert_failed", format!("{e}"), None))?;
        }
    }

    tx.commit()
        .map_err(|e| err(&req.id, "db_tx_failed", format!("{e}"), None))?;
    Ok(scheme_id)
}

/// Whole-scheme replace. Component ids supplied by the client survive the
/// save, so existing score entries keep pointing at the same cells.
fn handle_scheme_save(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let components = match parse_components(req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let scheme_id = match write_scheme(conn, req, class_id, term_id, &components) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let scheme = MarkingScheme {
        id: scheme_id,
        class_id: class_id.to_string(),
        term_id: term_id.to_string(),
        components,
    };
    info!(
        class = class_id,
        term = term_id,
        components = scheme.components.len(),
        obtainable = scheme.total_obtainable(),
        "marking scheme saved"
    );
    ok(&req.id, scheme_result(&scheme))
}

/// Replace the sub-assessments of one component. The allocations may not
/// exceed the component's declared ceiling; matching it exactly is not
/// required.
fn handle_assessment_scheme_save(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let component_id = match required_str(req, "componentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let defs: Vec<AssessmentComponentDef> = match req.params.get("components") {
        Some(v) => match serde_json::from_value(v.clone()) {
            Ok(d) => d,
            Err(e) => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("params.components: {e}"),
                    None,
                )
            }
        },
        None => return err(&req.id, "bad_params", "missing params.components", None),
    };
    for def in &defs {
        if def.name.trim().is_empty() {
            return err(
                &req.id,
                "bad_params",
                "sub-assessment name must not be blank",
                None,
            );
        }
    }

    let mut scheme = match calc::load_marking_scheme(conn, class_id, term_id) {
        Ok(s) => s,
        Err(e) => return err(&req.id, e.code, e.message, e.details),
    };
    let Some(component) = scheme
        .components
        .iter_mut()
        .find(|c| c.id == component_id)
    else {
        return err(
            &req.id,
            "not_found",
            format!("component {component_id} not found in marking scheme"),
            None,
        );
    };

    let findings = scheme::validate_assessment_scheme(component.max_score, &defs);
    if !findings.is_empty() {
        return err(
            &req.id,
            "validation_failed",
            "sub-assessment allocations are invalid",
            Some(json!({ "findings": findings })),
        );
    }

    let kind = component.kind;
    component.sub_components = defs
        .iter()
        .map(|def| MarkingComponent {
            id: Uuid::new_v4().to_string(),
            name: def.name.trim().to_string(),
            kind,
            max_score: def.score,
            sub_components: Vec::new(),
        })
        .collect();
    let target_score = component.max_score;
    let total_allocated: f64 = defs.iter().map(|d| d.score).sum();
    let new_children = component.sub_components.clone();

    if let Err(resp) = write_scheme(conn, req, class_id, term_id, &scheme.components) {
        return resp;
    }

    ok(
        &req.id,
        json!({
            "componentId": component_id,
            "targetScore": target_score,
            "totalAllocated": total_allocated,
            "components": new_children,
            "warnings": scheme::scheme_warnings(&scheme.components),
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "markingScheme.get" => Some(handle_scheme_get(state, req)),
        "markingScheme.save" => Some(handle_scheme_save(state, req)),
        "assessmentScheme.save" => Some(handle_assessment_scheme_save(state, req)),
        _ => None,
    }
}
