use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Marking and grading scheme model. Everything in here is pure data and
/// arithmetic over it; persistence and transport live elsewhere.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Ca,
    Exam,
}

impl ComponentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ComponentKind::Ca => "ca",
            ComponentKind::Exam => "exam",
        }
    }

    pub fn parse(raw: &str) -> Option<ComponentKind> {
        match raw {
            "ca" => Some(ComponentKind::Ca),
            "exam" => Some(ComponentKind::Exam),
            _ => None,
        }
    }
}

/// One node of the marking scheme tree. A component is a leaf when
/// `sub_components` is empty; otherwise it is a composite and its own
/// score is never entered directly, only derived from the children.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkingComponent {
    pub id: String,
    pub name: String,
    pub kind: ComponentKind,
    /// Declared ceiling. For composites this is advisory; entry and
    /// aggregation use the leaf ceilings.
    pub max_score: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_components: Vec<MarkingComponent>,
}

impl MarkingComponent {
    pub fn is_composite(&self) -> bool {
        !self.sub_components.is_empty()
    }

    /// Ceiling actually reachable through score entry: the declared max
    /// for a leaf, the sum of child effective maxes for a composite.
    pub fn effective_max(&self) -> f64 {
        if self.sub_components.is_empty() {
            self.max_score
        } else {
            self.sub_components.iter().map(|c| c.effective_max()).sum()
        }
    }
}

/// Key of a score cell. Top-level leaves are addressed by component id
/// alone; leaves nested under a composite carry the parent id plus their
/// own id. No string mashing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentRef {
    pub component_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_component_id: Option<String>,
}

impl ComponentRef {
    pub fn top(component_id: &str) -> ComponentRef {
        ComponentRef {
            component_id: component_id.to_string(),
            sub_component_id: None,
        }
    }

    pub fn nested(component_id: &str, sub_component_id: &str) -> ComponentRef {
        ComponentRef {
            component_id: component_id.to_string(),
            sub_component_id: Some(sub_component_id.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkingScheme {
    pub id: String,
    pub class_id: String,
    pub term_id: String,
    pub components: Vec<MarkingComponent>,
}

impl MarkingScheme {
    /// Scheme for a (class, term) with nothing configured yet. Aggregation
    /// over it yields zeros instead of errors.
    pub fn empty(class_id: &str, term_id: &str) -> MarkingScheme {
        MarkingScheme {
            id: String::new(),
            class_id: class_id.to_string(),
            term_id: term_id.to_string(),
            components: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn total_obtainable(&self) -> f64 {
        self.components.iter().map(|c| c.effective_max()).sum()
    }

    /// Entry cells of the scheme in display order, with their ceilings.
    pub fn leaf_refs(&self) -> Vec<(ComponentRef, f64)> {
        let mut out = Vec::new();
        for comp in &self.components {
            if comp.sub_components.is_empty() {
                out.push((ComponentRef::top(&comp.id), comp.max_score));
            } else {
                for sub in &comp.sub_components {
                    out.push((ComponentRef::nested(&comp.id, &sub.id), sub.max_score));
                }
            }
        }
        out
    }

    /// Ceiling for one entry cell, or None when the key does not name a
    /// leaf of this scheme.
    pub fn leaf_max(&self, key: &ComponentRef) -> Option<f64> {
        let comp = self
            .components
            .iter()
            .find(|c| c.id == key.component_id)?;
        match &key.sub_component_id {
            None => {
                if comp.sub_components.is_empty() {
                    Some(comp.max_score)
                } else {
                    None
                }
            }
            Some(sub_id) => comp
                .sub_components
                .iter()
                .find(|s| &s.id == sub_id)
                .map(|s| s.max_score),
        }
    }
}

/// One column of the entry grid / report header. Derived from the scheme
/// alone so every surface renders the same shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderColumn {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub component_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_component_id: Option<String>,
    pub max_score: f64,
}

/// Flatten a scheme into its entry columns: leaves in scheme order,
/// nested leaves grouped under their composite's name.
pub fn layout(scheme: &MarkingScheme) -> Vec<HeaderColumn> {
    let mut columns = Vec::new();
    for comp in &scheme.components {
        if comp.sub_components.is_empty() {
            columns.push(HeaderColumn {
                label: comp.name.clone(),
                group: None,
                component_id: comp.id.clone(),
                sub_component_id: None,
                max_score: comp.max_score,
            });
        } else {
            for sub in &comp.sub_components {
                columns.push(HeaderColumn {
                    label: sub.name.clone(),
                    group: Some(comp.name.clone()),
                    component_id: comp.id.clone(),
                    sub_component_id: Some(sub.id.clone()),
                    max_score: sub.max_score,
                });
            }
        }
    }
    columns
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemeWarning {
    pub code: &'static str,
    pub message: String,
    pub component_id: String,
}

/// Non-blocking configuration checks. A composite whose declared max
/// disagrees with the sum of its children is flagged, never rejected.
pub fn scheme_warnings(components: &[MarkingComponent]) -> Vec<SchemeWarning> {
    let mut warnings = Vec::new();
    for comp in components {
        if comp.sub_components.is_empty() {
            continue;
        }
        let child_sum: f64 = comp.sub_components.iter().map(|s| s.max_score).sum();
        if (child_sum - comp.max_score).abs() > f64::EPSILON {
            warnings.push(SchemeWarning {
                code: "composite_max_mismatch",
                message: format!(
                    "{}: declared max {} but sub-components sum to {}",
                    comp.name, comp.max_score, child_sum
                ),
                component_id: comp.id.clone(),
            });
        }
    }
    warnings
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBand {
    pub name: String,
    pub score_start_point: f64,
    pub score_end_point: f64,
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub teacher_comment: String,
    #[serde(default)]
    pub principal_comment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingScheme {
    pub id: String,
    pub name: String,
    pub grades: Vec<GradeBand>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BandFinding {
    pub code: &'static str,
    pub message: String,
    pub band: String,
}

/// Structural checks over a band set: every band must span a real range
/// and, taken in ascending order of start point, bands must not overlap.
/// Gaps are allowed; lookup reports them as "no grade".
pub fn validate_bands(grades: &[GradeBand]) -> Vec<BandFinding> {
    let mut findings = Vec::new();
    for band in grades {
        if band.score_end_point <= band.score_start_point {
            findings.push(BandFinding {
                code: "inverted_range",
                message: format!(
                    "{}: end point {} must be greater than start point {}",
                    band.name, band.score_end_point, band.score_start_point
                ),
                band: band.name.clone(),
            });
        }
    }
    let mut sorted: Vec<&GradeBand> = grades.iter().collect();
    sorted.sort_by(|a, b| cmp_f64(a.score_start_point, b.score_start_point));
    for pair in sorted.windows(2) {
        let (lo, hi) = (pair[0], pair[1]);
        if lo.score_end_point > hi.score_start_point {
            findings.push(BandFinding {
                code: "overlap",
                message: format!(
                    "{} (ends {}) overlaps {} (starts {})",
                    lo.name, lo.score_end_point, hi.name, hi.score_start_point
                ),
                band: hi.name.clone(),
            });
        }
    }
    findings
}

/// First band, in ascending start order, whose inclusive range contains
/// the percentage. Overlaps resolve to the lower band; values falling in
/// a gap resolve to None.
pub fn lookup_band<'a>(grades: &'a [GradeBand], percentage: f64) -> Option<&'a GradeBand> {
    let mut sorted: Vec<&GradeBand> = grades.iter().collect();
    sorted.sort_by(|a, b| cmp_f64(a.score_start_point, b.score_start_point));
    sorted
        .into_iter()
        .find(|b| b.score_start_point <= percentage && percentage <= b.score_end_point)
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentComponentDef {
    pub name: String,
    pub score: f64,
}

/// Assessment sub-scheme check: allocations may not exceed the parent
/// component's ceiling. Under-allocation is allowed.
pub fn validate_assessment_scheme(
    target_score: f64,
    components: &[AssessmentComponentDef],
) -> Vec<BandFinding> {
    let mut findings = Vec::new();
    for def in components {
        if def.score < 0.0 {
            findings.push(BandFinding {
                code: "negative_score",
                message: format!("{}: allocation must not be negative", def.name),
                band: def.name.clone(),
            });
        }
    }
    let total: f64 = components.iter().map(|d| d.score).sum();
    if total > target_score {
        findings.push(BandFinding {
            code: "exceeds_target",
            message: format!(
                "allocations sum to {} which exceeds the target of {}",
                total, target_score
            ),
            band: String::new(),
        });
    }
    findings
}
