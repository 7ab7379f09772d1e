use crate::calc::{self, ScoreMap, SubjectInfo};
use crate::scheme::{ComponentRef, MarkingScheme};
use crate::store::{ScoreEntry, ScoreScope, ScoreStore, StoreError, TermScope};
use serde::Serialize;
use std::collections::HashMap;

/// Score entry runs in one of two modes. Subject mode edits one subject
/// for the whole class arm and submits everything in one call. Class
/// mode walks student by student across every subject and submits one
/// subject at a time. Both machines talk to the store through the
/// `ScoreStore` trait and never cache across a reload.

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterStudent {
    pub id: String,
    pub display_name: String,
}

#[derive(Debug)]
pub struct EntryError {
    pub code: &'static str,
    pub message: String,
}

impl EntryError {
    pub fn new(code: &'static str, message: &str) -> EntryError {
        EntryError {
            code,
            message: message.to_string(),
        }
    }
}

impl From<StoreError> for EntryError {
    fn from(e: StoreError) -> EntryError {
        EntryError {
            code: e.code,
            message: e.message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Idle,
    Loaded,
    Editing,
    Submitting,
    Submitted,
}

impl EntryState {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryState::Idle => "idle",
            EntryState::Loaded => "loaded",
            EntryState::Editing => "editing",
            EntryState::Submitting => "submitting",
            EntryState::Submitted => "submitted",
        }
    }
}

/// Whole-subject editing for every student of a class arm.
pub struct SubjectEntry {
    pub scope: ScoreScope,
    pub scheme: MarkingScheme,
    pub students: Vec<RosterStudent>,
    pub state: EntryState,
    pub version: i64,
    pub last_error: Option<String>,
    cells: HashMap<(String, ComponentRef), f64>,
}

impl SubjectEntry {
    pub fn new(
        scope: ScoreScope,
        scheme: MarkingScheme,
        students: Vec<RosterStudent>,
    ) -> SubjectEntry {
        SubjectEntry {
            scope,
            scheme,
            students,
            state: EntryState::Idle,
            version: 0,
            last_error: None,
            cells: HashMap::new(),
        }
    }

    /// Drop any pending edits and take the store's current state. On a
    /// fetch error nothing changes, so a retry starts from the same place.
    pub fn reload(&mut self, store: &dyn ScoreStore) -> Result<(), EntryError> {
        let fetched = store.fetch_subject(&self.scope)?;
        self.cells.clear();
        for entry in fetched.entries {
            let key = ComponentRef {
                component_id: entry.component_id,
                sub_component_id: entry.sub_component_id,
            };
            self.cells.insert((entry.student_id, key), entry.score);
        }
        self.version = fetched.version;
        self.state = EntryState::Loaded;
        self.last_error = None;
        Ok(())
    }

    pub fn edit(
        &mut self,
        student_id: &str,
        key: &ComponentRef,
        score: f64,
    ) -> Result<(), EntryError> {
        match self.state {
            EntryState::Idle => {
                return Err(EntryError::new("invalid_state", "no scores loaded yet"));
            }
            EntryState::Submitting => {
                return Err(EntryError::new("invalid_state", "submission in progress"));
            }
            _ => {}
        }
        if !self.students.iter().any(|s| s.id == student_id) {
            return Err(EntryError::new(
                "not_found",
                &format!("student {student_id} is not in this class arm"),
            ));
        }
        let Some(max) = self.scheme.leaf_max(key) else {
            return Err(EntryError::new(
                "bad_params",
                "component is not an entry cell of the marking scheme",
            ));
        };
        if score < 0.0 || score > max {
            return Err(EntryError::new(
                "bad_params",
                &format!("score {score} is outside 0..{max}"),
            ));
        }
        self.cells
            .insert((student_id.to_string(), key.clone()), score);
        self.state = EntryState::Editing;
        Ok(())
    }

    /// One submission covering every student and every entry cell; cells
    /// never edited go in as zero. Success advances the version, failure
    /// returns to Editing with the edits intact for a manual retry.
    pub fn submit(&mut self, store: &dyn ScoreStore) -> Result<i64, EntryError> {
        if self.state == EntryState::Idle {
            return Err(EntryError::new("invalid_state", "no scores loaded yet"));
        }
        let payload = self.full_payload();
        if payload.is_empty() {
            return Err(EntryError::new(
                "bad_params",
                "nothing to submit: no students or no scheme components",
            ));
        }
        self.state = EntryState::Submitting;
        match store.submit_subject(&self.scope, &payload, Some(self.version)) {
            Ok(version) => {
                self.version = version;
                self.state = EntryState::Submitted;
                self.last_error = None;
                // The store now holds the payload verbatim, including the
                // zero fills; mirror that locally.
                self.cells.clear();
                for entry in payload {
                    let key = ComponentRef {
                        component_id: entry.component_id,
                        sub_component_id: entry.sub_component_id,
                    };
                    self.cells.insert((entry.student_id, key), entry.score);
                }
                Ok(version)
            }
            Err(e) => {
                self.state = EntryState::Editing;
                self.last_error = Some(e.message.clone());
                Err(e.into())
            }
        }
    }

    fn full_payload(&self) -> Vec<ScoreEntry> {
        let leaf_refs = self.scheme.leaf_refs();
        let mut payload = Vec::with_capacity(self.students.len() * leaf_refs.len());
        for student in &self.students {
            for (key, max) in &leaf_refs {
                let score = self
                    .cells
                    .get(&(student.id.clone(), key.clone()))
                    .copied()
                    .unwrap_or(0.0);
                payload.push(ScoreEntry {
                    student_id: student.id.clone(),
                    subject_id: self.scope.subject_id.clone(),
                    component_id: key.component_id.clone(),
                    sub_component_id: key.sub_component_id.clone(),
                    score,
                    max_score: *max,
                });
            }
        }
        payload
    }

    pub fn cell(&self, student_id: &str, key: &ComponentRef) -> Option<f64> {
        self.cells
            .get(&(student_id.to_string(), key.clone()))
            .copied()
    }

    pub fn student_score_map(&self, student_id: &str) -> ScoreMap {
        self.cells
            .iter()
            .filter(|((sid, _), _)| sid == student_id)
            .map(|((_, key), score)| (key.clone(), *score))
            .collect()
    }

    pub fn student_total(&self, student_id: &str) -> f64 {
        calc::subject_total(&self.scheme, &self.student_score_map(student_id))
    }

    /// Current cells in roster and scheme order, for rendering.
    pub fn entries(&self) -> Vec<ScoreEntry> {
        let leaf_refs = self.scheme.leaf_refs();
        let mut out = Vec::new();
        for student in &self.students {
            for (key, max) in &leaf_refs {
                if let Some(score) = self.cells.get(&(student.id.clone(), key.clone())) {
                    out.push(ScoreEntry {
                        student_id: student.id.clone(),
                        subject_id: self.scope.subject_id.clone(),
                        component_id: key.component_id.clone(),
                        sub_component_id: key.sub_component_id.clone(),
                        score: *score,
                        max_score: *max,
                    });
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassEntryState {
    Idle,
    StudentLoaded,
    Editing,
    Submitting,
    Submitted,
}

impl ClassEntryState {
    pub fn as_str(self) -> &'static str {
        match self {
            ClassEntryState::Idle => "idle",
            ClassEntryState::StudentLoaded => "studentLoaded",
            ClassEntryState::Editing => "editing",
            ClassEntryState::Submitting => "submitting",
            ClassEntryState::Submitted => "submitted",
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAck {
    pub subject_id: String,
    pub version: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedSubject {
    pub subject_id: String,
    pub code: &'static str,
    pub message: String,
}

/// What one class-mode submission pass achieved. Subjects already
/// written stay written even when a later one fails.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassSubmitOutcome {
    pub submitted: Vec<SubjectAck>,
    pub failed: Option<FailedSubject>,
}

/// Per-student editing across every subject of the class.
#[derive(Debug)]
pub struct ClassEntry {
    pub term: TermScope,
    pub scheme: MarkingScheme,
    pub subjects: Vec<SubjectInfo>,
    pub students: Vec<RosterStudent>,
    pub index: usize,
    pub state: ClassEntryState,
    pub last_error: Option<String>,
    versions: HashMap<String, i64>,
    cells: HashMap<(String, ComponentRef), f64>,
}

impl ClassEntry {
    pub fn new(
        term: TermScope,
        scheme: MarkingScheme,
        subjects: Vec<SubjectInfo>,
        students: Vec<RosterStudent>,
        start_index: usize,
    ) -> Result<ClassEntry, EntryError> {
        if students.is_empty() {
            return Err(EntryError::new("not_found", "class arm has no students"));
        }
        if start_index >= students.len() {
            return Err(EntryError::new(
                "bad_params",
                &format!("student index {start_index} out of range"),
            ));
        }
        Ok(ClassEntry {
            term,
            scheme,
            subjects,
            students,
            index: start_index,
            state: ClassEntryState::Idle,
            last_error: None,
            versions: HashMap::new(),
            cells: HashMap::new(),
        })
    }

    pub fn current_student(&self) -> Option<&RosterStudent> {
        self.students.get(self.index)
    }

    /// Fresh fetch for the current student. Pending edits are discarded;
    /// a fetch error leaves the machine untouched.
    pub fn reload(&mut self, store: &dyn ScoreStore) -> Result<(), EntryError> {
        let student_id = match self.current_student() {
            Some(s) => s.id.clone(),
            None => return Err(EntryError::new("invalid_state", "no current student")),
        };
        let fetched = store.fetch_student(&self.term, &student_id)?;
        self.cells.clear();
        for entry in fetched.entries {
            let key = ComponentRef {
                component_id: entry.component_id,
                sub_component_id: entry.sub_component_id,
            };
            self.cells.insert((entry.subject_id, key), entry.score);
        }
        self.versions = fetched
            .versions
            .into_iter()
            .map(|v| (v.subject_id, v.version))
            .collect();
        self.state = ClassEntryState::StudentLoaded;
        self.last_error = None;
        Ok(())
    }

    /// Move to the next student, always re-fetching from the store.
    /// Returns false at the end of the roster without moving.
    pub fn next(&mut self, store: &dyn ScoreStore) -> Result<bool, EntryError> {
        if self.index + 1 >= self.students.len() {
            return Ok(false);
        }
        let previous = self.index;
        self.index += 1;
        if let Err(e) = self.reload(store) {
            self.index = previous;
            return Err(e);
        }
        Ok(true)
    }

    pub fn previous(&mut self, store: &dyn ScoreStore) -> Result<bool, EntryError> {
        if self.index == 0 {
            return Ok(false);
        }
        let previous = self.index;
        self.index -= 1;
        if let Err(e) = self.reload(store) {
            self.index = previous;
            return Err(e);
        }
        Ok(true)
    }

    pub fn edit(
        &mut self,
        subject_id: &str,
        key: &ComponentRef,
        score: f64,
    ) -> Result<(), EntryError> {
        match self.state {
            ClassEntryState::Idle => {
                return Err(EntryError::new("invalid_state", "no student loaded yet"));
            }
            ClassEntryState::Submitting => {
                return Err(EntryError::new("invalid_state", "submission in progress"));
            }
            _ => {}
        }
        if !self.subjects.iter().any(|s| s.id == subject_id) {
            return Err(EntryError::new(
                "not_found",
                &format!("subject {subject_id} is not assigned to this class"),
            ));
        }
        let Some(max) = self.scheme.leaf_max(key) else {
            return Err(EntryError::new(
                "bad_params",
                "component is not an entry cell of the marking scheme",
            ));
        };
        if score < 0.0 || score > max {
            return Err(EntryError::new(
                "bad_params",
                &format!("score {score} is outside 0..{max}"),
            ));
        }
        self.cells
            .insert((subject_id.to_string(), key.clone()), score);
        self.state = ClassEntryState::Editing;
        Ok(())
    }

    /// Submit the current student's scores subject by subject, in the
    /// class's subject order. The pass stops at the first failure and
    /// keeps everything already written; there is no rollback.
    pub fn submit(&mut self, store: &dyn ScoreStore) -> Result<ClassSubmitOutcome, EntryError> {
        if self.state == ClassEntryState::Idle {
            return Err(EntryError::new("invalid_state", "no student loaded yet"));
        }
        let student_id = match self.current_student() {
            Some(s) => s.id.clone(),
            None => return Err(EntryError::new("invalid_state", "no current student")),
        };
        let leaf_refs = self.scheme.leaf_refs();
        if leaf_refs.is_empty() {
            return Err(EntryError::new(
                "bad_params",
                "marking scheme has no entry cells",
            ));
        }
        if self.subjects.is_empty() {
            return Err(EntryError::new(
                "bad_params",
                "no subjects assigned to this class",
            ));
        }

        self.state = ClassEntryState::Submitting;
        let mut submitted = Vec::new();
        let mut failed = None;
        for subject in &self.subjects {
            let scope = ScoreScope::new(&self.term, &subject.id);
            let payload: Vec<ScoreEntry> = leaf_refs
                .iter()
                .map(|(key, max)| ScoreEntry {
                    student_id: student_id.clone(),
                    subject_id: subject.id.clone(),
                    component_id: key.component_id.clone(),
                    sub_component_id: key.sub_component_id.clone(),
                    score: self
                        .cells
                        .get(&(subject.id.clone(), key.clone()))
                        .copied()
                        .unwrap_or(0.0),
                    max_score: *max,
                })
                .collect();
            let expected = self.versions.get(&subject.id).copied().unwrap_or(0);
            match store.submit_subject(&scope, &payload, Some(expected)) {
                Ok(version) => {
                    self.versions.insert(subject.id.clone(), version);
                    submitted.push(SubjectAck {
                        subject_id: subject.id.clone(),
                        version,
                    });
                }
                Err(e) => {
                    failed = Some(FailedSubject {
                        subject_id: subject.id.clone(),
                        code: e.code,
                        message: e.message,
                    });
                    break;
                }
            }
        }

        match &failed {
            Some(f) => {
                self.state = ClassEntryState::Editing;
                self.last_error = Some(f.message.clone());
            }
            None => {
                self.state = ClassEntryState::Submitted;
                self.last_error = None;
            }
        }
        Ok(ClassSubmitOutcome { submitted, failed })
    }

    pub fn subject_score_map(&self, subject_id: &str) -> ScoreMap {
        self.cells
            .iter()
            .filter(|((sid, _), _)| sid == subject_id)
            .map(|((_, key), score)| (key.clone(), *score))
            .collect()
    }

    pub fn subject_totals(&self) -> Vec<(String, f64)> {
        self.subjects
            .iter()
            .map(|s| {
                (
                    s.id.clone(),
                    calc::subject_total(&self.scheme, &self.subject_score_map(&s.id)),
                )
            })
            .collect()
    }

    pub fn overall_total(&self) -> f64 {
        calc::overall_total(self.subject_totals().into_iter().map(|(_, total)| total))
    }

    pub fn version_of(&self, subject_id: &str) -> i64 {
        self.versions.get(subject_id).copied().unwrap_or(0)
    }

    /// Current cells in subject and scheme order, for rendering.
    pub fn entries(&self) -> Vec<ScoreEntry> {
        let student_id = match self.current_student() {
            Some(s) => s.id.clone(),
            None => return Vec::new(),
        };
        let leaf_refs = self.scheme.leaf_refs();
        let mut out = Vec::new();
        for subject in &self.subjects {
            for (key, max) in &leaf_refs {
                if let Some(score) = self.cells.get(&(subject.id.clone(), key.clone())) {
                    out.push(ScoreEntry {
                        student_id: student_id.clone(),
                        subject_id: subject.id.clone(),
                        component_id: key.component_id.clone(),
                        sub_component_id: key.sub_component_id.clone(),
                        score: *score,
                        max_score: *max,
                    });
                }
            }
        }
        out
    }
}

/// Open entry sessions held by the daemon, keyed by an opaque id handed
/// to the client at open time.
#[derive(Default)]
pub struct EntrySessions {
    pub sessions: HashMap<String, EntrySession>,
}

pub enum EntrySession {
    Subject(SubjectEntry),
    Class(ClassEntry),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheme::{ComponentKind, MarkingComponent};
    use crate::store::{StudentScores, SubjectScores, SubjectVersion, TermScores};
    use std::cell::RefCell;
    use std::collections::HashSet;

    struct MemoryStore {
        inner: RefCell<MemoryInner>,
        fail_subjects: RefCell<HashSet<String>>,
    }

    #[derive(Default)]
    struct MemoryInner {
        entries: Vec<ScoreEntry>,
        versions: HashMap<String, i64>,
    }

    impl MemoryStore {
        fn new() -> MemoryStore {
            MemoryStore {
                inner: RefCell::new(MemoryInner::default()),
                fail_subjects: RefCell::new(HashSet::new()),
            }
        }

        fn fail_subject(&self, subject_id: &str) {
            self.fail_subjects.borrow_mut().insert(subject_id.to_string());
        }

        fn clear_failures(&self) {
            self.fail_subjects.borrow_mut().clear();
        }

        fn set_entry(&self, subject: &str, student: &str, component: &str, score: f64) {
            self.inner.borrow_mut().entries.push(ScoreEntry {
                student_id: student.to_string(),
                subject_id: subject.to_string(),
                component_id: component.to_string(),
                sub_component_id: None,
                score,
                max_score: 100.0,
            });
        }

        fn version(&self, subject: &str) -> i64 {
            self.inner
                .borrow()
                .versions
                .get(subject)
                .copied()
                .unwrap_or(0)
        }

        fn subject_entries(&self, subject: &str) -> Vec<ScoreEntry> {
            self.inner
                .borrow()
                .entries
                .iter()
                .filter(|e| e.subject_id == subject)
                .cloned()
                .collect()
        }
    }

    impl ScoreStore for MemoryStore {
        fn fetch_subject(&self, scope: &ScoreScope) -> Result<SubjectScores, StoreError> {
            let inner = self.inner.borrow();
            Ok(SubjectScores {
                entries: inner
                    .entries
                    .iter()
                    .filter(|e| e.subject_id == scope.subject_id)
                    .cloned()
                    .collect(),
                version: inner
                    .versions
                    .get(&scope.subject_id)
                    .copied()
                    .unwrap_or(0),
            })
        }

        fn fetch_student(
            &self,
            _term: &TermScope,
            student_id: &str,
        ) -> Result<StudentScores, StoreError> {
            let inner = self.inner.borrow();
            Ok(StudentScores {
                entries: inner
                    .entries
                    .iter()
                    .filter(|e| e.student_id == student_id)
                    .cloned()
                    .collect(),
                versions: inner
                    .versions
                    .iter()
                    .map(|(subject_id, version)| SubjectVersion {
                        subject_id: subject_id.clone(),
                        version: *version,
                    })
                    .collect(),
            })
        }

        fn fetch_term(&self, _term: &TermScope) -> Result<TermScores, StoreError> {
            let inner = self.inner.borrow();
            Ok(TermScores {
                entries: inner.entries.clone(),
                versions: inner
                    .versions
                    .iter()
                    .map(|(subject_id, version)| SubjectVersion {
                        subject_id: subject_id.clone(),
                        version: *version,
                    })
                    .collect(),
            })
        }

        fn submit_subject(
            &self,
            scope: &ScoreScope,
            entries: &[ScoreEntry],
            expected_version: Option<i64>,
        ) -> Result<i64, StoreError> {
            if self.fail_subjects.borrow().contains(&scope.subject_id) {
                return Err(StoreError::new("remote_unavailable", "store offline"));
            }
            let mut inner = self.inner.borrow_mut();
            let current = inner
                .versions
                .get(&scope.subject_id)
                .copied()
                .unwrap_or(0);
            if let Some(expected) = expected_version {
                if expected != current {
                    return Err(StoreError::new("conflict", "version mismatch"));
                }
            }
            let students: HashSet<&str> =
                entries.iter().map(|e| e.student_id.as_str()).collect();
            inner.entries.retain(|e| {
                e.subject_id != scope.subject_id || !students.contains(e.student_id.as_str())
            });
            inner.entries.extend(entries.iter().cloned());
            let next = current + 1;
            inner.versions.insert(scope.subject_id.clone(), next);
            Ok(next)
        }
    }

    fn leaf(id: &str, name: &str, kind: ComponentKind, max: f64) -> MarkingComponent {
        MarkingComponent {
            id: id.to_string(),
            name: name.to_string(),
            kind,
            max_score: max,
            sub_components: Vec::new(),
        }
    }

    fn demo_scheme() -> MarkingScheme {
        let mut ca1 = leaf("ca1", "CA1", ComponentKind::Ca, 20.0);
        ca1.sub_components = vec![
            leaf("t1", "Test 1", ComponentKind::Ca, 10.0),
            leaf("t2", "Test 2", ComponentKind::Ca, 10.0),
        ];
        MarkingScheme {
            id: "ms".to_string(),
            class_id: "jss1".to_string(),
            term_id: "term1".to_string(),
            components: vec![ca1, leaf("exam", "Exam", ComponentKind::Exam, 80.0)],
        }
    }

    fn term() -> TermScope {
        TermScope {
            session_id: "sess".to_string(),
            class_id: "jss1".to_string(),
            class_arm_id: "jss1a".to_string(),
            term_id: "term1".to_string(),
        }
    }

    fn roster() -> Vec<RosterStudent> {
        vec![
            RosterStudent {
                id: "st1".to_string(),
                display_name: "Okafor Ada".to_string(),
            },
            RosterStudent {
                id: "st2".to_string(),
                display_name: "Bello Musa".to_string(),
            },
        ]
    }

    fn subjects() -> Vec<SubjectInfo> {
        vec![
            SubjectInfo {
                id: "math".to_string(),
                name: "Mathematics".to_string(),
            },
            SubjectInfo {
                id: "eng".to_string(),
                name: "English".to_string(),
            },
            SubjectInfo {
                id: "sci".to_string(),
                name: "Basic Science".to_string(),
            },
        ]
    }

    fn subject_machine() -> SubjectEntry {
        SubjectEntry::new(
            ScoreScope::new(&term(), "math"),
            demo_scheme(),
            roster(),
        )
    }

    #[test]
    fn subject_mode_walks_the_states() {
        let store = MemoryStore::new();
        let mut entry = subject_machine();
        assert_eq!(entry.state, EntryState::Idle);
        assert_eq!(
            entry
                .edit("st1", &ComponentRef::top("exam"), 10.0)
                .unwrap_err()
                .code,
            "invalid_state"
        );

        entry.reload(&store).unwrap();
        assert_eq!(entry.state, EntryState::Loaded);
        entry.edit("st1", &ComponentRef::nested("ca1", "t1"), 8.0).unwrap();
        assert_eq!(entry.state, EntryState::Editing);
        entry.edit("st1", &ComponentRef::nested("ca1", "t2"), 9.0).unwrap();
        entry.edit("st1", &ComponentRef::top("exam"), 70.0).unwrap();

        let version = entry.submit(&store).unwrap();
        assert_eq!(version, 1);
        assert_eq!(entry.state, EntryState::Submitted);

        // 2 students x 3 entry cells, zero-filled for the untouched one.
        let written = store.subject_entries("math");
        assert_eq!(written.len(), 6);
        let st2_exam = written
            .iter()
            .find(|e| e.student_id == "st2" && e.component_id == "exam")
            .unwrap();
        assert_eq!(st2_exam.score, 0.0);
        let st1_total: f64 = written
            .iter()
            .filter(|e| e.student_id == "st1")
            .map(|e| e.score)
            .sum();
        assert_eq!(st1_total, 87.0);
    }

    #[test]
    fn subject_mode_rejects_bad_edits() {
        let store = MemoryStore::new();
        let mut entry = subject_machine();
        entry.reload(&store).unwrap();

        assert_eq!(
            entry
                .edit("ghost", &ComponentRef::top("exam"), 10.0)
                .unwrap_err()
                .code,
            "not_found"
        );
        // The composite itself is not an entry cell.
        assert_eq!(
            entry
                .edit("st1", &ComponentRef::top("ca1"), 10.0)
                .unwrap_err()
                .code,
            "bad_params"
        );
        assert_eq!(
            entry
                .edit("st1", &ComponentRef::top("exam"), 81.0)
                .unwrap_err()
                .code,
            "bad_params"
        );
        assert_eq!(
            entry
                .edit("st1", &ComponentRef::top("exam"), -1.0)
                .unwrap_err()
                .code,
            "bad_params"
        );
        assert_eq!(entry.state, EntryState::Loaded);
    }

    #[test]
    fn subject_mode_failure_keeps_edits_for_retry() {
        let store = MemoryStore::new();
        let mut entry = subject_machine();
        entry.reload(&store).unwrap();
        entry.edit("st1", &ComponentRef::top("exam"), 70.0).unwrap();

        store.fail_subject("math");
        let err = entry.submit(&store).unwrap_err();
        assert_eq!(err.code, "remote_unavailable");
        assert_eq!(entry.state, EntryState::Editing);
        assert!(entry.last_error.is_some());
        assert_eq!(entry.cell("st1", &ComponentRef::top("exam")), Some(70.0));

        store.clear_failures();
        entry.submit(&store).unwrap();
        assert_eq!(entry.state, EntryState::Submitted);
        assert_eq!(store.version("math"), 1);
    }

    #[test]
    fn subject_mode_conflict_then_reload_recovers() {
        let store = MemoryStore::new();
        let mut first = subject_machine();
        let mut second = subject_machine();
        first.reload(&store).unwrap();
        second.reload(&store).unwrap();

        first.edit("st1", &ComponentRef::top("exam"), 70.0).unwrap();
        first.submit(&store).unwrap();

        second.edit("st1", &ComponentRef::top("exam"), 10.0).unwrap();
        let err = second.submit(&store).unwrap_err();
        assert_eq!(err.code, "conflict");
        assert_eq!(second.state, EntryState::Editing);

        // The store still has the first writer's value.
        let exam = store
            .subject_entries("math")
            .into_iter()
            .find(|e| e.student_id == "st1" && e.component_id == "exam")
            .unwrap();
        assert_eq!(exam.score, 70.0);

        // Reload picks up the fresh state and clears the way.
        second.reload(&store).unwrap();
        assert_eq!(second.cell("st1", &ComponentRef::top("exam")), Some(70.0));
        second.edit("st1", &ComponentRef::top("exam"), 75.0).unwrap();
        second.submit(&store).unwrap();
        assert_eq!(store.version("math"), 3);
    }

    fn class_machine() -> ClassEntry {
        ClassEntry::new(term(), demo_scheme(), subjects(), roster(), 0).unwrap()
    }

    #[test]
    fn class_mode_submits_all_subjects_for_one_student() {
        let store = MemoryStore::new();
        let mut entry = class_machine();
        entry.reload(&store).unwrap();
        assert_eq!(entry.state, ClassEntryState::StudentLoaded);

        entry.edit("math", &ComponentRef::nested("ca1", "t1"), 8.0).unwrap();
        entry.edit("math", &ComponentRef::top("exam"), 70.0).unwrap();
        entry.edit("eng", &ComponentRef::top("exam"), 40.0).unwrap();
        assert_eq!(entry.state, ClassEntryState::Editing);

        let math_total = entry
            .subject_totals()
            .into_iter()
            .find(|(id, _)| id == "math")
            .map(|(_, t)| t)
            .unwrap();
        assert_eq!(math_total, 78.0);
        assert_eq!(entry.overall_total(), 118.0);

        let outcome = entry.submit(&store).unwrap();
        assert_eq!(outcome.submitted.len(), 3);
        assert!(outcome.failed.is_none());
        assert_eq!(entry.state, ClassEntryState::Submitted);

        // Every subject got the full component set for the student.
        for subject in ["math", "eng", "sci"] {
            let written = store.subject_entries(subject);
            assert_eq!(written.len(), 3, "{subject} should have 3 cells");
            assert!(written.iter().all(|e| e.student_id == "st1"));
        }
        let sci_total: f64 = store.subject_entries("sci").iter().map(|e| e.score).sum();
        assert_eq!(sci_total, 0.0);
    }

    #[test]
    fn class_mode_stops_at_first_failure_without_rollback() {
        let store = MemoryStore::new();
        let mut entry = class_machine();
        entry.reload(&store).unwrap();
        entry.edit("math", &ComponentRef::top("exam"), 70.0).unwrap();
        entry.edit("sci", &ComponentRef::top("exam"), 50.0).unwrap();

        store.fail_subject("eng");
        let outcome = entry.submit(&store).unwrap();
        assert_eq!(outcome.submitted.len(), 1);
        assert_eq!(outcome.submitted[0].subject_id, "math");
        let failed = outcome.failed.unwrap();
        assert_eq!(failed.subject_id, "eng");
        assert_eq!(entry.state, ClassEntryState::Editing);

        // Mathematics stayed written, science was never attempted.
        assert_eq!(store.version("math"), 1);
        assert_eq!(store.version("eng"), 0);
        assert_eq!(store.version("sci"), 0);

        // Retry finishes the remaining subjects without self-conflict.
        store.clear_failures();
        let outcome = entry.submit(&store).unwrap();
        assert!(outcome.failed.is_none());
        assert_eq!(outcome.submitted.len(), 3);
        assert_eq!(entry.state, ClassEntryState::Submitted);
        assert_eq!(store.version("math"), 2);
        assert_eq!(store.version("eng"), 1);
        let sci_exam = store
            .subject_entries("sci")
            .into_iter()
            .find(|e| e.component_id == "exam")
            .unwrap();
        assert_eq!(sci_exam.score, 50.0);
    }

    #[test]
    fn class_mode_navigation_always_refetches() {
        let store = MemoryStore::new();
        store.set_entry("math", "st2", "exam", 33.0);
        let mut entry = class_machine();
        entry.reload(&store).unwrap();

        // Unsubmitted edit for st1, then walk away and back.
        entry.edit("math", &ComponentRef::top("exam"), 70.0).unwrap();
        assert!(entry.next(&store).unwrap());
        assert_eq!(entry.current_student().unwrap().id, "st2");
        assert_eq!(entry.state, ClassEntryState::StudentLoaded);
        assert_eq!(
            entry.subject_score_map("math").get(&ComponentRef::top("exam")),
            Some(&33.0)
        );

        // Someone else updates st2 while we sit on it; going back and
        // forth must show the fresh value, not a cached one.
        store.set_entry("math", "st2", "t9", 1.0);
        assert!(entry.previous(&store).unwrap());
        assert_eq!(entry.current_student().unwrap().id, "st1");
        // The discarded edit did not survive the navigation.
        assert!(entry.subject_score_map("math").is_empty());

        assert!(entry.next(&store).unwrap());
        assert_eq!(entry.subject_score_map("math").len(), 2);

        // Boundaries do not move the cursor.
        assert!(!entry.next(&store).unwrap());
        assert_eq!(entry.current_student().unwrap().id, "st2");
        entry.previous(&store).unwrap();
        assert!(!entry.previous(&store).unwrap());
        assert_eq!(entry.current_student().unwrap().id, "st1");
    }

    #[test]
    fn class_mode_requires_students() {
        let err = ClassEntry::new(term(), demo_scheme(), subjects(), Vec::new(), 0).unwrap_err();
        assert_eq!(err.code, "not_found");
        let err = ClassEntry::new(term(), demo_scheme(), subjects(), roster(), 9).unwrap_err();
        assert_eq!(err.code, "bad_params");
    }
}
