use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("scorebook.sqlite3");
    let conn = Connection::open(db_path)?;
    // Bounded wait when another process holds the workspace file.
    conn.busy_timeout(Duration::from_secs(5))?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS terms(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            sort_order INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            sort_order INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_arms(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            UNIQUE(class_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_arms_class ON class_arms(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_subjects(
            class_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            PRIMARY KEY(class_id, subject_id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_subjects_class ON class_subjects(class_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_arm_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            admission_no TEXT NOT NULL DEFAULT '',
            active INTEGER NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(class_arm_id) REFERENCES class_arms(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_arm_sort ON students(class_arm_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS marking_schemes(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            term_id TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(term_id) REFERENCES terms(id),
            UNIQUE(class_id, term_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS marking_components(
            id TEXT PRIMARY KEY,
            scheme_id TEXT NOT NULL,
            parent_id TEXT,
            name TEXT NOT NULL,
            kind TEXT NOT NULL CHECK(kind IN ('ca','exam')),
            max_score REAL NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(scheme_id) REFERENCES marking_schemes(id),
            FOREIGN KEY(parent_id) REFERENCES marking_components(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marking_components_scheme ON marking_components(scheme_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grading_schemes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_bands(
            id TEXT PRIMARY KEY,
            grading_scheme_id TEXT NOT NULL,
            name TEXT NOT NULL,
            score_start_point REAL NOT NULL,
            score_end_point REAL NOT NULL,
            remark TEXT NOT NULL DEFAULT '',
            teacher_comment TEXT NOT NULL DEFAULT '',
            principal_comment TEXT NOT NULL DEFAULT '',
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(grading_scheme_id) REFERENCES grading_schemes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_bands_scheme ON grade_bands(grading_scheme_id, sort_order)",
        [],
    )?;

    // One grading scheme per class; re-assignment moves the class.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grading_scheme_classes(
            class_id TEXT PRIMARY KEY,
            grading_scheme_id TEXT NOT NULL,
            assigned_at TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(grading_scheme_id) REFERENCES grading_schemes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grading_scheme_classes_scheme ON grading_scheme_classes(grading_scheme_id)",
        [],
    )?;

    // sub_component_id uses '' instead of NULL so the UNIQUE key holds.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS score_entries(
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            class_arm_id TEXT NOT NULL,
            term_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            component_id TEXT NOT NULL,
            sub_component_id TEXT NOT NULL DEFAULT '',
            score REAL NOT NULL,
            max_score REAL NOT NULL,
            UNIQUE(session_id, class_id, class_arm_id, term_id, subject_id,
                   student_id, component_id, sub_component_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_score_entries_scope ON score_entries(
            session_id, class_id, class_arm_id, term_id, subject_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_score_entries_student ON score_entries(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS score_scope_versions(
            session_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            class_arm_id TEXT NOT NULL,
            term_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY(session_id, class_id, class_arm_id, term_id, subject_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS result_batches(
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            class_arm_id TEXT NOT NULL,
            term_id TEXT NOT NULL,
            title TEXT NOT NULL,
            generated_at TEXT NOT NULL,
            snapshot TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_result_batches_scope ON result_batches(
            session_id, class_id, class_arm_id, term_id)",
        [],
    )?;

    Ok(())
}
