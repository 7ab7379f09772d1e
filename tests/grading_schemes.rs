use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_scorebookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn scorebookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value.get("error").cloned().unwrap_or_else(|| json!({}))
}

fn waec_bands() -> serde_json::Value {
    json!([
        {
            "name": "A1",
            "scoreStartPoint": 75.0,
            "scoreEndPoint": 100.0,
            "remark": "Excellent",
            "teacherComment": "An outstanding result",
            "principalComment": "Keep it up"
        },
        { "name": "B2", "scoreStartPoint": 70.0, "scoreEndPoint": 74.99, "remark": "Very Good" },
        { "name": "C4", "scoreStartPoint": 50.0, "scoreEndPoint": 69.99, "remark": "Credit" },
        { "name": "F9", "scoreStartPoint": 0.0, "scoreEndPoint": 39.99, "remark": "Fail" }
    ])
}

fn assigned_ids(result: &serde_json::Value) -> Vec<String> {
    result
        .get("assignedClassIds")
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

#[test]
fn validate_flags_inverted_ranges_and_overlaps() {
    let workspace = temp_dir("scorebook-grading-validate");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grading.validate",
        json!({
            "grades": [
                { "name": "A", "scoreStartPoint": 80.0, "scoreEndPoint": 60.0 }
            ]
        }),
    );
    assert_eq!(result.get("valid").and_then(|v| v.as_bool()), Some(false));
    let findings = result
        .get("findings")
        .and_then(|v| v.as_array())
        .expect("findings");
    assert_eq!(
        findings[0].get("code").and_then(|v| v.as_str()),
        Some("inverted_range")
    );

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grading.validate",
        json!({
            "grades": [
                { "name": "A", "scoreStartPoint": 0.0, "scoreEndPoint": 50.0 },
                { "name": "B", "scoreStartPoint": 40.0, "scoreEndPoint": 100.0 }
            ]
        }),
    );
    assert_eq!(result.get("valid").and_then(|v| v.as_bool()), Some(false));
    let findings = result
        .get("findings")
        .and_then(|v| v.as_array())
        .expect("findings");
    assert_eq!(
        findings[0].get("code").and_then(|v| v.as_str()),
        Some("overlap")
    );

    // Touching end points are legal: 50 ends one band, 50.01 starts the next.
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "grading.validate",
        json!({ "grades": waec_bands() }),
    );
    assert_eq!(result.get("valid").and_then(|v| v.as_bool()), Some(true));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn create_list_get_update_roundtrip() {
    let workspace = temp_dir("scorebook-grading-crud");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let error = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "grading.create",
        json!({
            "name": "Broken",
            "grades": [
                { "name": "A", "scoreStartPoint": 0.0, "scoreEndPoint": 50.0 },
                { "name": "B", "scoreStartPoint": 40.0, "scoreEndPoint": 100.0 }
            ]
        }),
    );
    assert_eq!(
        error.get("code").and_then(|v| v.as_str()),
        Some("validation_failed")
    );

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grading.create",
        json!({ "name": "WAEC Standard", "grades": waec_bands() }),
    );
    let scheme_id = created
        .get("gradingSystem")
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .expect("scheme id")
        .to_string();

    let listed = request_ok(&mut stdin, &mut reader, "4", "grading.list", json!({}));
    let systems = listed
        .get("gradingSystems")
        .and_then(|v| v.as_array())
        .expect("gradingSystems");
    assert_eq!(systems.len(), 1);
    assert_eq!(
        systems[0].get("name").and_then(|v| v.as_str()),
        Some("WAEC Standard")
    );
    assert_eq!(systems[0].get("bandCount").and_then(|v| v.as_i64()), Some(4));

    let got = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "grading.get",
        json!({ "id": scheme_id }),
    );
    let grades = got
        .get("gradingSystem")
        .and_then(|v| v.get("grades"))
        .and_then(|v| v.as_array())
        .expect("grades");
    assert_eq!(grades.len(), 4);
    assert_eq!(grades[0].get("name").and_then(|v| v.as_str()), Some("A1"));
    assert_eq!(
        grades[0].get("teacherComment").and_then(|v| v.as_str()),
        Some("An outstanding result")
    );

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "grading.update",
        json!({
            "id": scheme_id,
            "name": "WAEC 2026",
            "grades": [
                { "name": "Pass", "scoreStartPoint": 50.0, "scoreEndPoint": 100.0 },
                { "name": "Fail", "scoreStartPoint": 0.0, "scoreEndPoint": 49.99 }
            ]
        }),
    );
    let system = updated.get("gradingSystem").expect("gradingSystem");
    assert_eq!(system.get("name").and_then(|v| v.as_str()), Some("WAEC 2026"));
    assert_eq!(
        system.get("grades").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(2)
    );

    let error = request_err(
        &mut stdin,
        &mut reader,
        "7",
        "grading.update",
        json!({ "id": scheme_id }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("bad_params"));

    let error = request_err(
        &mut stdin,
        &mut reader,
        "8",
        "grading.get",
        json!({ "id": "missing" }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("not_found"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn assign_classes_is_a_full_replace_and_moves_classes_between_schemes() {
    let workspace = temp_dir("scorebook-grading-assign");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class_a = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "JSS 1" }),
    )
    .get("classId")
    .and_then(|v| v.as_str())
    .expect("classId")
    .to_string();
    let class_b = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "classes.create",
        json!({ "name": "JSS 2" }),
    )
    .get("classId")
    .and_then(|v| v.as_str())
    .expect("classId")
    .to_string();

    let senior = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "grading.create",
        json!({ "name": "Senior", "grades": waec_bands() }),
    )
    .get("gradingSystem")
    .and_then(|v| v.get("id"))
    .and_then(|v| v.as_str())
    .expect("scheme id")
    .to_string();
    let junior = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "grading.create",
        json!({ "name": "Junior", "grades": waec_bands() }),
    )
    .get("gradingSystem")
    .and_then(|v| v.get("id"))
    .and_then(|v| v.as_str())
    .expect("scheme id")
    .to_string();

    let assigned = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "grading.assignClasses",
        json!({ "id": senior, "classIds": [class_a, class_b] }),
    );
    assert_eq!(assigned_ids(&assigned), vec![class_a.clone(), class_b.clone()]);

    // Same payload again: same outcome.
    let assigned = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "grading.assignClasses",
        json!({ "id": senior, "classIds": [class_a, class_b] }),
    );
    assert_eq!(assigned_ids(&assigned), vec![class_a.clone(), class_b.clone()]);

    // A class carries one scheme: assigning it elsewhere detaches it here.
    let assigned = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "grading.assignClasses",
        json!({ "id": junior, "classIds": [class_b] }),
    );
    assert_eq!(assigned_ids(&assigned), vec![class_b.clone()]);

    let got = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "grading.get",
        json!({ "id": senior }),
    );
    assert_eq!(assigned_ids(&got), vec![class_a.clone()]);

    // Empty set clears the assignments.
    let assigned = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "grading.assignClasses",
        json!({ "id": senior, "classIds": [] }),
    );
    assert!(assigned_ids(&assigned).is_empty());

    let error = request_err(
        &mut stdin,
        &mut reader,
        "11",
        "grading.assignClasses",
        json!({ "id": senior, "classIds": ["missing"] }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("not_found"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
