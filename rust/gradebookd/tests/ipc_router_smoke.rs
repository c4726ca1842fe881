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
    let exe = env!("CARGO_BIN_EXE_gradebookd");
    let mut child = Command::new(exe)
        .env_remove("GRADEBOOKD_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradebookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn read_response(reader: &mut BufReader<ChildStdout>) -> serde_json::Value {
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response");
    serde_json::from_str(line.trim()).expect("parse response json")
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

    let value = read_response(reader);
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("gradebook-router-smoke");
    let bundle_out = workspace.join("smoke.gbbundle.zip");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health["ok"], json!(true));
    assert!(health["result"]["workspacePath"].is_null());

    // Workspace-bound methods refuse to run before a workspace is selected.
    let early = request(
        &mut stdin,
        &mut reader,
        "2",
        "grades.sheet",
        json!({ "classId": "c1", "term": 1, "examType": "endterm" }),
    );
    assert_eq!(error_code(&early), "no_workspace");
    let listed = request(&mut stdin, &mut reader, "3", "classes.list", json!({}));
    assert_eq!(error_code(&listed), "no_workspace");

    let selected = request(
        &mut stdin,
        &mut reader,
        "4",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert_eq!(selected["ok"], json!(true));
    assert!(workspace.join("gradebook.sqlite3").is_file());

    let class = request(
        &mut stdin,
        &mut reader,
        "5",
        "classes.create",
        json!({ "name": "Grade 7 East", "curriculumType": "CBC" }),
    );
    let class_id = class["result"]["classId"]
        .as_str()
        .expect("classId")
        .to_string();
    let student = request(
        &mut stdin,
        &mut reader,
        "6",
        "students.create",
        json!({ "classId": class_id, "lastName": "Mwangi", "firstName": "Joy" }),
    );
    let student_id = student["result"]["studentId"]
        .as_str()
        .expect("studentId")
        .to_string();
    let subject = request(
        &mut stdin,
        &mut reader,
        "7",
        "subjects.create",
        json!({ "classId": class_id, "name": "Mathematics", "code": "MAT" }),
    );
    let subject_id = subject["result"]["subjectId"]
        .as_str()
        .expect("subjectId")
        .to_string();

    let cell = json!({
        "classId": class_id,
        "studentId": student_id,
        "subjectId": subject_id,
        "term": 1,
        "examType": "endterm",
    });
    let scope = json!({ "classId": class_id, "term": 1, "examType": "endterm" });
    let with = |extra: serde_json::Value| {
        let mut v = cell.clone();
        for (k, val) in extra.as_object().expect("object") {
            v[k] = val.clone();
        }
        v
    };

    let calls: Vec<(&str, serde_json::Value)> = vec![
        ("classes.list", json!({})),
        ("students.list", json!({ "classId": class_id })),
        ("subjects.list", json!({ "classId": class_id })),
        ("profiles.list", json!({})),
        ("profiles.get", json!({ "classId": class_id })),
        ("grades.sheet", scope.clone()),
        (
            "grades.setComponent",
            with(json!({ "component": "formative", "value": 72 })),
        ),
        ("grades.setRemarks", with(json!({ "remarks": "Steady" }))),
        (
            "grades.overrideLabel",
            with(json!({ "label": "EE", "isPrincipal": true })),
        ),
        ("grades.setStatus", with(json!({ "status": "draft" }))),
        ("calc.classStatistics", scope.clone()),
        (
            "calc.previewGrade",
            json!({ "curriculumType": "IGCSE", "componentScores": { "coursework": 70, "exam": 70 } }),
        ),
        (
            "reports.studentReport",
            json!({ "classId": class_id, "studentId": student_id, "term": 1, "examType": "endterm" }),
        ),
        (
            "backup.exportWorkspaceBundle",
            json!({ "outPath": bundle_out.to_string_lossy() }),
        ),
    ];
    for (i, (method, params)) in calls.into_iter().enumerate() {
        let _ = request(&mut stdin, &mut reader, &format!("r{}", i), method, params);
    }

    let unknown = {
        let payload = json!({ "id": "u1", "method": "grades.explode", "params": {} });
        writeln!(stdin, "{}", payload).expect("write request");
        stdin.flush().expect("flush request");
        read_response(&mut reader)
    };
    assert_eq!(unknown["id"], json!("u1"));
    assert_eq!(error_code(&unknown), "not_implemented");

    writeln!(stdin, "this is not json").expect("write garbage");
    stdin.flush().expect("flush garbage");
    let garbage = read_response(&mut reader);
    assert_eq!(garbage["ok"], json!(false));
    assert_eq!(error_code(&garbage), "bad_json");
    assert!(garbage.get("id").is_none());

    // Blank lines are skipped without a reply; the next request still lines up.
    writeln!(stdin).expect("write blank");
    let health = request(&mut stdin, &mut reader, "9", "health", json!({}));
    assert_eq!(
        health["result"]["workspacePath"],
        json!(workspace.to_string_lossy())
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn workspace_env_var_selects_workspace_on_start() {
    let workspace = temp_dir("gradebook-env-workspace");
    let exe = env!("CARGO_BIN_EXE_gradebookd");
    let mut child = Command::new(exe)
        .env("GRADEBOOKD_WORKSPACE", &workspace)
        .env("GRADEBOOKD_LOG", "debug")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradebookd");
    let mut stdin = child.stdin.take().expect("child stdin");
    let mut reader = BufReader::new(child.stdout.take().expect("child stdout"));

    let created = request(
        &mut stdin,
        &mut reader,
        "1",
        "classes.create",
        json!({ "name": "Form 1 North" }),
    );
    assert_eq!(created["ok"], json!(true));
    assert_eq!(created["result"]["curriculum"], json!("STANDARD"));
    assert!(workspace.join("gradebook.sqlite3").is_file());

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
