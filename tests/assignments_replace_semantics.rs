use rusqlite::Connection;
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

const STAFF_HEX: &str = "aaaaaaaaaaaaaaaaaaaaaaaa";

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
    let exe = env!("CARGO_BIN_EXE_feedbackd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn feedbackd");
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
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "expected ok for {}: {}",
        method,
        value
    );
    value.get("result").cloned().expect("result payload")
}

fn seed(workspace: &Path) {
    let conn: Connection = feedbackd::db::open_db(workspace).expect("open workspace db");

    conn.execute(
        "INSERT INTO departments(id, name, abbreviation) VALUES(?, ?, ?)",
        ("dept-co", "Computer Engineering", "CO"),
    )
    .expect("dept-co");
    conn.execute(
        "INSERT INTO academic_years(id, name, abbreviation, department_id) VALUES(?, ?, ?, ?)",
        ("year-tyco", "Third Year CO", "TYCO", "dept-co"),
    )
    .expect("year-tyco");

    conn.execute(
        "INSERT INTO users(id, name) VALUES(?, ?)",
        ("user-a", "A. Kulkarni"),
    )
    .expect("user-a");
    conn.execute(
        "INSERT INTO users(id, name) VALUES(?, ?)",
        ("user-b", "B. Deshmukh"),
    )
    .expect("user-b");
    conn.execute(
        "INSERT INTO staff(id, user_id, department_id) VALUES(?, ?, ?)",
        (STAFF_HEX, "user-a", "dept-co"),
    )
    .expect("staff hex");
    conn.execute(
        "INSERT INTO staff(id, user_id, department_id) VALUES(?, ?, ?)",
        ("staff-2", "user-b", "dept-co"),
    )
    .expect("staff-2");

    conn.execute(
        "INSERT INTO subjects(id, name, subject_code, academic_year_id) VALUES(?, ?, ?, ?)",
        ("subj-os", "Operating Systems", "22516", None::<String>),
    )
    .expect("subj-os");
    conn.execute(
        "INSERT INTO department_subject_links(id, department_id, subject_id, academic_year_id, subject_code)
         VALUES(?, ?, ?, ?, ?)",
        ("link-os", "dept-co", "subj-os", "year-tyco", "22516"),
    )
    .expect("link-os");

    conn.execute(
        "INSERT INTO students(id, user_id, department_id, academic_year_id) VALUES(?, ?, ?, ?)",
        ("stud-1", None::<String>, "dept-co", "year-tyco"),
    )
    .expect("stud-1");

    // The row to be replaced stores its staff id in the export wrapper form.
    conn.execute(
        "INSERT INTO faculty_assignments(id, staff_id, subject_id, department_id, academic_year_id, semester, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            "asg-old1",
            "ObjectId(\"AAAAAAAAAAAAAAAAAAAAAAAA\")",
            "subj-os",
            "dept-co",
            None::<String>,
            "Odd 2025-26",
            "2025-06-01T10:00:00Z",
        ),
    )
    .expect("asg-old1");
    conn.execute(
        "INSERT INTO faculty_assignments(id, staff_id, subject_id, department_id, academic_year_id, semester, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            "asg-old2",
            STAFF_HEX,
            "subj-os",
            "dept-co",
            None::<String>,
            "Even 2025-26",
            "2025-06-01T10:00:00Z",
        ),
    )
    .expect("asg-old2");
    conn.execute(
        "INSERT INTO faculty_assignments(id, staff_id, subject_id, department_id, academic_year_id, semester, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            "asg-keep",
            "staff-2",
            "subj-os",
            "dept-co",
            None::<String>,
            "Odd 2025-26",
            "2025-06-01T10:00:00Z",
        ),
    )
    .expect("asg-keep");
}

fn assignment_ids(result: &serde_json::Value) -> Vec<String> {
    result
        .get("rows")
        .and_then(|v| v.as_array())
        .expect("rows array")
        .iter()
        .map(|r| {
            r.get("assignmentId")
                .and_then(|v| v.as_str())
                .expect("assignmentId")
                .to_string()
        })
        .collect()
}

#[test]
fn replace_is_scoped_to_staff_and_semester_and_invalidates_the_cache() {
    let workspace = temp_dir("feedbackd-assignments-replace");
    seed(&workspace);

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let before = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "tasks.submissionStatus",
        json!({ "studentId": "stud-1" }),
    );
    let ids = assignment_ids(&before);
    assert_eq!(ids.len(), 3);
    assert!(ids.contains(&"asg-old1".to_string()));

    // Bare-hex staff id and differently-formatted semester still hit the
    // wrapper-form row; only the (staff, semester) pair is replaced.
    let replaced = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "assignments.replace",
        json!({
            "staffId": STAFF_HEX,
            "semester": " ODD 2025-26 ",
            "assignments": [
                { "subjectId": "link-os", "departmentId": "dept-co" }
            ]
        }),
    );
    assert_eq!(replaced.get("deleted").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(replaced.get("inserted").and_then(|v| v.as_i64()), Some(1));

    // No bypass needed: the write invalidated the cached report.
    let after = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "tasks.submissionStatus",
        json!({ "studentId": "stud-1" }),
    );
    let ids = assignment_ids(&after);
    assert_eq!(ids.len(), 3);
    assert!(!ids.contains(&"asg-old1".to_string()));
    assert!(ids.contains(&"asg-old2".to_string()));
    assert!(ids.contains(&"asg-keep".to_string()));

    let new_id = ids
        .iter()
        .find(|id| *id != "asg-old2" && *id != "asg-keep")
        .expect("replacement row")
        .clone();
    let new_row = after
        .get("rows")
        .and_then(|v| v.as_array())
        .unwrap()
        .iter()
        .find(|r| r.get("assignmentId").and_then(|v| v.as_str()) == Some(new_id.as_str()))
        .expect("new row");
    // The link reference resolves to the canonical subject and the trimmed
    // semester is what got stored.
    assert_eq!(
        new_row.get("subjectId").and_then(|v| v.as_str()),
        Some("subj-os")
    );
    assert_eq!(
        new_row.get("semester").and_then(|v| v.as_str()),
        Some("ODD 2025-26")
    );
    assert_eq!(
        new_row.get("status").and_then(|v| v.as_str()),
        Some("Pending")
    );

    // An external write the daemon never sees stays invisible to cached
    // reads until the caller asks for a bypass.
    {
        let conn: Connection = feedbackd::db::open_db(&workspace).expect("reopen workspace db");
        conn.execute(
            "INSERT INTO feedback(id, student_id, assignment_id) VALUES(?, ?, ?)",
            ("fb-ext", "stud-1", new_id.as_str()),
        )
        .expect("external feedback");
    }

    let cached = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "tasks.submissionStatus",
        json!({ "studentId": "stud-1" }),
    );
    let cached_row = cached
        .get("rows")
        .and_then(|v| v.as_array())
        .unwrap()
        .iter()
        .find(|r| r.get("assignmentId").and_then(|v| v.as_str()) == Some(new_id.as_str()))
        .expect("cached row")
        .clone();
    assert_eq!(
        cached_row.get("status").and_then(|v| v.as_str()),
        Some("Pending")
    );

    let fresh = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "tasks.submissionStatus",
        json!({ "studentId": "stud-1", "bypassCache": true }),
    );
    let fresh_row = fresh
        .get("rows")
        .and_then(|v| v.as_array())
        .unwrap()
        .iter()
        .find(|r| r.get("assignmentId").and_then(|v| v.as_str()) == Some(new_id.as_str()))
        .expect("fresh row")
        .clone();
    assert_eq!(
        fresh_row.get("status").and_then(|v| v.as_str()),
        Some("Completed")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
