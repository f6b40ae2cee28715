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
    let exe = env!("CARGO_BIN_EXE_counselord");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn counselord");
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
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    serde_json::from_str(line.trim()).expect("parse response json")
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
        id,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    last_name: &str,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        "student",
        "students.create",
        json!({ "lastName": last_name, "firstName": "Case" }),
    );
    created["studentId"].as_str().expect("studentId").to_string()
}

// The sweep times each rung from rung_ts; rewinding it simulates hours
// passing without restarting the sidecar.
fn rewind_rung(workspace: &PathBuf, escalation_id: &str, secs: i64) {
    let conn = rusqlite::Connection::open(workspace.join("counseling.sqlite3")).expect("open db");
    conn.busy_timeout(std::time::Duration::from_secs(5)).expect("busy timeout");
    let changed = conn
        .execute(
            "UPDATE escalations SET rung_ts = rung_ts - ? WHERE id = ?",
            rusqlite::params![secs, escalation_id],
        )
        .expect("rewind rung_ts");
    assert_eq!(changed, 1);
}

#[test]
fn critical_escalations_climb_one_rung_per_overdue_sweep() {
    let workspace = temp_dir("counselor-sweep-critical");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let student_id = create_student(&mut stdin, &mut reader, "Sweep");

    let triggered = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "escalation.trigger",
        json!({
            "studentId": student_id,
            "escalationType": "crisis",
            "riskLevel": "CRITICAL",
            "triggerReason": "crisis disclosure"
        }),
    );
    let escalation_id = triggered["escalationId"].as_str().expect("id").to_string();
    let opened = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "escalation.get",
        json!({ "escalationId": escalation_id }),
    );
    let opened_ts = opened["escalatedTs"].as_i64().expect("escalatedTs");

    // Fresh escalation: nothing is overdue yet.
    let sweep = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "escalation.checkUnresponded",
        json!({}),
    );
    assert_eq!(sweep["escalated"].as_i64(), Some(0));

    // Three hours past the two-hour critical threshold.
    rewind_rung(&workspace, &escalation_id, 3 * 3600);
    let sweep = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "escalation.checkUnresponded",
        json!({}),
    );
    assert_eq!(sweep["escalated"].as_i64(), Some(1));

    let promoted = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "escalation.get",
        json!({ "escalationId": escalation_id }),
    );
    assert_eq!(promoted["currentLevel"].as_str(), Some("Assistant Principal"));
    assert_eq!(promoted["escalatedTo"].as_str(), Some("Assistant Principal"));
    assert_eq!(
        promoted["notificationsSent"],
        json!(["Counselor", "Assistant Principal"])
    );
    assert_eq!(promoted["status"].as_str(), Some("OPEN"));
    // The trigger time is the audit anchor; only the rung clock resets.
    assert_eq!(promoted["escalatedTs"].as_i64(), Some(opened_ts));

    // The rung clock just reset, so the next sweep is a no-op.
    let sweep = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "escalation.checkUnresponded",
        json!({}),
    );
    assert_eq!(sweep["escalated"].as_i64(), Some(0));

    rewind_rung(&workspace, &escalation_id, 3 * 3600);
    let sweep = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "escalation.checkUnresponded",
        json!({}),
    );
    assert_eq!(sweep["escalated"].as_i64(), Some(1));
    let top = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "escalation.get",
        json!({ "escalationId": escalation_id }),
    );
    assert_eq!(top["currentLevel"].as_str(), Some("Principal"));
    assert_eq!(
        top["notificationsSent"],
        json!(["Counselor", "Assistant Principal", "Principal"])
    );

    // The principal is the last rung; overdue or not, there is nowhere to go.
    rewind_rung(&workspace, &escalation_id, 3 * 3600);
    let sweep = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "escalation.checkUnresponded",
        json!({}),
    );
    assert_eq!(sweep["escalated"].as_i64(), Some(0));

    // Each promotion re-notified the new rung at urgent priority.
    let sent = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "notifications.listByStatus",
        json!({ "status": "SENT" }),
    );
    let rows = sent["notifications"].as_array().expect("rows");
    assert_eq!(rows.len(), 3);
    assert!(rows
        .iter()
        .all(|r| r["priority"].as_str() == Some("URGENT")));
    assert!(rows
        .iter()
        .any(|r| r["recipientType"].as_str() == Some("Principal")));

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn non_critical_escalations_use_the_default_threshold() {
    let workspace = temp_dir("counselor-sweep-standard");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let student_id = create_student(&mut stdin, &mut reader, "Standard");

    let triggered = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "escalation.trigger",
        json!({
            "studentId": student_id,
            "escalationType": "attendance",
            "riskLevel": "HIGH",
            "triggerReason": "chronic absence"
        }),
    );
    let escalation_id = triggered["escalationId"].as_str().expect("id").to_string();

    // Three hours is nothing against the 24-hour default threshold.
    rewind_rung(&workspace, &escalation_id, 3 * 3600);
    let sweep = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "escalation.checkUnresponded",
        json!({}),
    );
    assert_eq!(sweep["escalated"].as_i64(), Some(0));

    rewind_rung(&workspace, &escalation_id, 22 * 3600);
    let sweep = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "escalation.checkUnresponded",
        json!({}),
    );
    assert_eq!(sweep["escalated"].as_i64(), Some(1));

    // Two-rung chain: the assistant principal is already the top.
    rewind_rung(&workspace, &escalation_id, 25 * 3600);
    let sweep = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "escalation.checkUnresponded",
        json!({}),
    );
    assert_eq!(sweep["escalated"].as_i64(), Some(0));
    let top = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "escalation.get",
        json!({ "escalationId": escalation_id }),
    );
    assert_eq!(top["currentLevel"].as_str(), Some("Assistant Principal"));

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn responded_escalations_are_left_alone() {
    let workspace = temp_dir("counselor-sweep-responded");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let student_id = create_student(&mut stdin, &mut reader, "Responded");

    let triggered = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "escalation.trigger",
        json!({
            "studentId": student_id,
            "escalationType": "behavioral",
            "riskLevel": "CRITICAL",
            "triggerReason": "fight"
        }),
    );
    let escalation_id = triggered["escalationId"].as_str().expect("id").to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "escalation.respond",
        json!({ "escalationId": escalation_id, "respondedBy": "Counselor Vega" }),
    );

    rewind_rung(&workspace, &escalation_id, 100 * 3600);
    let sweep = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "escalation.checkUnresponded",
        json!({}),
    );
    assert_eq!(sweep["escalated"].as_i64(), Some(0));

    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "escalation.get",
        json!({ "escalationId": escalation_id }),
    );
    assert_eq!(fetched["currentLevel"].as_str(), Some("Counselor"));

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn metrics_count_active_critical_and_overdue() {
    let workspace = temp_dir("counselor-sweep-metrics");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let student_id = create_student(&mut stdin, &mut reader, "Counted");

    let critical = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "escalation.trigger",
        json!({
            "studentId": student_id,
            "escalationType": "crisis",
            "riskLevel": "CRITICAL",
            "triggerReason": "crisis"
        }),
    );
    let critical_id = critical["escalationId"].as_str().expect("id").to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "escalation.trigger",
        json!({
            "studentId": student_id,
            "escalationType": "academic",
            "riskLevel": "HIGH",
            "triggerReason": "grades"
        }),
    );

    let metrics = request_ok(&mut stdin, &mut reader, "4", "escalation.metrics", json!({}));
    assert_eq!(metrics["active"].as_i64(), Some(2));
    assert_eq!(metrics["criticalActive"].as_i64(), Some(1));
    assert_eq!(metrics["overdue"].as_i64(), Some(0));

    rewind_rung(&workspace, &critical_id, 3 * 3600);
    let metrics = request_ok(&mut stdin, &mut reader, "5", "escalation.metrics", json!({}));
    assert_eq!(metrics["overdue"].as_i64(), Some(1));

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}
