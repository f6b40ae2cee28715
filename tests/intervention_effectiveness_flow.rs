use chrono::{Duration, Utc};
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

fn error_code(value: &serde_json::Value) -> &str {
    assert_eq!(value["ok"].as_bool(), Some(false), "expected error: {}", value);
    value["error"]["code"].as_str().expect("error code")
}

fn day_offset(days: i64) -> String {
    (Utc::now().date_naive() + Duration::days(days))
        .format("%Y-%m-%d")
        .to_string()
}

fn approx(value: &serde_json::Value, expected: f64) -> bool {
    value.as_f64().map(|v| (v - expected).abs() < 1e-9).unwrap_or(false)
}

#[test]
fn unchanged_metrics_land_at_fifty_partially_effective() {
    let workspace = temp_dir("counselor-flow-neutral");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "lastName": "Neutral", "firstName": "Case" }),
    );
    let student_id = created["studentId"].as_str().expect("studentId").to_string();

    let started = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "interventions.start",
        json!({
            "studentId": student_id,
            "interventionType": "mentoring",
            "title": "Peer mentoring"
        }),
    );
    let intervention_id = started["interventionId"].as_str().expect("id").to_string();
    assert!(approx(&started["preMetrics"]["academic"], 50.0));

    // Effectiveness is PENDING until the intervention ends.
    let pending = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "interventions.effectiveness",
        json!({ "interventionId": intervention_id }),
    );
    assert_eq!(pending["level"].as_str(), Some("PENDING"));
    assert!(pending["impacts"].is_null());

    // Nothing changed between the snapshots.
    let ended = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "interventions.end",
        json!({ "interventionId": intervention_id }),
    );
    assert!(approx(&ended["effectiveness"]["impacts"]["academic"], 0.0));
    assert!(approx(&ended["effectiveness"]["impacts"]["behavioral"], 0.0));
    assert!(approx(&ended["effectiveness"]["impacts"]["attendance"], 0.0));
    assert!(approx(&ended["effectiveness"]["impacts"]["socialEmotional"], 0.0));
    assert!(approx(&ended["effectiveness"]["overallEffectiveness"], 50.0));
    assert_eq!(
        ended["effectiveness"]["level"].as_str(),
        Some("PARTIALLY_EFFECTIVE")
    );
    assert_eq!(ended["durationDays"].as_i64(), Some(0));

    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "interventions.get",
        json!({ "interventionId": intervention_id }),
    );
    assert!(fetched["preMetrics"].is_object());
    assert!(fetched["postMetrics"].is_object());
    assert_eq!(
        fetched["effectiveness"]["level"].as_str(),
        Some("PARTIALLY_EFFECTIVE")
    );

    let re = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "interventions.reevaluate",
        json!({ "interventionId": intervention_id }),
    );
    assert!(approx(&re["overallEffectiveness"], 50.0));

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn doubled_metrics_score_one_hundred_very_effective() {
    let workspace = temp_dir("counselor-flow-doubled");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "lastName": "Turnaround", "firstName": "Case" }),
    );
    let student_id = created["studentId"].as_str().expect("studentId").to_string();

    // Pre state: academic 40, behavioral 50 (five incidents), attendance 50
    // (one of two days absent), social-emotional 40 (risk score 60).
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grades.record",
        json!({ "studentId": student_id, "termLabel": "T1", "average": 40.0, "recordedTs": 1000 }),
    );
    let mut incident_ids = Vec::new();
    for i in 0..5 {
        let incident = request_ok(
            &mut stdin,
            &mut reader,
            &format!("i{}", i),
            "incidents.record",
            json!({ "studentId": student_id, "category": "disruption", "occurredOn": day_offset(-1) }),
        );
        incident_ids.push(incident["incidentId"].as_str().expect("incidentId").to_string());
    }
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.set",
        json!({ "studentId": student_id, "day": day_offset(-2), "status": "absent" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.set",
        json!({ "studentId": student_id, "day": day_offset(-3), "status": "present" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "risk.record",
        json!({ "studentId": student_id, "riskLevel": "HIGH", "overallRiskScore": 60.0, "assessedTs": 1000 }),
    );

    let started = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "interventions.start",
        json!({
            "studentId": student_id,
            "interventionType": "behavioral_plan",
            "title": "Turnaround plan"
        }),
    );
    let intervention_id = started["interventionId"].as_str().expect("id").to_string();
    assert!(approx(&started["preMetrics"]["academic"], 40.0));
    assert!(approx(&started["preMetrics"]["behavioral"], 50.0));
    assert!(approx(&started["preMetrics"]["attendance"], 50.0));
    assert!(approx(&started["preMetrics"]["socialEmotional"], 40.0));

    // Every dimension doubles: academic 40 -> 80 via two perfect terms,
    // behavioral 50 -> 100 by clearing the incidents, attendance 50 -> 100
    // by correcting the absence, social 40 -> 80 via a low-risk reassessment.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "grades.record",
        json!({ "studentId": student_id, "termLabel": "T2", "average": 100.0, "recordedTs": 2000 }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "grades.record",
        json!({ "studentId": student_id, "termLabel": "T3", "average": 100.0, "recordedTs": 3000 }),
    );
    for (i, incident_id) in incident_ids.iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("d{}", i),
            "incidents.delete",
            json!({ "incidentId": incident_id }),
        );
    }
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "attendance.set",
        json!({ "studentId": student_id, "day": day_offset(-2), "status": "present" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "risk.record",
        json!({ "studentId": student_id, "riskLevel": "LOW", "overallRiskScore": 20.0, "assessedTs": 2000 }),
    );

    let ended = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "interventions.end",
        json!({ "interventionId": intervention_id }),
    );
    assert!(approx(&ended["effectiveness"]["impacts"]["academic"], 100.0));
    assert!(approx(&ended["effectiveness"]["impacts"]["behavioral"], 100.0));
    assert!(approx(&ended["effectiveness"]["impacts"]["attendance"], 100.0));
    assert!(approx(&ended["effectiveness"]["impacts"]["socialEmotional"], 100.0));
    assert!(approx(&ended["effectiveness"]["overallEffectiveness"], 100.0));
    assert_eq!(ended["effectiveness"]["level"].as_str(), Some("VERY_EFFECTIVE"));
    assert_eq!(ended["postMetrics"]["riskLevel"].as_str(), Some("LOW"));

    // The analysis narrates the same impact result; without a text-generation
    // collaborator it comes from the rule table.
    let analysis = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "interventions.analysis",
        json!({ "interventionId": intervention_id }),
    );
    assert!(!analysis["insights"].as_array().expect("insights").is_empty());
    assert!(analysis["recommendations"][0]
        .as_str()
        .expect("recommendation")
        .contains("Continue"));
    assert!(analysis["challenges"].as_array().expect("challenges").is_empty());

    let by_type = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "interventions.listByType",
        json!({ "interventionType": "behavioral_plan" }),
    );
    assert_eq!(by_type["interventions"].as_array().expect("list").len(), 1);

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn lifecycle_misuse_is_rejected() {
    let workspace = temp_dir("counselor-flow-misuse");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "lastName": "Misuse", "firstName": "Case" }),
    );
    let student_id = created["studentId"].as_str().expect("studentId").to_string();

    let bad_type = request(
        &mut stdin,
        &mut reader,
        "3",
        "interventions.start",
        json!({ "studentId": student_id, "interventionType": "hypnosis", "title": "No" }),
    );
    assert_eq!(error_code(&bad_type), "bad_params");

    let missing = request(
        &mut stdin,
        &mut reader,
        "4",
        "interventions.get",
        json!({ "interventionId": "nope" }),
    );
    assert_eq!(error_code(&missing), "not_found");

    let started = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "interventions.start",
        json!({
            "studentId": student_id,
            "interventionType": "academic_support",
            "title": "Tutoring"
        }),
    );
    let intervention_id = started["interventionId"].as_str().expect("id").to_string();

    // Re-evaluation and analysis need a post snapshot.
    let early_re = request(
        &mut stdin,
        &mut reader,
        "6",
        "interventions.reevaluate",
        json!({ "interventionId": intervention_id }),
    );
    assert_eq!(error_code(&early_re), "conflict");
    let early_analysis = request(
        &mut stdin,
        &mut reader,
        "7",
        "interventions.analysis",
        json!({ "interventionId": intervention_id }),
    );
    assert_eq!(error_code(&early_analysis), "conflict");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "interventions.end",
        json!({ "interventionId": intervention_id }),
    );
    let double_end = request(
        &mut stdin,
        &mut reader,
        "9",
        "interventions.end",
        json!({ "interventionId": intervention_id }),
    );
    assert_eq!(error_code(&double_end), "conflict");

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}
