use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::ladder::RiskLevel;
use chrono::{NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn required_f64(req: &Request, key: &str) -> Result<f64, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn opt_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn student_exists(
    conn: &Connection,
    req: &Request,
    student_id: &str,
) -> Result<(), serde_json::Value> {
    let found = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    if found.is_none() {
        return Err(err(&req.id, "not_found", "student not found", None));
    }
    Ok(())
}

fn parse_day(req: &Request, raw: &str) -> Result<String, serde_json::Value> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(|d| d.format("%Y-%m-%d").to_string())
        .map_err(|_| err(&req.id, "bad_params", "day must be YYYY-MM-DD", None))
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let last_name = match required_str(req, "lastName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let first_name = match required_str(req, "firstName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grade = opt_str(req, "grade");

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, last_name, first_name, grade, active, created_ts)
         VALUES(?, ?, ?, ?, 1, ?)",
        rusqlite::params![id, last_name, first_name, grade, db::now_ts()],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "studentId": id }))
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT id, last_name, first_name, grade, active FROM students ORDER BY last_name, first_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "lastName": r.get::<_, String>(1)?,
                "firstName": r.get::<_, String>(2)?,
                "grade": r.get::<_, Option<String>>(3)?,
                "active": r.get::<_, i64>(4)? != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_grades_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term_label = match required_str(req, "termLabel") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let average = match required_f64(req, "average") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if !(0.0..=100.0).contains(&average) {
        return err(&req.id, "bad_params", "average must be within 0..=100", None);
    }
    if let Err(e) = student_exists(conn, req, &student_id) {
        return e;
    }
    let recorded_ts = req
        .params
        .get("recordedTs")
        .and_then(|v| v.as_i64())
        .unwrap_or_else(db::now_ts);

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO term_grades(id, student_id, term_label, average, recorded_ts)
         VALUES(?, ?, ?, ?, ?)",
        rusqlite::params![id, student_id, term_label, average, recorded_ts],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "gradeId": id }))
}

fn handle_incidents_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let category = match required_str(req, "category") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = student_exists(conn, req, &student_id) {
        return e;
    }
    let occurred_on = match opt_str(req, "occurredOn") {
        Some(raw) => match parse_day(req, &raw) {
            Ok(d) => d,
            Err(e) => return e,
        },
        None => Utc::now().date_naive().format("%Y-%m-%d").to_string(),
    };
    let description = opt_str(req, "description");

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO behavior_incidents(id, student_id, category, description, occurred_on)
         VALUES(?, ?, ?, ?, ?)",
        rusqlite::params![id, student_id, category, description, occurred_on],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "incidentId": id }))
}

fn handle_incidents_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let incident_id = match required_str(req, "incidentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match conn.execute("DELETE FROM behavior_incidents WHERE id = ?", [&incident_id]) {
        Ok(0) => err(&req.id, "not_found", "incident not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_attendance_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let day_raw = match required_str(req, "day") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let day = match parse_day(req, &day_raw) {
        Ok(d) => d,
        Err(e) => return e,
    };
    let status = match required_str(req, "status") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if !matches!(status.as_str(), "present" | "absent" | "late") {
        return err(
            &req.id,
            "bad_params",
            "status must be present, absent, or late",
            None,
        );
    }
    if let Err(e) = student_exists(conn, req, &student_id) {
        return e;
    }
    if let Err(e) = conn.execute(
        "INSERT INTO attendance_days(student_id, day, status)
         VALUES(?, ?, ?)
         ON CONFLICT(student_id, day) DO UPDATE SET status = excluded.status",
        rusqlite::params![student_id, day, status],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_risk_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let risk_level_raw = match required_str(req, "riskLevel") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(risk_level) = RiskLevel::parse(&risk_level_raw) else {
        return err(&req.id, "bad_params", "unknown risk level", None);
    };
    let score = match required_f64(req, "overallRiskScore") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if !(0.0..=100.0).contains(&score) {
        return err(
            &req.id,
            "bad_params",
            "overallRiskScore must be within 0..=100",
            None,
        );
    }
    if let Err(e) = student_exists(conn, req, &student_id) {
        return e;
    }
    let assessed_ts = req
        .params
        .get("assessedTs")
        .and_then(|v| v.as_i64())
        .unwrap_or_else(db::now_ts);

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO risk_assessments(id, student_id, risk_level, overall_risk_score, assessed_ts)
         VALUES(?, ?, ?, ?, ?)",
        rusqlite::params![id, student_id, risk_level.as_str(), score, assessed_ts],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "assessmentId": id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.create" => Some(handle_students_create(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "grades.record" => Some(handle_grades_record(state, req)),
        "incidents.record" => Some(handle_incidents_record(state, req)),
        "incidents.delete" => Some(handle_incidents_delete(state, req)),
        "attendance.set" => Some(handle_attendance_set(state, req)),
        "risk.record" => Some(handle_risk_record(state, req)),
        _ => None,
    }
}
