use crate::db;
use crate::effectiveness::MetricsSnapshot;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::metrics;
use chrono::Utc;
use rusqlite::OptionalExtension;
use serde_json::json;

pub fn snapshot_json(snapshot: &MetricsSnapshot) -> serde_json::Value {
    json!({
        "academic": snapshot.academic,
        "behavioral": snapshot.behavioral,
        "attendance": snapshot.attendance,
        "socialEmotional": snapshot.social_emotional,
        "riskLevel": snapshot.risk_level,
        "capturedTs": snapshot.captured_ts
    })
}

fn handle_student_snapshot(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(student_id) = req.params.get("studentId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };

    let found = match conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if found.is_none() {
        return err(&req.id, "not_found", "student not found", None);
    }

    match metrics::snapshot_for_student(conn, student_id, Utc::now().date_naive(), db::now_ts()) {
        Ok(snapshot) => ok(&req.id, snapshot_json(&snapshot)),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "metrics.studentSnapshot" => Some(handle_student_snapshot(state, req)),
        _ => None,
    }
}
