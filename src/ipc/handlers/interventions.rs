use crate::db;
use crate::effectiveness::{self, EffectivenessLevel, MetricsSnapshot};
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::metrics::snapshot_json;
use crate::ipc::types::{AppState, Request};
use crate::metrics;
use crate::narrative;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterventionType {
    Counseling,
    Mentoring,
    AcademicSupport,
    BehavioralPlan,
    FamilyEngagement,
}

impl InterventionType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "counseling" => Some(Self::Counseling),
            "mentoring" => Some(Self::Mentoring),
            "academic_support" => Some(Self::AcademicSupport),
            "behavioral_plan" => Some(Self::BehavioralPlan),
            "family_engagement" => Some(Self::FamilyEngagement),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Counseling => "counseling",
            Self::Mentoring => "mentoring",
            Self::AcademicSupport => "academic_support",
            Self::BehavioralPlan => "behavioral_plan",
            Self::FamilyEngagement => "family_engagement",
        }
    }
}

struct InterventionRow {
    id: String,
    student_id: String,
    intervention_type: String,
    title: String,
    start_ts: i64,
    end_ts: Option<i64>,
    duration_days: Option<i64>,
    pre: Option<MetricsSnapshot>,
    post: Option<MetricsSnapshot>,
    impact_academic: Option<f64>,
    impact_behavioral: Option<f64>,
    impact_attendance: Option<f64>,
    impact_social: Option<f64>,
    overall_effectiveness: Option<f64>,
    effectiveness_level: String,
}

fn snapshot_from_row(row: &Row, base: usize) -> rusqlite::Result<Option<MetricsSnapshot>> {
    let captured: Option<i64> = row.get(base + 5)?;
    let Some(captured_ts) = captured else {
        return Ok(None);
    };
    Ok(Some(MetricsSnapshot {
        academic: row.get(base)?,
        behavioral: row.get(base + 1)?,
        attendance: row.get(base + 2)?,
        social_emotional: row.get(base + 3)?,
        risk_level: row.get(base + 4)?,
        captured_ts,
    }))
}

const SELECT_INTERVENTION: &str = "SELECT id, student_id, intervention_type, title, start_ts, end_ts, duration_days,
        pre_academic, pre_behavioral, pre_attendance, pre_social, pre_risk_level, pre_captured_ts,
        post_academic, post_behavioral, post_attendance, post_social, post_risk_level, post_captured_ts,
        impact_academic, impact_behavioral, impact_attendance, impact_social,
        overall_effectiveness, effectiveness_level
 FROM interventions";

fn row_to_intervention(row: &Row) -> rusqlite::Result<InterventionRow> {
    Ok(InterventionRow {
        id: row.get(0)?,
        student_id: row.get(1)?,
        intervention_type: row.get(2)?,
        title: row.get(3)?,
        start_ts: row.get(4)?,
        end_ts: row.get(5)?,
        duration_days: row.get(6)?,
        pre: snapshot_from_row(row, 7)?,
        post: snapshot_from_row(row, 13)?,
        impact_academic: row.get(19)?,
        impact_behavioral: row.get(20)?,
        impact_attendance: row.get(21)?,
        impact_social: row.get(22)?,
        overall_effectiveness: row.get(23)?,
        effectiveness_level: row.get(24)?,
    })
}

fn load_intervention(conn: &Connection, id: &str) -> rusqlite::Result<Option<InterventionRow>> {
    conn.query_row(
        &format!("{} WHERE id = ?", SELECT_INTERVENTION),
        [id],
        row_to_intervention,
    )
    .optional()
}

fn effectiveness_json(row: &InterventionRow) -> serde_json::Value {
    if row.post.is_none() {
        return json!({
            "impacts": serde_json::Value::Null,
            "overallEffectiveness": serde_json::Value::Null,
            "level": EffectivenessLevel::Pending.as_str()
        });
    }
    json!({
        "impacts": {
            "academic": row.impact_academic,
            "behavioral": row.impact_behavioral,
            "attendance": row.impact_attendance,
            "socialEmotional": row.impact_social
        },
        "overallEffectiveness": row.overall_effectiveness,
        "level": row.effectiveness_level
    })
}

fn intervention_json(row: &InterventionRow) -> serde_json::Value {
    json!({
        "interventionId": row.id,
        "studentId": row.student_id,
        "interventionType": row.intervention_type,
        "title": row.title,
        "startTs": row.start_ts,
        "endTs": row.end_ts,
        "durationDays": row.duration_days,
        "preMetrics": row.pre.as_ref().map(snapshot_json),
        "postMetrics": row.post.as_ref().map(snapshot_json),
        "effectiveness": effectiveness_json(row)
    })
}

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

fn handle_start(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let type_raw = match required_str(req, "interventionType") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(intervention_type) = InterventionType::parse(&type_raw) else {
        return err(&req.id, "bad_params", "unknown intervention type", None);
    };
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let found = match conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
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

    let now = db::now_ts();
    let pre = match metrics::snapshot_for_student(conn, &student_id, Utc::now().date_naive(), now) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO interventions(
            id, student_id, intervention_type, title, start_ts,
            pre_academic, pre_behavioral, pre_attendance, pre_social,
            pre_risk_level, pre_captured_ts, effectiveness_level
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'PENDING')",
        rusqlite::params![
            id,
            student_id,
            intervention_type.as_str(),
            title,
            now,
            pre.academic,
            pre.behavioral,
            pre.attendance,
            pre.social_emotional,
            pre.risk_level,
            pre.captured_ts,
        ],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "interventionId": id, "preMetrics": snapshot_json(&pre) }),
    )
}

fn handle_end(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let intervention_id = match required_str(req, "interventionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let row = match load_intervention(conn, &intervention_id) {
        Ok(Some(r)) => r,
        Ok(None) => return err(&req.id, "not_found", "intervention not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    // end_ts is write-once; an ended intervention can only be re-evaluated.
    if row.end_ts.is_some() {
        return err(&req.id, "conflict", "intervention already ended", None);
    }
    let Some(pre) = row.pre else {
        return err(&req.id, "conflict", "intervention has no pre snapshot", None);
    };

    let now = db::now_ts();
    let post = match metrics::snapshot_for_student(conn, &row.student_id, Utc::now().date_naive(), now)
    {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let impact = effectiveness::evaluate(&pre, &post);
    let duration_days = ((now - row.start_ts).max(0)) / 86_400;

    if let Err(e) = conn.execute(
        "UPDATE interventions SET
            end_ts = ?, duration_days = ?,
            post_academic = ?, post_behavioral = ?, post_attendance = ?, post_social = ?,
            post_risk_level = ?, post_captured_ts = ?,
            impact_academic = ?, impact_behavioral = ?, impact_attendance = ?, impact_social = ?,
            overall_effectiveness = ?, effectiveness_level = ?
         WHERE id = ?",
        rusqlite::params![
            now,
            duration_days,
            post.academic,
            post.behavioral,
            post.attendance,
            post.social_emotional,
            post.risk_level,
            post.captured_ts,
            impact.academic,
            impact.behavioral,
            impact.attendance,
            impact.social_emotional,
            impact.overall_effectiveness,
            impact.level.as_str(),
            intervention_id,
        ],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "interventionId": intervention_id,
            "endTs": now,
            "durationDays": duration_days,
            "postMetrics": snapshot_json(&post),
            "effectiveness": {
                "impacts": {
                    "academic": impact.academic,
                    "behavioral": impact.behavioral,
                    "attendance": impact.attendance,
                    "socialEmotional": impact.social_emotional
                },
                "overallEffectiveness": impact.overall_effectiveness,
                "level": impact.level.as_str()
            }
        }),
    )
}

fn handle_reevaluate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let intervention_id = match required_str(req, "interventionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let row = match load_intervention(conn, &intervention_id) {
        Ok(Some(r)) => r,
        Ok(None) => return err(&req.id, "not_found", "intervention not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let (Some(pre), Some(post)) = (row.pre.as_ref(), row.post.as_ref()) else {
        return err(&req.id, "conflict", "intervention not ended", None);
    };

    let impact = effectiveness::evaluate(pre, post);
    if let Err(e) = conn.execute(
        "UPDATE interventions SET
            impact_academic = ?, impact_behavioral = ?, impact_attendance = ?, impact_social = ?,
            overall_effectiveness = ?, effectiveness_level = ?
         WHERE id = ?",
        rusqlite::params![
            impact.academic,
            impact.behavioral,
            impact.attendance,
            impact.social_emotional,
            impact.overall_effectiveness,
            impact.level.as_str(),
            intervention_id,
        ],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "interventionId": intervention_id,
            "overallEffectiveness": impact.overall_effectiveness,
            "level": impact.level.as_str()
        }),
    )
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let intervention_id = match required_str(req, "interventionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match load_intervention(conn, &intervention_id) {
        Ok(Some(row)) => ok(&req.id, intervention_json(&row)),
        Ok(None) => err(&req.id, "not_found", "intervention not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_effectiveness(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let intervention_id = match required_str(req, "interventionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match load_intervention(conn, &intervention_id) {
        Ok(Some(row)) => {
            let mut result = effectiveness_json(&row);
            result["interventionId"] = json!(row.id);
            ok(&req.id, result)
        }
        Ok(None) => err(&req.id, "not_found", "intervention not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_list_by_type(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let type_raw = match required_str(req, "interventionType") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(intervention_type) = InterventionType::parse(&type_raw) else {
        return err(&req.id, "bad_params", "unknown intervention type", None);
    };

    let mut stmt = match conn.prepare(&format!(
        "{} WHERE intervention_type = ? ORDER BY start_ts",
        SELECT_INTERVENTION
    )) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([intervention_type.as_str()], row_to_intervention)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(rows) => {
            let items: Vec<serde_json::Value> = rows.iter().map(intervention_json).collect();
            ok(&req.id, json!({ "interventions": items }))
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_analysis(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let intervention_id = match required_str(req, "interventionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let row = match load_intervention(conn, &intervention_id) {
        Ok(Some(r)) => r,
        Ok(None) => return err(&req.id, "not_found", "intervention not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let (Some(pre), Some(post)) = (row.pre.as_ref(), row.post.as_ref()) else {
        return err(&req.id, "conflict", "intervention not ended", None);
    };

    let impact = effectiveness::evaluate(pre, post);
    let analysis = narrative::analyze(state.text_gen.as_ref(), &impact, pre, post);
    ok(
        &req.id,
        json!({
            "interventionId": intervention_id,
            "insights": analysis.insights,
            "recommendations": analysis.recommendations,
            "successFactors": analysis.success_factors,
            "challenges": analysis.challenges
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "interventions.start" => Some(handle_start(state, req)),
        "interventions.end" => Some(handle_end(state, req)),
        "interventions.reevaluate" => Some(handle_reevaluate(state, req)),
        "interventions.get" => Some(handle_get(state, req)),
        "interventions.effectiveness" => Some(handle_effectiveness(state, req)),
        "interventions.listByType" => Some(handle_list_by_type(state, req)),
        "interventions.analysis" => Some(handle_analysis(state, req)),
        _ => None,
    }
}
