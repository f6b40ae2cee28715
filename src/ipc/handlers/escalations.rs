use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::ladder::{
    self, EscalationStatus, EscalationType, RiskLevel, ROLE_ASSISTANT_PRINCIPAL, ROLE_COUNSELOR,
    ROLE_PRINCIPAL,
};
use crate::notify::{self, Channel, NotificationRequest, Priority};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};
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

fn opt_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

struct EscalationSetup {
    critical_threshold_hours: f64,
    default_threshold_hours: f64,
    counselor_contact: String,
    assistant_principal_contact: String,
    principal_contact: String,
}

fn load_setup(conn: &Connection) -> anyhow::Result<EscalationSetup> {
    let stored = db::settings_get_json(conn, "setup.escalation")?.unwrap_or(Value::Null);
    let get_f64 = |key: &str, fallback: f64| -> f64 {
        stored.get(key).and_then(|v| v.as_f64()).unwrap_or(fallback)
    };
    let get_str = |key: &str, fallback: &str| -> String {
        stored
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or(fallback)
            .to_string()
    };
    Ok(EscalationSetup {
        critical_threshold_hours: get_f64("criticalThresholdHours", 2.0),
        default_threshold_hours: get_f64("defaultThresholdHours", 24.0),
        counselor_contact: get_str("counselorContact", "counselor@school.example"),
        assistant_principal_contact: get_str(
            "assistantPrincipalContact",
            "assistant.principal@school.example",
        ),
        principal_contact: get_str("principalContact", "principal@school.example"),
    })
}

impl EscalationSetup {
    fn contact_for_role(&self, role: &str) -> &str {
        match role {
            ROLE_COUNSELOR => &self.counselor_contact,
            ROLE_ASSISTANT_PRINCIPAL => &self.assistant_principal_contact,
            ROLE_PRINCIPAL => &self.principal_contact,
            _ => &self.counselor_contact,
        }
    }
}

struct EscalationRow {
    id: String,
    student_id: String,
    alert_id: Option<String>,
    intervention_id: Option<String>,
    escalation_type: String,
    risk_level: Option<String>,
    trigger_reason: String,
    current_level: String,
    escalated_to: String,
    status: String,
    escalated_ts: i64,
    rung_ts: i64,
    responded_by: Option<String>,
    responded_ts: Option<i64>,
    action_taken: Option<String>,
    resolution: Option<String>,
    notifications_sent: String,
}

const SELECT_ESCALATION: &str = "SELECT id, student_id, alert_id, intervention_id, escalation_type, risk_level,
        trigger_reason, current_level, escalated_to, status, escalated_ts, rung_ts,
        responded_by, responded_ts, action_taken, resolution, notifications_sent
 FROM escalations";

fn row_to_escalation(row: &Row) -> rusqlite::Result<EscalationRow> {
    Ok(EscalationRow {
        id: row.get(0)?,
        student_id: row.get(1)?,
        alert_id: row.get(2)?,
        intervention_id: row.get(3)?,
        escalation_type: row.get(4)?,
        risk_level: row.get(5)?,
        trigger_reason: row.get(6)?,
        current_level: row.get(7)?,
        escalated_to: row.get(8)?,
        status: row.get(9)?,
        escalated_ts: row.get(10)?,
        rung_ts: row.get(11)?,
        responded_by: row.get(12)?,
        responded_ts: row.get(13)?,
        action_taken: row.get(14)?,
        resolution: row.get(15)?,
        notifications_sent: row.get(16)?,
    })
}

fn load_escalation(conn: &Connection, id: &str) -> rusqlite::Result<Option<EscalationRow>> {
    conn.query_row(
        &format!("{} WHERE id = ?", SELECT_ESCALATION),
        [id],
        row_to_escalation,
    )
    .optional()
}

impl EscalationRow {
    fn risk(&self) -> Option<RiskLevel> {
        self.risk_level.as_deref().and_then(RiskLevel::parse)
    }

    fn notified_roles(&self) -> Vec<String> {
        serde_json::from_str(&self.notifications_sent).unwrap_or_default()
    }
}

fn escalation_json(row: &EscalationRow) -> serde_json::Value {
    let chain = ladder::chain_for(row.risk());
    json!({
        "escalationId": row.id,
        "studentId": row.student_id,
        "alertId": row.alert_id,
        "interventionId": row.intervention_id,
        "escalationType": row.escalation_type,
        "riskLevel": row.risk_level,
        "triggerReason": row.trigger_reason,
        "currentLevel": row.current_level,
        "escalatedTo": row.escalated_to,
        "status": row.status,
        "escalatedTs": row.escalated_ts,
        "rungTs": row.rung_ts,
        "respondedBy": row.responded_by,
        "respondedTs": row.responded_ts,
        "actionTaken": row.action_taken,
        "resolution": row.resolution,
        "notificationsSent": row.notified_roles(),
        "chainLength": chain.len()
    })
}

fn alert_priority(risk: Option<RiskLevel>) -> Priority {
    if risk == Some(RiskLevel::Critical) {
        Priority::Urgent
    } else {
        Priority::High
    }
}

fn handle_trigger(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let type_raw = match required_str(req, "escalationType") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(escalation_type) = EscalationType::parse(&type_raw) else {
        return err(&req.id, "bad_params", "unknown escalation type", None);
    };
    let trigger_reason = match required_str(req, "triggerReason") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let risk = match opt_str(req, "riskLevel") {
        Some(raw) => match RiskLevel::parse(&raw) {
            Some(r) => Some(r),
            None => return err(&req.id, "bad_params", "unknown risk level", None),
        },
        None => None,
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

    let setup = match load_setup(conn) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let chain = ladder::chain_for(risk);
    let first_rung = chain[0];
    let now = db::now_ts();
    let id = Uuid::new_v4().to_string();
    let notified = json!([first_rung]).to_string();

    if let Err(e) = conn.execute(
        "INSERT INTO escalations(
            id, student_id, alert_id, intervention_id, escalation_type, risk_level,
            trigger_reason, current_level, escalated_to, status,
            escalated_ts, rung_ts, notifications_sent
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, 'OPEN', ?, ?, ?)",
        rusqlite::params![
            id,
            student_id,
            opt_str(req, "alertId"),
            opt_str(req, "interventionId"),
            escalation_type.as_str(),
            risk.map(|r| r.as_str()),
            trigger_reason,
            first_rung,
            first_rung,
            now,
            now,
            notified,
        ],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    let notification = NotificationRequest {
        recipient_type: first_rung.to_string(),
        recipient_contact: setup.contact_for_role(first_rung).to_string(),
        channel: Channel::Email,
        subject: format!("Escalation opened: {}", escalation_type.as_str()),
        message: format!(
            "An escalation has been opened for student {}. Reason: {}",
            student_id, trigger_reason
        ),
        priority: alert_priority(risk),
        student_id: Some(student_id.clone()),
        alert_id: opt_str(req, "alertId"),
        intervention_id: opt_str(req, "interventionId"),
        escalation_id: Some(id.clone()),
    };
    if let Err(e) = notify::send(conn, &notification) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "escalationId": id,
            "currentLevel": first_rung,
            "chainLength": chain.len()
        }),
    )
}

fn handle_respond(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let escalation_id = match required_str(req, "escalationId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let responded_by = match required_str(req, "respondedBy") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let row = match load_escalation(conn, &escalation_id) {
        Ok(Some(r)) => r,
        Ok(None) => return err(&req.id, "not_found", "escalation not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let terminal = EscalationStatus::parse(&row.status)
        .map(|s| s.is_terminal())
        .unwrap_or(false);
    if terminal {
        return err(&req.id, "conflict", "escalation already closed", None);
    }

    let action_taken = opt_str(req, "actionTaken");
    let resolution = opt_str(req, "resolution");
    let resolved = req
        .params
        .get("resolved")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    // A resolving response closes the ladder out; a bare acknowledgement
    // keeps the escalation in progress.
    let new_status = if resolved || resolution.is_some() {
        EscalationStatus::Resolved
    } else {
        EscalationStatus::InProgress
    };
    let now = db::now_ts();

    if let Err(e) = conn.execute(
        "UPDATE escalations SET
            status = ?, responded_by = ?, responded_ts = ?, action_taken = ?, resolution = ?
         WHERE id = ?",
        rusqlite::params![
            new_status.as_str(),
            responded_by,
            now,
            action_taken,
            resolution,
            escalation_id,
        ],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    if new_status == EscalationStatus::Resolved {
        let setup = match load_setup(conn) {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let confirmation = NotificationRequest {
            recipient_type: ROLE_COUNSELOR.to_string(),
            recipient_contact: setup.counselor_contact.clone(),
            channel: Channel::Email,
            subject: "Escalation resolved".to_string(),
            message: format!(
                "Escalation for student {} was resolved by {}.",
                row.student_id, responded_by
            ),
            priority: Priority::Normal,
            student_id: Some(row.student_id.clone()),
            alert_id: row.alert_id.clone(),
            intervention_id: row.intervention_id.clone(),
            escalation_id: Some(escalation_id.clone()),
        };
        if let Err(e) = notify::send(conn, &confirmation) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(
        &req.id,
        json!({
            "escalationId": escalation_id,
            "status": new_status.as_str()
        }),
    )
}

fn handle_close(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let escalation_id = match required_str(req, "escalationId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let row = match load_escalation(conn, &escalation_id) {
        Ok(Some(r)) => r,
        Ok(None) => return err(&req.id, "not_found", "escalation not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let terminal = EscalationStatus::parse(&row.status)
        .map(|s| s.is_terminal())
        .unwrap_or(false);
    if terminal {
        return err(&req.id, "conflict", "escalation already closed", None);
    }

    if let Err(e) = conn.execute(
        "UPDATE escalations SET status = 'CLOSED', resolution = COALESCE(?, resolution) WHERE id = ?",
        rusqlite::params![opt_str(req, "resolution"), escalation_id],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "escalationId": escalation_id, "status": "CLOSED" }))
}

fn load_unresponded(conn: &Connection) -> rusqlite::Result<Vec<EscalationRow>> {
    let mut stmt = conn.prepare(&format!(
        "{} WHERE status IN ('OPEN', 'IN_PROGRESS') AND responded_ts IS NULL ORDER BY escalated_ts",
        SELECT_ESCALATION
    ))?;
    let rows = stmt
        .query_map([], row_to_escalation)?
        .collect::<Result<Vec<_>, _>>();
    rows
}

/// Promotes overdue, unresponded escalations one rung up their chain. An
/// escalation already at the top rung stays put however overdue it is.
fn handle_check_unresponded(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let setup = match load_setup(conn) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = match load_unresponded(conn) {
        Ok(r) => r,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let now = db::now_ts();
    let mut escalated = 0i64;
    for row in rows {
        let risk = row.risk();
        let threshold = ladder::threshold_hours(
            risk,
            setup.critical_threshold_hours,
            setup.default_threshold_hours,
        );
        let elapsed_hours = (now - row.rung_ts) as f64 / 3600.0;
        if elapsed_hours <= threshold {
            continue;
        }

        let chain = ladder::chain_for(risk);
        let Some(idx) = ladder::rung_index(chain, &row.current_level) else {
            continue;
        };
        if idx + 1 >= chain.len() {
            continue;
        }
        let next_rung = chain[idx + 1];

        let mut notified = row.notified_roles();
        notified.push(next_rung.to_string());
        let notified_json = match serde_json::to_string(&notified) {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
        };
        if let Err(e) = conn.execute(
            "UPDATE escalations SET
                current_level = ?, escalated_to = ?, rung_ts = ?, notifications_sent = ?
             WHERE id = ?",
            rusqlite::params![next_rung, next_rung, now, notified_json, row.id],
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }

        let notification = NotificationRequest {
            recipient_type: next_rung.to_string(),
            recipient_contact: setup.contact_for_role(next_rung).to_string(),
            channel: Channel::Email,
            subject: format!("Escalation unresponded: {}", row.escalation_type),
            message: format!(
                "Escalation for student {} went unanswered by {} for {:.1} hours. Reason: {}",
                row.student_id, row.current_level, elapsed_hours, row.trigger_reason
            ),
            priority: alert_priority(risk),
            student_id: Some(row.student_id.clone()),
            alert_id: row.alert_id.clone(),
            intervention_id: row.intervention_id.clone(),
            escalation_id: Some(row.id.clone()),
        };
        if let Err(e) = notify::send(conn, &notification) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
        escalated += 1;
    }

    ok(&req.id, json!({ "escalated": escalated }))
}

fn handle_metrics(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let setup = match load_setup(conn) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let active: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM escalations WHERE status IN ('OPEN', 'IN_PROGRESS')",
        [],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let critical_active: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM escalations
         WHERE status IN ('OPEN', 'IN_PROGRESS') AND risk_level = 'CRITICAL'",
        [],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = match load_unresponded(conn) {
        Ok(r) => r,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let now = db::now_ts();
    let overdue = rows
        .iter()
        .filter(|row| {
            let threshold = ladder::threshold_hours(
                row.risk(),
                setup.critical_threshold_hours,
                setup.default_threshold_hours,
            );
            (now - row.rung_ts) as f64 / 3600.0 > threshold
        })
        .count() as i64;

    ok(
        &req.id,
        json!({
            "active": active,
            "criticalActive": critical_active,
            "overdue": overdue
        }),
    )
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let escalation_id = match required_str(req, "escalationId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match load_escalation(conn, &escalation_id) {
        Ok(Some(row)) => ok(&req.id, escalation_json(&row)),
        Ok(None) => err(&req.id, "not_found", "escalation not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_list_active(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(&format!(
        "{} WHERE status IN ('OPEN', 'IN_PROGRESS') ORDER BY escalated_ts",
        SELECT_ESCALATION
    )) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], row_to_escalation)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(rows) => {
            let items: Vec<serde_json::Value> = rows.iter().map(escalation_json).collect();
            ok(&req.id, json!({ "escalations": items }))
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "escalation.trigger" => Some(handle_trigger(state, req)),
        "escalation.respond" => Some(handle_respond(state, req)),
        "escalation.close" => Some(handle_close(state, req)),
        "escalation.checkUnresponded" => Some(handle_check_unresponded(state, req)),
        "escalation.metrics" => Some(handle_metrics(state, req)),
        "escalation.get" => Some(handle_get(state, req)),
        "escalation.listActive" => Some(handle_list_active(state, req)),
        _ => None,
    }
}
