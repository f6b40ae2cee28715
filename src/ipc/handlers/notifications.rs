use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::notify::{
    self, Channel, NotificationRequest, NotificationStatus, Priority, SendOutcome,
};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

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

struct NotificationDefaults {
    delivery_confirm_secs: i64,
    retry_window_secs: i64,
}

fn load_defaults(conn: &Connection) -> anyhow::Result<NotificationDefaults> {
    let stored = db::settings_get_json(conn, "setup.notifications")?.unwrap_or(Value::Null);
    let delivery = stored
        .get("deliveryConfirmSeconds")
        .and_then(|v| v.as_i64())
        .unwrap_or(5);
    let retry_hours = stored
        .get("retryWindowHours")
        .and_then(|v| v.as_i64())
        .unwrap_or(24);
    Ok(NotificationDefaults {
        delivery_confirm_secs: delivery,
        retry_window_secs: retry_hours * 3600,
    })
}

fn opt_link(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
}

/// Builds a send request from one params object; also serves sendBulk items.
fn request_from_params(params: &Value) -> Result<NotificationRequest, String> {
    let get_str = |key: &str| -> Result<String, String> {
        params
            .get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| format!("missing {}", key))
    };
    let recipient_type = get_str("recipientType")?;
    let recipient_contact = get_str("recipientContact")?;
    let channel_raw = get_str("channel")?;
    let channel = Channel::parse(&channel_raw).ok_or_else(|| "unknown channel".to_string())?;
    let subject = get_str("subject")?;
    let message = get_str("message")?;
    let priority = match params.get("priority").and_then(|v| v.as_str()) {
        Some(raw) => Priority::parse(raw).ok_or_else(|| "unknown priority".to_string())?,
        None => Priority::Normal,
    };
    Ok(NotificationRequest {
        recipient_type,
        recipient_contact,
        channel,
        subject,
        message,
        priority,
        student_id: opt_link(params, "studentId"),
        alert_id: opt_link(params, "alertId"),
        intervention_id: opt_link(params, "interventionId"),
        escalation_id: opt_link(params, "escalationId"),
    })
}

fn outcome_json(outcome: &SendOutcome) -> serde_json::Value {
    json!({
        "notificationId": outcome.notification_id,
        "status": outcome.status.as_str(),
        "failureReason": outcome.failure_reason
    })
}

fn handle_send(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let request = match request_from_params(&req.params) {
        Ok(r) => r,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    match notify::send(conn, &request) {
        Ok(outcome) => ok(&req.id, outcome_json(&outcome)),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_send_bulk(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let Some(items) = req.params.get("notifications").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "notifications must be an array", None);
    };

    let mut sent = 0i64;
    let mut failed = 0i64;
    let mut results: Vec<serde_json::Value> = Vec::with_capacity(items.len());
    for item in items {
        match request_from_params(item) {
            Ok(request) => match notify::send(conn, &request) {
                Ok(outcome) => {
                    // A dispatch failure still produced a record; the batch
                    // counts it as handled, not rejected.
                    sent += 1;
                    results.push(outcome_json(&outcome));
                }
                Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
            },
            Err(msg) => {
                failed += 1;
                results.push(json!({ "error": msg }));
            }
        }
    }
    ok(
        &req.id,
        json!({
            "total": items.len(),
            "sent": sent,
            "failed": failed,
            "results": results
        }),
    )
}

fn handle_send_templated(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let template_name = match required_str(req, "templateName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let recipient_type = match required_str(req, "recipientType") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let recipient_contact = match required_str(req, "recipientContact") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let empty = serde_json::Map::new();
    let vars = req
        .params
        .get("variables")
        .and_then(|v| v.as_object())
        .unwrap_or(&empty);

    let row = match conn
        .query_row(
            "SELECT channel, subject_template, message_template
             FROM notification_templates WHERE name = ?",
            [&template_name],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                ))
            },
        )
        .optional()
    {
        Ok(Some(row)) => row,
        Ok(None) => return err(&req.id, "not_found", "template not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let (channel_raw, subject_template, message_template) = row;
    let Some(channel) = Channel::parse_template(&channel_raw) else {
        return err(&req.id, "conflict", "template has unknown channel", None);
    };
    let priority = match req.params.get("priority").and_then(|v| v.as_str()) {
        Some(raw) => match Priority::parse(raw) {
            Some(p) => p,
            None => return err(&req.id, "bad_params", "unknown priority", None),
        },
        None => Priority::Normal,
    };

    let request = NotificationRequest {
        recipient_type,
        recipient_contact,
        channel,
        subject: notify::render_template(&subject_template, vars),
        message: notify::render_template(&message_template, vars),
        priority,
        student_id: opt_link(&req.params, "studentId"),
        alert_id: opt_link(&req.params, "alertId"),
        intervention_id: opt_link(&req.params, "interventionId"),
        escalation_id: opt_link(&req.params, "escalationId"),
    };
    match notify::send(conn, &request) {
        Ok(outcome) => ok(&req.id, outcome_json(&outcome)),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_mark_read(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let notification_id = match required_str(req, "notificationId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let status_raw = match conn
        .query_row(
            "SELECT status FROM notifications WHERE id = ?",
            [&notification_id],
            |r| r.get::<_, String>(0),
        )
        .optional()
    {
        Ok(Some(s)) => s,
        Ok(None) => return err(&req.id, "not_found", "notification not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let can_read = NotificationStatus::parse(&status_raw)
        .map(|s| s.can_advance_to(NotificationStatus::Read))
        .unwrap_or(false);
    if !can_read {
        return err(
            &req.id,
            "conflict",
            format!("cannot mark {} notification as read", status_raw),
            None,
        );
    }
    if let Err(e) = conn.execute(
        "UPDATE notifications SET status = 'READ', read_ts = ? WHERE id = ?",
        (db::now_ts(), &notification_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_confirm_deliveries(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let defaults = match load_defaults(conn) {
        Ok(d) => d,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    match notify::confirm_deliveries(conn, defaults.delivery_confirm_secs) {
        Ok(confirmed) => ok(&req.id, json!({ "confirmed": confirmed })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_retry_failed(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let defaults = match load_defaults(conn) {
        Ok(d) => d,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    match notify::retry_failed(conn, defaults.retry_window_secs) {
        Ok(retried) => ok(&req.id, json!({ "retried": retried })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_list_by_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let status_raw = match required_str(req, "status") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(status) = NotificationStatus::parse(&status_raw) else {
        return err(&req.id, "bad_params", "unknown status", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT id, recipient_type, recipient_contact, channel, subject, priority,
                status, failure_reason, retry_of, student_id, escalation_id,
                created_ts, sent_ts, delivered_ts, read_ts
         FROM notifications WHERE status = ? ORDER BY created_ts",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([status.as_str()], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "recipientType": r.get::<_, String>(1)?,
                "recipientContact": r.get::<_, String>(2)?,
                "channel": r.get::<_, String>(3)?,
                "subject": r.get::<_, String>(4)?,
                "priority": r.get::<_, String>(5)?,
                "status": r.get::<_, String>(6)?,
                "failureReason": r.get::<_, Option<String>>(7)?,
                "retryOf": r.get::<_, Option<String>>(8)?,
                "studentId": r.get::<_, Option<String>>(9)?,
                "escalationId": r.get::<_, Option<String>>(10)?,
                "createdTs": r.get::<_, i64>(11)?,
                "sentTs": r.get::<_, Option<i64>>(12)?,
                "deliveredTs": r.get::<_, Option<i64>>(13)?,
                "readTs": r.get::<_, Option<i64>>(14)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(notifications) => ok(&req.id, json!({ "notifications": notifications })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_templates_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let channel = match required_str(req, "channel") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if Channel::parse_template(&channel).is_none() {
        return err(&req.id, "bad_params", "unknown channel", None);
    }
    let subject_template = match required_str(req, "subjectTemplate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let message_template = match required_str(req, "messageTemplate") {
        Ok(v) => v,
        Err(e) => return e,
    };

    if let Err(e) = conn.execute(
        "INSERT INTO notification_templates(name, channel, subject_template, message_template)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(name) DO UPDATE SET
            channel = excluded.channel,
            subject_template = excluded.subject_template,
            message_template = excluded.message_template",
        rusqlite::params![name, channel, subject_template, message_template],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_templates_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT name, channel, subject_template, message_template
         FROM notification_templates ORDER BY name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "name": r.get::<_, String>(0)?,
                "channel": r.get::<_, String>(1)?,
                "subjectTemplate": r.get::<_, String>(2)?,
                "messageTemplate": r.get::<_, String>(3)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(templates) => ok(&req.id, json!({ "templates": templates })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "notifications.send" => Some(handle_send(state, req)),
        "notifications.sendBulk" => Some(handle_send_bulk(state, req)),
        "notifications.sendTemplated" => Some(handle_send_templated(state, req)),
        "notifications.markRead" => Some(handle_mark_read(state, req)),
        "notifications.confirmDeliveries" => Some(handle_confirm_deliveries(state, req)),
        "notifications.retryFailed" => Some(handle_retry_failed(state, req)),
        "notifications.listByStatus" => Some(handle_list_by_status(state, req)),
        "templates.upsert" => Some(handle_templates_upsert(state, req)),
        "templates.list" => Some(handle_templates_list(state, req)),
        _ => None,
    }
}
