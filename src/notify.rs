use crate::db;
use rusqlite::Connection;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Email,
    Sms,
    Push,
    InApp,
}

impl Channel {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "EMAIL" => Some(Self::Email),
            "SMS" => Some(Self::Sms),
            "PUSH" => Some(Self::Push),
            "IN_APP" => Some(Self::InApp),
            _ => None,
        }
    }

    /// Template rows may carry the legacy catch-all channel; ALL collapses to
    /// EMAIL at send time.
    pub fn parse_template(s: &str) -> Option<Self> {
        if s == "ALL" {
            return Some(Self::Email);
        }
        Self::parse(s)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "EMAIL",
            Self::Sms => "SMS",
            Self::Push => "PUSH",
            Self::InApp => "IN_APP",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LOW" => Some(Self::Low),
            "NORMAL" => Some(Self::Normal),
            "HIGH" => Some(Self::High),
            "URGENT" => Some(Self::Urgent),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Normal => "NORMAL",
            Self::High => "HIGH",
            Self::Urgent => "URGENT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
    Read,
}

impl NotificationStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "SENT" => Some(Self::Sent),
            "DELIVERED" => Some(Self::Delivered),
            "FAILED" => Some(Self::Failed),
            "READ" => Some(Self::Read),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Sent => "SENT",
            Self::Delivered => "DELIVERED",
            Self::Failed => "FAILED",
            Self::Read => "READ",
        }
    }

    /// Forward-only lifecycle. FAILED and READ are terminal; READ is only
    /// reachable from DELIVERED.
    pub fn can_advance_to(self, next: NotificationStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Sent)
                | (Self::Pending, Self::Failed)
                | (Self::Sent, Self::Delivered)
                | (Self::Sent, Self::Failed)
                | (Self::Delivered, Self::Read)
        )
    }
}

#[derive(Debug, Clone)]
pub struct NotificationRequest {
    pub recipient_type: String,
    pub recipient_contact: String,
    pub channel: Channel,
    pub subject: String,
    pub message: String,
    pub priority: Priority,
    pub student_id: Option<String>,
    pub alert_id: Option<String>,
    pub intervention_id: Option<String>,
    pub escalation_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub notification_id: String,
    pub status: NotificationStatus,
    pub failure_reason: Option<String>,
}

/// Records intent and walks the status machine. Dispatch failure lands on the
/// record as FAILED, never as an error to the caller: only a failed insert is
/// an error here.
pub fn send(conn: &Connection, req: &NotificationRequest) -> anyhow::Result<SendOutcome> {
    send_attempt(conn, req, None)
}

fn send_attempt(
    conn: &Connection,
    req: &NotificationRequest,
    retry_of: Option<&str>,
) -> anyhow::Result<SendOutcome> {
    let id = Uuid::new_v4().to_string();
    let now = db::now_ts();
    conn.execute(
        "INSERT INTO notifications(
            id, recipient_type, recipient_contact, channel, subject, message,
            student_id, alert_id, intervention_id, escalation_id,
            priority, status, retry_of, created_ts
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'PENDING', ?, ?)",
        rusqlite::params![
            id,
            req.recipient_type,
            req.recipient_contact,
            req.channel.as_str(),
            req.subject,
            req.message,
            req.student_id,
            req.alert_id,
            req.intervention_id,
            req.escalation_id,
            req.priority.as_str(),
            retry_of,
            now,
        ],
    )?;

    match dispatch(req) {
        Ok(()) => {
            conn.execute(
                "UPDATE notifications SET status = 'SENT', sent_ts = ? WHERE id = ?",
                (now, &id),
            )?;
            Ok(SendOutcome {
                notification_id: id,
                status: NotificationStatus::Sent,
                failure_reason: None,
            })
        }
        Err(reason) => {
            conn.execute(
                "UPDATE notifications SET status = 'FAILED', failure_reason = ? WHERE id = ?",
                (&reason, &id),
            )?;
            Ok(SendOutcome {
                notification_id: id,
                status: NotificationStatus::Failed,
                failure_reason: Some(reason),
            })
        }
    }
}

// Transmission itself happens out of process; dispatch only vets the intent
// enough to catch records no transport could ever deliver.
fn dispatch(req: &NotificationRequest) -> Result<(), String> {
    let contact = req.recipient_contact.trim();
    if contact.is_empty() {
        return Err("empty recipient contact".to_string());
    }
    if req.channel == Channel::Email && !contact.contains('@') {
        return Err(format!("invalid email address: {}", contact));
    }
    Ok(())
}

/// Literal {{key}} substitution. Unknown placeholders stay in the output;
/// supplying extra variables is harmless.
pub fn render_template(template: &str, vars: &serde_json::Map<String, serde_json::Value>) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        let needle = format!("{{{{{}}}}}", key);
        let replacement = match value.as_str() {
            Some(s) => s.to_string(),
            None => value.to_string(),
        };
        out = out.replace(&needle, &replacement);
    }
    out
}

/// Durable stand-in for the async delivery-confirmation callback: promote
/// SENT rows that have aged past the configured delay.
pub fn confirm_deliveries(conn: &Connection, min_age_secs: i64) -> anyhow::Result<i64> {
    let now = db::now_ts();
    let changed = conn.execute(
        "UPDATE notifications
         SET status = 'DELIVERED', delivered_ts = ?
         WHERE status = 'SENT' AND sent_ts <= ?",
        (now, now - min_age_secs),
    )?;
    Ok(changed as i64)
}

/// One fresh attempt per FAILED record inside the window; the FAILED row is a
/// terminal audit entry and is never itself revived. Rows that already have a
/// retry attempt are skipped.
pub fn retry_failed(conn: &Connection, window_secs: i64) -> anyhow::Result<i64> {
    let now = db::now_ts();
    let mut stmt = conn.prepare(
        "SELECT id, recipient_type, recipient_contact, channel, subject, message,
                student_id, alert_id, intervention_id, escalation_id, priority
         FROM notifications
         WHERE status = 'FAILED'
           AND created_ts >= ?
           AND id NOT IN (SELECT retry_of FROM notifications WHERE retry_of IS NOT NULL)
         ORDER BY created_ts",
    )?;
    let rows: Vec<(String, NotificationRequest)> = stmt
        .query_map([now - window_secs], |r| {
            let channel: String = r.get(3)?;
            let priority: String = r.get(10)?;
            Ok((
                r.get::<_, String>(0)?,
                NotificationRequest {
                    recipient_type: r.get(1)?,
                    recipient_contact: r.get(2)?,
                    channel: Channel::parse(&channel).unwrap_or(Channel::Email),
                    subject: r.get(4)?,
                    message: r.get(5)?,
                    student_id: r.get(6)?,
                    alert_id: r.get(7)?,
                    intervention_id: r.get(8)?,
                    escalation_id: r.get(9)?,
                    priority: Priority::parse(&priority).unwrap_or(Priority::Normal),
                },
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut retried = 0i64;
    for (failed_id, req) in rows {
        send_attempt(conn, &req, Some(&failed_id))?;
        retried += 1;
    }
    Ok(retried)
}
