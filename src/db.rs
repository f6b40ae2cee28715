use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("counseling.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            grade TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            created_ts INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS term_grades(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            term_label TEXT NOT NULL,
            average REAL NOT NULL,
            recorded_ts INTEGER NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_term_grades_student ON term_grades(student_id, recorded_ts)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS behavior_incidents(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            category TEXT NOT NULL,
            description TEXT,
            occurred_on TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_behavior_incidents_student ON behavior_incidents(student_id, occurred_on)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_days(
            student_id TEXT NOT NULL,
            day TEXT NOT NULL,
            status TEXT NOT NULL,
            PRIMARY KEY(student_id, day),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS risk_assessments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            risk_level TEXT NOT NULL,
            overall_risk_score REAL NOT NULL,
            assessed_ts INTEGER NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_risk_assessments_student ON risk_assessments(student_id, assessed_ts)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS interventions(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            intervention_type TEXT NOT NULL,
            title TEXT NOT NULL,
            start_ts INTEGER NOT NULL,
            end_ts INTEGER,
            duration_days INTEGER,
            pre_academic REAL,
            pre_behavioral REAL,
            pre_attendance REAL,
            pre_social REAL,
            pre_risk_level TEXT,
            pre_captured_ts INTEGER,
            post_academic REAL,
            post_behavioral REAL,
            post_attendance REAL,
            post_social REAL,
            post_risk_level TEXT,
            post_captured_ts INTEGER,
            impact_academic REAL,
            impact_behavioral REAL,
            impact_attendance REAL,
            impact_social REAL,
            overall_effectiveness REAL,
            effectiveness_level TEXT NOT NULL DEFAULT 'PENDING',
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_interventions_student ON interventions(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_interventions_type ON interventions(intervention_type)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications(
            id TEXT PRIMARY KEY,
            recipient_type TEXT NOT NULL,
            recipient_contact TEXT NOT NULL,
            channel TEXT NOT NULL,
            subject TEXT NOT NULL,
            message TEXT NOT NULL,
            student_id TEXT,
            alert_id TEXT,
            intervention_id TEXT,
            escalation_id TEXT,
            priority TEXT NOT NULL,
            status TEXT NOT NULL,
            failure_reason TEXT,
            retry_of TEXT,
            created_ts INTEGER NOT NULL,
            sent_ts INTEGER,
            delivered_ts INTEGER,
            read_ts INTEGER
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notifications_status ON notifications(status, created_ts)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notifications_escalation ON notifications(escalation_id)",
        [],
    )?;
    ensure_notifications_retry_of(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notification_templates(
            name TEXT PRIMARY KEY,
            channel TEXT NOT NULL,
            subject_template TEXT NOT NULL,
            message_template TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS escalations(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            alert_id TEXT,
            intervention_id TEXT,
            escalation_type TEXT NOT NULL,
            risk_level TEXT,
            trigger_reason TEXT NOT NULL,
            current_level TEXT NOT NULL,
            escalated_to TEXT NOT NULL,
            status TEXT NOT NULL,
            escalated_ts INTEGER NOT NULL,
            rung_ts INTEGER NOT NULL,
            responded_by TEXT,
            responded_ts INTEGER,
            action_taken TEXT,
            resolution TEXT,
            notifications_sent TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_escalations_status ON escalations(status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_escalations_student ON escalations(student_id)",
        [],
    )?;
    ensure_escalations_rung_ts(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

// Workspaces created before retry tracking lack the retry_of column.
fn ensure_notifications_retry_of(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "notifications", "retry_of")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE notifications ADD COLUMN retry_of TEXT", [])?;
    Ok(())
}

// Earlier escalation rows timed unresponded-promotion from escalated_ts.
// rung_ts is the per-rung clock; backfill it from the trigger time.
fn ensure_escalations_rung_ts(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "escalations", "rung_ts")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE escalations ADD COLUMN rung_ts INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    conn.execute(
        "UPDATE escalations SET rung_ts = escalated_ts WHERE rung_ts = 0",
        [],
    )?;
    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        None => Ok(None),
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
