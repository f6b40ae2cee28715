use crate::effectiveness::MetricsSnapshot;
use chrono::{Duration, NaiveDate};
use rusqlite::{Connection, OptionalExtension};

const NEUTRAL_MIDPOINT: f64 = 50.0;
const TRAILING_TERMS: usize = 3;
const TRAILING_DAYS: i64 = 30;

/// Pure read of a student's current standing across the four impact
/// dimensions. Missing data in any dimension falls back to a neutral default
/// (midpoint 50, or 100% attendance) instead of failing the caller; only
/// database errors propagate.
pub fn snapshot_for_student(
    conn: &Connection,
    student_id: &str,
    today: NaiveDate,
    now: i64,
) -> anyhow::Result<MetricsSnapshot> {
    let cutoff = (today - Duration::days(TRAILING_DAYS)).format("%Y-%m-%d").to_string();

    let academic = academic_average(conn, student_id)?.unwrap_or(NEUTRAL_MIDPOINT);
    let behavioral = behavior_score(conn, student_id, &cutoff)?;
    let attendance = attendance_rate(conn, student_id, &cutoff)?;
    let (risk_level, social_emotional) = match latest_risk(conn, student_id)? {
        Some((level, score)) => (level, 100.0 - score),
        None => ("NONE".to_string(), NEUTRAL_MIDPOINT),
    };

    Ok(MetricsSnapshot {
        academic,
        behavioral,
        attendance,
        social_emotional,
        risk_level,
        captured_ts: now,
    })
}

fn academic_average(conn: &Connection, student_id: &str) -> anyhow::Result<Option<f64>> {
    let mut stmt = conn.prepare(
        "SELECT average FROM term_grades
         WHERE student_id = ?
         ORDER BY recorded_ts DESC
         LIMIT ?",
    )?;
    let averages: Vec<f64> = stmt
        .query_map((student_id, TRAILING_TERMS as i64), |r| r.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    if averages.is_empty() {
        return Ok(None);
    }
    Ok(Some(averages.iter().sum::<f64>() / averages.len() as f64))
}

fn behavior_score(conn: &Connection, student_id: &str, cutoff: &str) -> anyhow::Result<f64> {
    let incidents: i64 = conn.query_row(
        "SELECT COUNT(*) FROM behavior_incidents
         WHERE student_id = ? AND occurred_on >= ?",
        (student_id, cutoff),
        |r| r.get(0),
    )?;
    Ok((100.0 - incidents as f64 * 10.0).max(0.0))
}

fn attendance_rate(conn: &Connection, student_id: &str, cutoff: &str) -> anyhow::Result<f64> {
    // Late still counts as present for the rate.
    let (total, absent): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(status = 'absent'), 0)
         FROM attendance_days
         WHERE student_id = ? AND day >= ?",
        (student_id, cutoff),
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    if total == 0 {
        return Ok(100.0);
    }
    Ok((total - absent) as f64 / total as f64 * 100.0)
}

fn latest_risk(conn: &Connection, student_id: &str) -> anyhow::Result<Option<(String, f64)>> {
    Ok(conn
        .query_row(
            "SELECT risk_level, overall_risk_score FROM risk_assessments
             WHERE student_id = ?
             ORDER BY assessed_ts DESC
             LIMIT 1",
            [student_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?)
}
