use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Notifications,
    Escalation,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "notifications" => Some(Self::Notifications),
            "escalation" => Some(Self::Escalation),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Notifications => "setup.notifications",
            Self::Escalation => "setup.escalation",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Notifications => json!({
            "deliveryConfirmSeconds": 5,
            "retryWindowHours": 24
        }),
        SetupSection::Escalation => json!({
            "criticalThresholdHours": 2,
            "defaultThresholdHours": 24,
            "counselorContact": "counselor@school.example",
            "assistantPrincipalContact": "assistant.principal@school.example",
            "principalContact": "principal@school.example"
        }),
    }
}

fn load_section_map(conn: &Connection, key: &str, defaults: Value) -> anyhow::Result<Value> {
    let mut merged = defaults;
    if let Some(stored) = db::settings_get_json(conn, key)? {
        if let (Some(out), Some(obj)) = (merged.as_object_mut(), stored.as_object()) {
            for (k, v) in obj {
                out.insert(k.clone(), v.clone());
            }
        }
    }
    Ok(merged)
}

fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    load_section_map(conn, section.key(), default_section(section))
}

// Patches may only touch known keys, and each value must keep the default's
// JSON type.
fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let defaults = default_section(section);
    let defaults = defaults.as_object().expect("defaults are objects");
    let out = current
        .as_object_mut()
        .ok_or_else(|| "setup section must be a JSON object".to_string())?;
    for (k, v) in patch {
        let Some(default_value) = defaults.get(k) else {
            return Err(format!("unknown key: {}", k));
        };
        let type_matches = (default_value.is_number() && v.is_number())
            || (default_value.is_string() && v.is_string())
            || (default_value.is_boolean() && v.is_boolean());
        if !type_matches {
            return Err(format!("wrong type for {}", k));
        }
        out.insert(k.clone(), v.clone());
    }
    Ok(())
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let notifications = match load_section(conn, SetupSection::Notifications) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let escalation = match load_section(conn, SetupSection::Escalation) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(
        &req.id,
        json!({
            "notifications": notifications,
            "escalation": escalation
        }),
    )
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
