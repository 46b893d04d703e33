use crate::db;
use crate::ipc::handlers::curriculum::{parse_hour_overrides, parse_matrix};
use crate::ipc::helpers::{require_db, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

const DRAFT_KEY: &str = "wizard.draft";
const LAST_STEP: i64 = 5;

fn default_draft() -> Value {
    json!({
        "step": 0,
        "sessionId": null,
        "matrix": [],
        "hourOverrides": {}
    })
}

pub fn load_draft(conn: &Connection) -> anyhow::Result<Value> {
    let mut draft = default_draft();
    if let Some(saved) = db::settings_get_json(conn, DRAFT_KEY)? {
        if let Some(obj) = saved.as_object() {
            for (k, v) in obj {
                if let Err(e) = merge_field(&mut draft, k, v) {
                    tracing::warn!(field = %k, error = %e.message, "ignoring stored draft field");
                }
            }
        }
    }
    Ok(draft)
}

fn merge_field(draft: &mut Value, k: &str, v: &Value) -> Result<(), HandlerErr> {
    match k {
        "step" => {
            let Some(step) = v.as_i64().filter(|s| (0..=LAST_STEP).contains(s)) else {
                return Err(HandlerErr::bad_params(format!(
                    "step must be in 0..={}",
                    LAST_STEP
                )));
            };
            draft["step"] = json!(step);
        }
        "sessionId" => {
            if !(v.is_null() || v.is_string()) {
                return Err(HandlerErr::bad_params("sessionId must be string or null"));
            }
            draft["sessionId"] = v.clone();
        }
        "matrix" => {
            let rows = parse_matrix(v)?;
            draft["matrix"] = serde_json::to_value(rows)
                .map_err(|e| HandlerErr::bad_params(e.to_string()))?;
        }
        "hourOverrides" => {
            let ov = parse_hour_overrides(Some(v))?;
            draft["hourOverrides"] = json!(ov);
        }
        _ => return Err(HandlerErr::bad_params(format!("unknown draft field: {}", k))),
    }
    Ok(())
}

fn merge_patch(draft: &mut Value, patch: &Map<String, Value>) -> Result<(), HandlerErr> {
    for (k, v) in patch {
        merge_field(draft, k, v)?;
    }
    Ok(())
}

fn wizard_get(state: &mut AppState) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    load_draft(conn).map_err(HandlerErr::db_query)
}

fn wizard_save(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };
    let mut draft = load_draft(conn).map_err(HandlerErr::db_query)?;
    merge_patch(&mut draft, patch)?;
    db::settings_set_json(conn, DRAFT_KEY, &draft).map_err(HandlerErr::db_update)?;
    Ok(draft)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let res = match req.method.as_str() {
        "wizard.get" => wizard_get(state),
        "wizard.save" => wizard_save(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, res))
}
