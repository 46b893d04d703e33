use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::remote::RemoteConfig;
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ConfigSection {
    Connection,
    Wizard,
}

impl ConfigSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "connection" => Some(Self::Connection),
            "wizard" => Some(Self::Wizard),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Connection => "config.connection",
            Self::Wizard => "config.wizard",
        }
    }
}

fn default_section(section: ConfigSection) -> Value {
    match section {
        ConfigSection::Connection => json!({
            "apiBaseUrl": "",
            "dataBaseUrl": null,
            "dataApiKey": null,
            "accessToken": null,
            "escolaId": "",
            "timeoutSecs": 30
        }),
        ConfigSection::Wizard => json!({
            "periodKind": "TRIMESTRE",
            "periodCount": 3,
            "autoPublish": true,
            "defaultShift": "M"
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal config object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn parse_nullable_string_max(v: &Value, key: &str, max_len: usize) -> Result<Value, String> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    let s = parse_string_max(v, key, max_len)?;
    if s.is_empty() {
        return Ok(Value::Null);
    }
    Ok(Value::String(s))
}

fn parse_url(v: &Value, key: &str) -> Result<String, String> {
    let s = parse_string_max(v, key, 512)?;
    if !s.is_empty() && !s.starts_with("http://") && !s.starts_with("https://") {
        return Err(format!("{} must start with http:// or https://", key));
    }
    Ok(s.trim_end_matches('/').to_string())
}

fn merge_section_field(
    section: ConfigSection,
    obj: &mut Map<String, Value>,
    k: &str,
    v: &Value,
) -> Result<(), String> {
    match section {
        ConfigSection::Connection => match k {
            "apiBaseUrl" => {
                obj.insert(k.to_string(), Value::String(parse_url(v, k)?));
            }
            "dataBaseUrl" => {
                let parsed = if v.is_null() {
                    Value::Null
                } else {
                    let s = parse_url(v, k)?;
                    if s.is_empty() {
                        Value::Null
                    } else {
                        Value::String(s)
                    }
                };
                obj.insert(k.to_string(), parsed);
            }
            "dataApiKey" | "accessToken" => {
                obj.insert(k.to_string(), parse_nullable_string_max(v, k, 4096)?);
            }
            "escolaId" => {
                let s = parse_string_max(v, k, 64)?;
                if s.contains('/') {
                    return Err("escolaId must not contain '/'".into());
                }
                obj.insert(k.to_string(), Value::String(s));
            }
            "timeoutSecs" => {
                obj.insert(k.to_string(), Value::from(parse_i64_range(v, k, 1, 300)?));
            }
            _ => return Err(format!("unknown connection field: {}", k)),
        },
        ConfigSection::Wizard => match k {
            "periodKind" => {
                let s = parse_string_max(v, k, 16)?.to_ascii_uppercase();
                if s != "TRIMESTRE" && s != "SEMESTRE" {
                    return Err("periodKind must be one of: TRIMESTRE, SEMESTRE".into());
                }
                obj.insert(k.to_string(), Value::String(s));
            }
            "periodCount" => {
                obj.insert(k.to_string(), Value::from(parse_i64_range(v, k, 1, 6)?));
            }
            "autoPublish" => {
                obj.insert(k.to_string(), Value::Bool(parse_bool(v, k)?));
            }
            "defaultShift" => {
                let s = parse_string_max(v, k, 4)?.to_ascii_uppercase();
                if s != "M" && s != "T" && s != "N" {
                    return Err("defaultShift must be one of: M, T, N".into());
                }
                obj.insert(k.to_string(), Value::String(s));
            }
            _ => return Err(format!("unknown wizard field: {}", k)),
        },
    }
    Ok(())
}

fn merge_section_patch(
    section: ConfigSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        merge_section_field(section, obj, k, v)?;
    }
    Ok(())
}

/// Applies a stored section field by field. A field that no longer validates
/// keeps its default; the rest still apply.
fn apply_stored(section: ConfigSection, current: &mut Value, saved: &Map<String, Value>) {
    let Some(obj) = current.as_object_mut() else {
        return;
    };
    for (k, v) in saved {
        if let Err(msg) = merge_section_field(section, obj, k, v) {
            tracing::warn!(section = section.key(), field = %k, error = %msg, "ignoring stored config field");
        }
    }
}

pub fn load_section(conn: Option<&Connection>, section: ConfigSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    let Some(conn) = conn else {
        return Ok(current);
    };
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            apply_stored(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

fn non_empty(v: Option<&Value>) -> Option<String> {
    v.and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Connection settings with environment fallbacks for unset fields.
/// Returns `None` while the API base URL or school id is still missing.
pub fn remote_config(conn: Option<&Connection>) -> anyhow::Result<Option<RemoteConfig>> {
    let section = load_section(conn, ConfigSection::Connection)?;
    let field = |key: &str, env: &str| non_empty(section.get(key)).or_else(|| env_value(env));

    let Some(api_base_url) = field("apiBaseUrl", "ESCOLAD_API_URL") else {
        return Ok(None);
    };
    let Some(escola_id) = field("escolaId", "ESCOLAD_ESCOLA_ID") else {
        return Ok(None);
    };
    Ok(Some(RemoteConfig {
        api_base_url,
        data_base_url: field("dataBaseUrl", "ESCOLAD_DATA_URL"),
        data_api_key: field("dataApiKey", "ESCOLAD_DATA_KEY"),
        access_token: field("accessToken", "ESCOLAD_TOKEN"),
        escola_id,
        timeout_secs: section
            .get("timeoutSecs")
            .and_then(|v| v.as_u64())
            .unwrap_or(30),
    }))
}

pub fn wizard_settings(conn: Option<&Connection>) -> anyhow::Result<Value> {
    load_section(conn, ConfigSection::Wizard)
}

fn redact(mut connection: Value) -> Value {
    for key in ["dataApiKey", "accessToken"] {
        if let Some(v) = connection.get_mut(key) {
            if v.is_string() {
                *v = Value::String("***".into());
            }
        }
    }
    connection
}

fn handle_config_get(state: &mut AppState, req: &Request) -> Value {
    let conn = state.db.as_ref();
    let connection = match load_section(conn, ConfigSection::Connection) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let wizard = match load_section(conn, ConfigSection::Wizard) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(
        &req.id,
        json!({
            "connection": redact(connection),
            "wizard": wizard
        }),
    )
}

fn handle_config_update(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = ConfigSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(Some(conn), section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if section == ConfigSection::Connection {
        state.reset_remote();
    }
    tracing::info!(section = section_raw, "config updated");
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "config.get" => Some(handle_config_get(state, req)),
        "config.update" => Some(handle_config_update(state, req)),
        _ => None,
    }
}
