use rusqlite::Connection;
use serde_json::Value;

use crate::ipc::error::err;
use crate::ipc::handlers::config;
use crate::ipc::types::AppState;
use crate::remote::Remote;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn remote(e: anyhow::Error) -> Self {
        Self::new("remote_failed", format!("{e:#}"))
    }

    pub fn db_query(e: impl std::fmt::Display) -> Self {
        Self::new("db_query_failed", e.to_string())
    }

    pub fn db_update(e: impl std::fmt::Display) -> Self {
        Self::new("db_update_failed", e.to_string())
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn respond(id: &str, res: Result<Value, HandlerErr>) -> Value {
    match res {
        Ok(v) => crate::ipc::error::ok(id, v),
        Err(e) => e.response(id),
    }
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn get_required_i64(params: &Value, key: &str) -> Result<i64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be integer", key)))
}

pub fn require_db(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

/// Builds the remote client on first use from the stored connection settings.
pub fn ensure_remote(state: &mut AppState) -> Result<(), HandlerErr> {
    if state.remote.is_some() {
        return Ok(());
    }
    let cfg = config::remote_config(state.db.as_ref()).map_err(HandlerErr::db_query)?;
    let Some(cfg) = cfg else {
        return Err(HandlerErr::new(
            "not_configured",
            "connection.apiBaseUrl and connection.escolaId must be set",
        ));
    };
    let remote = Remote::new(cfg).map_err(HandlerErr::remote)?;
    tracing::info!(
        api = %remote.config().api_base_url,
        escola = %remote.escola_id(),
        "remote client ready"
    );
    state.remote = Some(remote);
    Ok(())
}

pub fn require_remote(state: &AppState) -> Result<&Remote, HandlerErr> {
    state
        .remote
        .as_ref()
        .ok_or_else(|| HandlerErr::new("not_configured", "remote client unavailable"))
}
