use crate::ipc::helpers::{ensure_remote, get_required_str, require_remote, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};

const RESOURCES: &[&str] = &["classes", "cursos", "disciplinas", "semestres", "professores"];

fn query_params(v: Option<&Value>) -> Result<Vec<(String, String)>, HandlerErr> {
    let Some(v) = v.filter(|v| !v.is_null()) else {
        return Ok(Vec::new());
    };
    let Some(obj) = v.as_object() else {
        return Err(HandlerErr::bad_params("params must be an object"));
    };
    let mut out = Vec::with_capacity(obj.len());
    for (k, v) in obj {
        if k == "cursor" {
            return Err(HandlerErr::bad_params("cursor is managed by the daemon"));
        }
        let s = match v {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => {
                return Err(HandlerErr::bad_params(format!(
                    "params.{} must be a scalar",
                    k
                )))
            }
        };
        out.push((k.clone(), s));
    }
    Ok(out)
}

fn list(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let resource = get_required_str(params, "resource")?;
    if !RESOURCES.contains(&resource.as_str()) {
        return Err(HandlerErr::bad_params(format!(
            "resource must be one of: {}",
            RESOURCES.join(", ")
        )));
    }
    let query = query_params(params.get("params"))?;
    ensure_remote(state)?;
    let remote = require_remote(state)?;
    let items: Vec<Value> = remote
        .list_all(&resource, &query)
        .map_err(HandlerErr::remote)?;
    Ok(json!({ "resource": resource, "count": items.len(), "items": items }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "catalog.list" => Some(respond(&req.id, list(state, &req.params))),
        _ => None,
    }
}
