use crate::ipc::helpers::{ensure_remote, get_required_i64, get_required_str, require_remote, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};
use std::collections::HashSet;

const FREQUENCY_MODELS: &[&str] = &["POR_AULA", "POR_PERIODO"];
const EVALUATION_MODELS: &[&str] = &["SIMPLIFICADO", "ANGOLA_PADRAO", "PERSONALIZADO"];

fn one_of(raw: &str, key: &str, allowed: &[&str]) -> Result<String, HandlerErr> {
    let v = raw.trim().to_ascii_uppercase();
    if !allowed.contains(&v.as_str()) {
        return Err(HandlerErr::bad_params(format!(
            "{} must be one of: {}",
            key,
            allowed.join(", ")
        )));
    }
    Ok(v)
}

fn parse_components(v: Option<&Value>) -> Result<Vec<Value>, HandlerErr> {
    let Some(items) = v.and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("componentes must be an array"));
    };
    if items.is_empty() {
        return Err(HandlerErr::bad_params("componentes must not be empty"));
    }
    let mut seen = HashSet::new();
    let mut total = 0;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let code = get_required_str(item, "code")?.to_ascii_uppercase();
        if !seen.insert(code.clone()) {
            return Err(HandlerErr::bad_params(format!("duplicate componente {}", code)));
        }
        let peso = get_required_i64(item, "peso")?;
        if !(0..=100).contains(&peso) {
            return Err(HandlerErr::bad_params(format!(
                "peso of {} must be in 0..=100",
                code
            )));
        }
        total += peso;
        out.push(json!({ "code": code, "peso": peso }));
    }
    if total != 100 {
        return Err(HandlerErr::bad_params(format!(
            "componente pesos must sum to 100 (got {})",
            total
        ))
        .with_details(json!({ "total": total })));
    }
    Ok(out)
}

fn preferences_get(state: &mut AppState) -> Result<Value, HandlerErr> {
    ensure_remote(state)?;
    let remote = require_remote(state)?;
    remote.get_preferences().map_err(HandlerErr::remote)
}

fn preferences_save(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let frequencia_modelo = one_of(
        &get_required_str(params, "frequenciaModelo")?,
        "frequenciaModelo",
        FREQUENCY_MODELS,
    )?;
    let min_percent = get_required_i64(params, "frequenciaMinPercent")?;
    if !(0..=100).contains(&min_percent) {
        return Err(HandlerErr::bad_params(
            "frequenciaMinPercent must be in 0..=100",
        ));
    }
    let modelo_avaliacao = one_of(
        &get_required_str(params, "modeloAvaliacao")?,
        "modeloAvaliacao",
        EVALUATION_MODELS,
    )?;
    let componentes = parse_components(params.get("componentes"))?;

    let body = json!({
        "frequencia_modelo": frequencia_modelo,
        "frequencia_min_percent": min_percent,
        "modelo_avaliacao": modelo_avaliacao,
        "avaliacao_config": { "componentes": componentes },
    });
    ensure_remote(state)?;
    let remote = require_remote(state)?;
    let data = remote.save_preferences(&body).map_err(HandlerErr::remote)?;
    tracing::info!(%modelo_avaliacao, %frequencia_modelo, "evaluation preferences saved");
    Ok(json!({ "saved": body, "result": data }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let res = match req.method.as_str() {
        "preferences.get" => preferences_get(state),
        "preferences.save" => preferences_save(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, res))
}
