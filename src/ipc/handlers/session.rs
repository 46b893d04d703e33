use crate::ipc::handlers::config;
use crate::ipc::helpers::{
    ensure_remote, get_optional_str, get_required_i64, get_required_str, require_remote, respond,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use chrono::{Duration, NaiveDate};
use serde_json::{json, Value};
use std::collections::HashSet;

const MIN_YEAR: i64 = 2000;
const MAX_YEAR: i64 = 2100;

fn parse_date(params: &Value, key: &str) -> Result<NaiveDate, HandlerErr> {
    let raw = get_required_str(params, key)?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .map_err(|_| HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key)))
}

fn parse_kind(raw: &str) -> Result<String, HandlerErr> {
    let k = raw.trim().to_ascii_uppercase();
    if k != "TRIMESTRE" && k != "SEMESTRE" {
        return Err(HandlerErr::bad_params(
            "tipo must be one of: TRIMESTRE, SEMESTRE",
        ));
    }
    Ok(k)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PeriodDraft {
    numero: i64,
    tipo: String,
    start: NaiveDate,
    end: NaiveDate,
}

impl PeriodDraft {
    fn to_json(&self) -> Value {
        json!({
            "numero": self.numero,
            "tipo": self.tipo,
            "dataInicio": self.start.format("%Y-%m-%d").to_string(),
            "dataFim": self.end.format("%Y-%m-%d").to_string(),
        })
    }

    fn to_wire(&self) -> Value {
        json!({
            "numero": self.numero,
            "tipo": self.tipo,
            "data_inicio": self.start.format("%Y-%m-%d").to_string(),
            "data_fim": self.end.format("%Y-%m-%d").to_string(),
        })
    }
}

/// Splits `[start, end]` into `count` contiguous periods. Leftover days go to
/// the earliest periods.
fn suggest_periods(
    start: NaiveDate,
    end: NaiveDate,
    count: i64,
    kind: &str,
) -> Result<Vec<PeriodDraft>, String> {
    if end <= start {
        return Err("dataInicio must be before dataFim".into());
    }
    if count < 1 {
        return Err("count must be >= 1".into());
    }
    let total_days = (end - start).num_days() + 1;
    if total_days < count {
        return Err(format!(
            "session spans {} days, cannot split into {} periods",
            total_days, count
        ));
    }
    let base = total_days / count;
    let rem = total_days % count;

    let mut out = Vec::with_capacity(count as usize);
    let mut cursor = start;
    for i in 0..count {
        let len = base + if i < rem { 1 } else { 0 };
        let period_end = cursor + Duration::days(len - 1);
        out.push(PeriodDraft {
            numero: i + 1,
            tipo: kind.to_string(),
            start: cursor,
            end: period_end,
        });
        cursor = period_end + Duration::days(1);
    }
    Ok(out)
}

fn validate_periods(mut periods: Vec<PeriodDraft>) -> Result<Vec<PeriodDraft>, String> {
    if periods.is_empty() {
        return Err("periods must not be empty".into());
    }
    let mut numbers = HashSet::new();
    for p in &periods {
        if p.numero < 1 {
            return Err(format!("period numero must be >= 1 (got {})", p.numero));
        }
        if !numbers.insert(p.numero) {
            return Err(format!("duplicate period numero {}", p.numero));
        }
        if p.end < p.start {
            return Err(format!("period {} ends before it starts", p.numero));
        }
    }
    periods.sort_by_key(|p| p.start);
    for w in periods.windows(2) {
        if w[1].start <= w[0].end {
            return Err(format!(
                "periods {} and {} overlap",
                w[0].numero, w[1].numero
            ));
        }
    }
    Ok(periods)
}

fn session_upsert(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ano_inicio = get_required_i64(params, "anoInicio")?;
    if !(MIN_YEAR..=MAX_YEAR).contains(&ano_inicio) {
        return Err(HandlerErr::bad_params(format!(
            "anoInicio must be in {}..={}",
            MIN_YEAR, MAX_YEAR
        )));
    }
    let ano_fim = match params.get("anoFim") {
        None | Some(Value::Null) => ano_inicio + 1,
        Some(_) => get_required_i64(params, "anoFim")?,
    };
    if ano_fim != ano_inicio && ano_fim != ano_inicio + 1 {
        return Err(HandlerErr::bad_params(
            "anoFim must equal anoInicio or anoInicio + 1",
        ));
    }
    let start = parse_date(params, "dataInicio")?;
    let end = parse_date(params, "dataFim")?;
    if start >= end {
        return Err(HandlerErr::bad_params("dataInicio must be before dataFim"));
    }
    let ativo = params.get("ativo").and_then(|v| v.as_bool()).unwrap_or(true);

    let ano = if ano_fim == ano_inicio {
        ano_inicio.to_string()
    } else {
        format!("{}/{}", ano_inicio, ano_fim)
    };
    let body = json!({
        "ano": ano,
        "data_inicio": start.format("%Y-%m-%d").to_string(),
        "data_fim": end.format("%Y-%m-%d").to_string(),
        "ativo": ativo,
    });

    ensure_remote(state)?;
    let remote = require_remote(state)?;
    let data = remote.upsert_session(&body).map_err(HandlerErr::remote)?;
    tracing::info!(%ano, "academic year upserted");
    Ok(json!({ "ano": ano, "session": data }))
}

fn periods_suggest(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let wizard = config::wizard_settings(state.db.as_ref()).map_err(HandlerErr::db_query)?;
    let start = parse_date(params, "dataInicio")?;
    let end = parse_date(params, "dataFim")?;
    let count = match params.get("count") {
        None | Some(Value::Null) => wizard.get("periodCount").and_then(|v| v.as_i64()).unwrap_or(3),
        Some(_) => get_required_i64(params, "count")?,
    };
    if !(1..=6).contains(&count) {
        return Err(HandlerErr::bad_params("count must be in 1..=6"));
    }
    let kind = match get_optional_str(params, "kind") {
        Some(k) => parse_kind(&k)?,
        None => wizard
            .get("periodKind")
            .and_then(|v| v.as_str())
            .unwrap_or("TRIMESTRE")
            .to_string(),
    };
    let periods = suggest_periods(start, end, count, &kind).map_err(HandlerErr::bad_params)?;
    Ok(json!({
        "periods": periods.iter().map(PeriodDraft::to_json).collect::<Vec<_>>()
    }))
}

fn parse_period(v: &Value) -> Result<PeriodDraft, HandlerErr> {
    let numero = get_required_i64(v, "numero")?;
    let tipo = parse_kind(&get_required_str(v, "tipo")?)?;
    let start = parse_date(v, "dataInicio")?;
    let end = parse_date(v, "dataFim")?;
    Ok(PeriodDraft {
        numero,
        tipo,
        start,
        end,
    })
}

fn periods_upsert_bulk(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let Some(raw) = params.get("periods").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("periods must be an array"));
    };
    let parsed = raw
        .iter()
        .map(parse_period)
        .collect::<Result<Vec<_>, _>>()?;
    let periods = validate_periods(parsed).map_err(HandlerErr::bad_params)?;

    let body = json!({
        "session_id": session_id,
        "items": periods.iter().map(PeriodDraft::to_wire).collect::<Vec<_>>(),
    });
    ensure_remote(state)?;
    let remote = require_remote(state)?;
    let data = remote.upsert_periods(&body).map_err(HandlerErr::remote)?;
    tracing::info!(session = %session_id, count = periods.len(), "periods upserted");
    Ok(json!({ "count": periods.len(), "result": data }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let res = match req.method.as_str() {
        "session.upsert" => session_upsert(state, &req.params),
        "periods.suggest" => periods_suggest(state, &req.params),
        "periods.upsertBulk" => periods_upsert_bulk(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, res))
}
