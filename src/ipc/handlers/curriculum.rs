use crate::curriculum::{
    group_matrix, payload_fingerprint, plan_group, resolve_blueprint, split_override_key,
    BlueprintRow, CourseGroup, GroupPlan, MatrixRow,
};
use crate::db;
use crate::ipc::handlers::{config, wizard};
use crate::ipc::helpers::{
    ensure_remote, get_optional_str, get_required_str, require_db, require_remote, respond,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub const MAX_WEEKLY_HOURS: i64 = 40;

/// Resolved blueprint for a preset, served from the session cache when present.
pub fn load_blueprint(
    state: &mut AppState,
    preset_key: &str,
    refresh: bool,
) -> Result<(Vec<BlueprintRow>, bool), HandlerErr> {
    if !refresh {
        if let Some(rows) = state.blueprints.get(preset_key) {
            return Ok((rows.clone(), true));
        }
    }
    ensure_remote(state)?;
    let remote = require_remote(state)?;
    let presets = remote
        .preset_subjects(preset_key)
        .map_err(HandlerErr::remote)?;
    let ids: Vec<String> = presets.iter().map(|p| p.id.clone()).collect();
    let overrides = remote.subject_overrides(&ids).map_err(HandlerErr::remote)?;
    let rows = resolve_blueprint(&presets, &overrides);
    tracing::debug!(
        preset = preset_key,
        presets = presets.len(),
        overrides = overrides.len(),
        resolved = rows.len(),
        "blueprint resolved"
    );
    state.blueprints.insert(preset_key.to_string(), rows.clone());
    Ok((rows, false))
}

pub fn parse_matrix(v: &Value) -> Result<Vec<MatrixRow>, HandlerErr> {
    let rows: Vec<MatrixRow> = serde_json::from_value(v.clone())
        .map_err(|e| HandlerErr::bad_params(format!("matrix: {e}")))?;
    for (i, r) in rows.iter().enumerate() {
        if r.course_key.trim().is_empty() || r.class_label.trim().is_empty() || r.turno.trim().is_empty() {
            return Err(HandlerErr::bad_params(format!(
                "matrix[{}] needs courseKey, classLabel and turno",
                i
            )));
        }
        if let Some(q) = r.quantidade {
            if !(1..=20).contains(&q) {
                return Err(HandlerErr::bad_params(format!(
                    "matrix[{}].quantidade must be in 1..=20",
                    i
                )));
            }
        }
    }
    Ok(rows)
}

pub fn parse_hour_overrides(v: Option<&Value>) -> Result<BTreeMap<String, i64>, HandlerErr> {
    let mut out = BTreeMap::new();
    let Some(v) = v else {
        return Ok(out);
    };
    if v.is_null() {
        return Ok(out);
    }
    let Some(obj) = v.as_object() else {
        return Err(HandlerErr::bad_params("hourOverrides must be an object"));
    };
    for (k, hv) in obj {
        if split_override_key(k).is_none() {
            return Err(HandlerErr::bad_params(format!(
                "hourOverrides key {} must look like course::class::subject",
                k
            )));
        }
        let Some(h) = hv.as_i64() else {
            return Err(HandlerErr::bad_params(format!("hourOverrides[{}] must be integer", k)));
        };
        if !(0..=MAX_WEEKLY_HOURS).contains(&h) {
            return Err(HandlerErr::bad_params(format!(
                "hourOverrides[{}] must be in 0..={}",
                k, MAX_WEEKLY_HOURS
            )));
        }
        out.insert(k.clone(), h);
    }
    Ok(out)
}

/// Matrix and hour overrides from params, falling back to the saved draft.
pub fn selection_from(
    state: &AppState,
    params: &Value,
) -> Result<(Vec<MatrixRow>, BTreeMap<String, i64>), HandlerErr> {
    let draft = match state.db.as_ref() {
        Some(conn) => Some(wizard::load_draft(conn).map_err(HandlerErr::db_query)?),
        None => None,
    };
    let matrix = match params.get("matrix") {
        Some(m) if !m.is_null() => parse_matrix(m)?,
        _ => match &draft {
            Some(d) => parse_matrix(&d["matrix"])?,
            None => Vec::new(),
        },
    };
    let overrides = match params.get("hourOverrides") {
        Some(o) if !o.is_null() => parse_hour_overrides(Some(o))?,
        _ => parse_hour_overrides(draft.as_ref().and_then(|d| d.get("hourOverrides")))?,
    };
    Ok((matrix, overrides))
}

pub fn build_plans(
    state: &mut AppState,
    groups: &[CourseGroup],
    overrides: &BTreeMap<String, i64>,
) -> Result<Vec<GroupPlan>, HandlerErr> {
    let mut plans = Vec::with_capacity(groups.len());
    for g in groups {
        let (blueprint, _) = load_blueprint(state, &g.course_key, false)?;
        let plan = plan_group(g, &blueprint, overrides);
        if plan.subjects.is_empty() {
            tracing::warn!(course = %g.course_key, "no blueprint subjects for the selected classes");
        }
        plans.push(plan);
    }
    Ok(plans)
}

fn blueprint(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let preset_key = get_required_str(params, "presetKey")?;
    let refresh = params.get("refresh").and_then(|v| v.as_bool()).unwrap_or(false);
    let (rows, cached) = load_blueprint(state, &preset_key, refresh)?;
    Ok(json!({ "presetKey": preset_key, "cached": cached, "rows": rows }))
}

fn group_summary(plan: &GroupPlan, status: &str, curso_id: &str, version: i64, published: bool) -> Value {
    json!({
        "courseKey": plan.course_key,
        "status": status,
        "cursoId": curso_id,
        "version": version,
        "published": published,
        "subjectCount": plan.subjects.len(),
        "classTotals": plan.class_totals,
    })
}

/// Error for a group that stopped `curriculum.apply`. Earlier groups stay applied.
fn apply_failed(
    code: &'static str,
    course_key: &str,
    stage: &str,
    completed: &[Value],
    message: impl std::fmt::Display,
) -> HandlerErr {
    HandlerErr::new(code, format!("{}: {}", course_key, message)).with_details(json!({
        "failedCourse": course_key,
        "stage": stage,
        "completed": completed,
    }))
}

fn apply(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    require_db(state)?;
    let session_id = get_optional_str(params, "sessionId");
    let (matrix, overrides) = selection_from(state, params)?;
    let groups = group_matrix(&matrix);
    if groups.is_empty() {
        return Err(HandlerErr::bad_params("matrix selects no classes"));
    }

    let publish = match params.get("publish").and_then(|v| v.as_bool()) {
        Some(p) => p,
        None => config::wizard_settings(state.db.as_ref())
            .map_err(HandlerErr::db_query)?
            .get("autoPublish")
            .and_then(|v| v.as_bool())
            .unwrap_or(true),
    };

    ensure_remote(state)?;
    let plans = build_plans(state, &groups, &overrides)?;

    let conn = require_db(state)?;
    let remote = require_remote(state)?;
    let escola_id = remote.escola_id().to_string();

    let mut done: Vec<Value> = Vec::with_capacity(plans.len());
    for plan in &plans {
        let payload = plan.install_payload(session_id.as_deref());
        let fingerprint = payload_fingerprint(&payload);
        let previous = db::install_get(conn, &escola_id, &plan.course_key)
            .map_err(HandlerErr::db_query)?;

        let (curso_id, version, mut published, status) = match previous {
            Some(rec) if rec.fingerprint == fingerprint => {
                tracing::info!(course = %plan.course_key, curso = %rec.curso_id, "curriculum unchanged, skipping install");
                (rec.curso_id, rec.version, rec.published, "skipped")
            }
            _ => {
                tracing::info!(course = %plan.course_key, subjects = plan.subjects.len(), "installing curriculum preset");
                let res = remote.install_preset(&payload).map_err(|e| {
                    apply_failed("install_failed", &plan.course_key, "install", &done, format!("{e:#}"))
                })?;
                db::install_record(
                    conn,
                    &escola_id,
                    &plan.course_key,
                    &fingerprint,
                    &res.curso_id,
                    res.version,
                    &plan.class_totals_json(),
                )
                .map_err(|e| {
                    apply_failed("db_update_failed", &plan.course_key, "record", &done, format!("{e:#}"))
                })?;
                (res.curso_id, res.version, false, "installed")
            }
        };

        if publish && !published {
            remote.publish_curriculum(&curso_id, version).map_err(|e| {
                apply_failed("install_failed", &plan.course_key, "publish", &done, format!("{e:#}"))
            })?;
            db::install_mark_published(conn, &escola_id, &plan.course_key).map_err(|e| {
                apply_failed("db_update_failed", &plan.course_key, "record", &done, format!("{e:#}"))
            })?;
            published = true;
            tracing::info!(course = %plan.course_key, curso = %curso_id, version, "curriculum published");
        }

        done.push(group_summary(plan, status, &curso_id, version, published));
    }

    Ok(json!({ "groups": done }))
}

fn installs(state: &mut AppState) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let Some(cfg) = config::remote_config(Some(conn)).map_err(HandlerErr::db_query)? else {
        return Err(HandlerErr::new(
            "not_configured",
            "connection.escolaId must be set",
        ));
    };
    let rows = db::install_list(conn, &cfg.escola_id).map_err(HandlerErr::db_query)?;
    Ok(json!({ "installs": rows }))
}

fn publish(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let course_key = get_required_str(params, "courseKey")?;
    require_db(state)?;
    ensure_remote(state)?;
    let conn = require_db(state)?;
    let remote = require_remote(state)?;
    let escola_id = remote.escola_id().to_string();
    let Some(rec) = db::install_get(conn, &escola_id, &course_key).map_err(HandlerErr::db_query)?
    else {
        return Err(HandlerErr::new(
            "not_found",
            format!("course {} has no installed curriculum", course_key),
        ));
    };
    let data = remote
        .publish_curriculum(&rec.curso_id, rec.version)
        .map_err(HandlerErr::remote)?;
    db::install_mark_published(conn, &escola_id, &course_key).map_err(HandlerErr::db_update)?;
    tracing::info!(course = %course_key, curso = %rec.curso_id, version = rec.version, "curriculum published");
    Ok(json!({
        "courseKey": course_key,
        "cursoId": rec.curso_id,
        "version": rec.version,
        "result": data,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let res = match req.method.as_str() {
        "curriculum.blueprint" => blueprint(state, &req.params),
        "curriculum.apply" => apply(state, &req.params),
        "curriculum.installs" => installs(state),
        "curriculum.publish" => publish(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, res))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hour_overrides_validate_key_shape_and_range() {
        let ok = parse_hour_overrides(Some(&json!({ "CFB::10ª::Math": 6 })))
            .map_err(|e| e.message)
            .expect("valid");
        assert_eq!(ok.get("CFB::10ª::Math"), Some(&6));

        assert!(parse_hour_overrides(Some(&json!({ "CFB::Math": 6 }))).is_err());
        assert!(parse_hour_overrides(Some(&json!({ "CFB::10ª::Math": 41 }))).is_err());
        assert!(parse_hour_overrides(Some(&json!({ "CFB::10ª::Math": "6" }))).is_err());
        assert!(parse_hour_overrides(None).map_err(|e| e.message).expect("empty").is_empty());
    }

    #[test]
    fn ledger_write_failure_reports_progress() {
        let done = vec![json!({ "courseKey": "CFB", "status": "installed" })];
        let e = apply_failed("db_update_failed", "CEJ", "record", &done, "disk I/O error");
        assert_eq!(e.code, "db_update_failed");
        assert_eq!(e.message, "CEJ: disk I/O error");
        let details = e.details.expect("details");
        assert_eq!(details["failedCourse"], "CEJ");
        assert_eq!(details["stage"], "record");
        assert_eq!(details["completed"][0]["courseKey"], "CFB");
    }

    #[test]
    fn matrix_rows_need_all_fields() {
        let rows = parse_matrix(&json!([
            { "courseKey": "CFB", "classLabel": "10ª", "turno": "M", "quantidade": 2 }
        ]))
        .map_err(|e| e.message)
        .expect("valid");
        assert_eq!(rows[0].quantidade, Some(2));

        assert!(parse_matrix(&json!([{ "courseKey": "CFB", "classLabel": "", "turno": "M" }])).is_err());
        assert!(parse_matrix(&json!([{ "courseKey": "CFB", "classLabel": "10ª", "turno": "M", "quantidade": 0 }])).is_err());
    }
}
