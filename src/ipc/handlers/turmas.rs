use crate::curriculum::{
    available_slots, capacity_warnings, group_matrix, normalize_turno, selected_turnos,
    CapacityWarning, MatrixRow,
};
use crate::db;
use crate::ipc::handlers::curriculum::{build_plans, selection_from};
use crate::ipc::helpers::{
    ensure_remote, get_optional_str, require_db, require_remote, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};

struct CapacityReport {
    available: i64,
    warnings: Vec<CapacityWarning>,
    error: Option<String>,
}

impl CapacityReport {
    fn failed(message: String) -> Self {
        Self {
            available: 0,
            warnings: Vec::new(),
            error: Some(message),
        }
    }

    fn to_json(&self) -> Value {
        let mut out = json!({
            "available": self.available,
            "warnings": self.warnings,
        });
        if let Some(e) = &self.error {
            out["capacityError"] = json!(e);
        }
        out
    }
}

fn check_capacity(
    state: &mut AppState,
    matrix: &[MatrixRow],
    overrides: &BTreeMap<String, i64>,
) -> Result<CapacityReport, HandlerErr> {
    let groups = group_matrix(matrix);
    let plans = build_plans(state, &groups, overrides)?;
    ensure_remote(state)?;
    let remote = require_remote(state)?;
    let slots = remote.schedule_slots().map_err(HandlerErr::remote)?;
    let available = available_slots(&slots, &selected_turnos(&groups));
    let warnings = capacity_warnings(&plans, available);
    for w in &warnings {
        tracing::warn!(course = %w.course_key, class = %w.class_label, required = w.required, available, "weekly hours exceed schedule slots");
    }
    Ok(CapacityReport {
        available,
        warnings,
        error: None,
    })
}

fn capacity(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let (matrix, overrides) = selection_from(state, params)?;
    if matrix.is_empty() {
        return Err(HandlerErr::bad_params("matrix selects no classes"));
    }
    let report = check_capacity(state, &matrix, &overrides)?;
    Ok(report.to_json())
}

fn value_id(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn class_key(name: &str) -> String {
    name.trim().to_lowercase()
}

fn generate(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    require_db(state)?;
    let (matrix, overrides) = selection_from(state, params)?;
    if matrix.is_empty() {
        return Err(HandlerErr::bad_params("matrix selects no classes"));
    }
    let session_id = match get_optional_str(params, "sessionId") {
        Some(s) => Some(s),
        None => {
            let conn = require_db(state)?;
            crate::ipc::handlers::wizard::load_draft(conn)
                .map_err(HandlerErr::db_query)?
                .get("sessionId")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        }
    };

    // Advisory: generation proceeds even when the check itself fails.
    let report = match check_capacity(state, &matrix, &overrides) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(code = e.code, error = %e.message, "capacity check failed, generating anyway");
            CapacityReport::failed(e.message)
        }
    };

    ensure_remote(state)?;
    let conn = require_db(state)?;
    let remote = require_remote(state)?;
    let escola_id = remote.escola_id().to_string();

    let mut class_ids: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut items: Vec<Value> = Vec::new();
    let mut unresolved: Vec<Value> = Vec::new();
    let mut seen: HashSet<(String, String, String)> = HashSet::new();

    for row in &matrix {
        let course = row.course_key.trim().to_string();
        let class_label = row.class_label.trim().to_string();
        let turno = normalize_turno(&row.turno);
        if !seen.insert((course.clone(), class_key(&class_label), turno.clone())) {
            continue;
        }

        if !class_ids.contains_key(&course) {
            let Some(rec) =
                db::install_get(conn, &escola_id, &course).map_err(HandlerErr::db_query)?
            else {
                unresolved.push(json!({
                    "courseKey": course,
                    "classLabel": class_label,
                    "turno": turno,
                    "reason": "course_not_installed",
                }));
                continue;
            };
            let listed: Vec<Value> = remote
                .list_all(
                    "classes",
                    &[("curso_id".to_string(), rec.curso_id.clone())],
                )
                .map_err(HandlerErr::remote)?;
            let mut by_name = HashMap::new();
            for c in &listed {
                let name = c
                    .get("nome")
                    .or_else(|| c.get("name"))
                    .and_then(|v| v.as_str());
                if let (Some(id), Some(name)) = (c.get("id").and_then(value_id), name) {
                    by_name.entry(class_key(name)).or_insert(id);
                }
            }
            tracing::debug!(course = %course, classes = by_name.len(), "classes resolved");
            class_ids.insert(course.clone(), by_name);
        }

        match class_ids
            .get(&course)
            .and_then(|m| m.get(&class_key(&class_label)))
        {
            Some(class_id) => items.push(json!({
                "classId": class_id,
                "turno": turno,
                "quantidade": row.quantidade.unwrap_or(1),
            })),
            None => unresolved.push(json!({
                "courseKey": course,
                "classLabel": class_label,
                "turno": turno,
                "reason": "class_not_found",
            })),
        }
    }

    if items.is_empty() {
        return Err(HandlerErr::bad_params("no matrix row resolved to a class")
            .with_details(json!({ "unresolved": unresolved })));
    }

    let body = json!({
        "session_id": session_id,
        "items": items,
    });
    let result = remote.generate_turmas(&body).map_err(HandlerErr::remote)?;
    tracing::info!(
        items = items.len(),
        unresolved = unresolved.len(),
        warnings = report.warnings.len(),
        "turmas generated"
    );
    Ok(json!({
        "capacity": report.to_json(),
        "warnings": report.warnings,
        "unresolved": unresolved,
        "requested": items,
        "result": result,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let res = match req.method.as_str() {
        "capacity.check" => capacity(state, &req.params),
        "turmas.generate" => generate(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, res))
}
