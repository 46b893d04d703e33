mod common;

use common::{envelope, failure, FakeApi, Hit, Sidecar};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn preset_rows(key: &str) -> Value {
    match key {
        "eq.CFB" => json!([
            { "id": 1, "subject_name": "Matemática", "class_label": "10ª", "weekly_hours": 4 },
            { "id": 2, "subject_name": "Biologia", "class_label": "10ª", "weekly_hours": 3 },
            { "id": 3, "subject_name": "Matemática", "class_label": "11ª", "weekly_hours": 4 }
        ]),
        "eq.CEJ" => json!([
            { "id": 10, "subject_name": "Direito", "class_label": "10ª", "weekly_hours": 5 }
        ]),
        _ => json!([]),
    }
}

fn school_api(fail_cej: Arc<AtomicBool>) -> FakeApi {
    FakeApi::start(move |hit: &Hit| match (hit.method.as_str(), hit.path.as_str()) {
        ("GET", "/rest/v1/curriculum_preset_subjects") => {
            (200, preset_rows(hit.param("preset_key").unwrap_or("")))
        }
        ("GET", "/rest/v1/escola_curriculum_overrides") => {
            let ids = hit.param("preset_subject_id").unwrap_or("");
            if hit.param("escola_id") == Some("eq.esc-1") && ids.contains('2') {
                (
                    200,
                    json!([{ "preset_subject_id": 2, "is_active": false }]),
                )
            } else {
                (200, json!([]))
            }
        }
        ("POST", "/api/escola/esc-1/admin/curriculo/install-preset") => {
            match hit.body["presetKey"].as_str() {
                Some("CFB") => envelope(json!({ "curso_id": "curso-cfb", "version": 1 })),
                Some("CEJ") if fail_cej.load(Ordering::SeqCst) => {
                    failure(500, "preset CEJ indisponível")
                }
                Some("CEJ") => envelope(json!({ "curso_id": "curso-cej", "version": 2 })),
                _ => failure(400, "unknown preset"),
            }
        }
        ("POST", "/api/escola/esc-1/admin/curriculo/publish") => {
            envelope(json!({ "published": true }))
        }
        _ => failure(404, "not found"),
    })
}

fn matrix() -> Value {
    json!([
        { "courseKey": "CFB", "classLabel": "10ª", "turno": "M", "quantidade": 2 },
        { "courseKey": "CFB", "classLabel": "10ª", "turno": "T" },
        { "courseKey": "CEJ", "classLabel": "10ª", "turno": "M" }
    ])
}

#[test]
fn blueprint_drops_inactive_subjects_and_is_cached() {
    let api = school_api(Arc::new(AtomicBool::new(false)));
    let mut sc = Sidecar::spawn();
    sc.connect("escolad-blueprint", &api);

    let first = sc.request_ok("curriculum.blueprint", json!({ "presetKey": "CFB" }));
    assert_eq!(first["cached"], false);
    assert_eq!(
        first["rows"],
        json!([
            { "subject": "Matemática", "classLabel": "10ª", "weeklyHours": 4 },
            { "subject": "Matemática", "classLabel": "11ª", "weeklyHours": 4 }
        ])
    );

    let presets = api.hits_to("/curriculum_preset_subjects");
    assert_eq!(presets.len(), 1);
    assert_eq!(presets[0].header("apikey"), Some("anon-key"));
    assert_eq!(presets[0].header("authorization"), Some("Bearer token-1"));
    let overrides = api.hits_to("/escola_curriculum_overrides");
    assert_eq!(overrides.len(), 1);
    assert_eq!(overrides[0].param("preset_subject_id"), Some("in.(1,2,3)"));

    let second = sc.request_ok("curriculum.blueprint", json!({ "presetKey": "CFB" }));
    assert_eq!(second["cached"], true);
    assert_eq!(second["rows"], first["rows"]);
    assert_eq!(api.hits_to("/curriculum_preset_subjects").len(), 1);

    let refreshed = sc.request_ok(
        "curriculum.blueprint",
        json!({ "presetKey": "CFB", "refresh": true }),
    );
    assert_eq!(refreshed["cached"], false);
    assert_eq!(api.hits_to("/curriculum_preset_subjects").len(), 2);
}

#[test]
fn apply_installs_and_publishes_each_course_group() {
    let api = school_api(Arc::new(AtomicBool::new(false)));
    let mut sc = Sidecar::spawn();
    sc.connect("escolad-apply", &api);

    let res = sc.request_ok(
        "curriculum.apply",
        json!({
            "sessionId": "sess-1",
            "matrix": matrix(),
            "hourOverrides": {
                "CFB::10ª::Matemática": 6,
                "CFB::11ª::Matemática": 10
            }
        }),
    );
    let groups = res["groups"].as_array().expect("groups");
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0]["courseKey"], "CFB");
    assert_eq!(groups[0]["status"], "installed");
    assert_eq!(groups[0]["cursoId"], "curso-cfb");
    assert_eq!(groups[0]["published"], true);
    assert_eq!(
        groups[0]["classTotals"],
        json!([{ "classLabel": "10ª", "weeklyHours": 6 }])
    );
    assert_eq!(groups[1]["courseKey"], "CEJ");
    assert_eq!(groups[1]["version"], 2);

    let installs = api.hits_to("/curriculo/install-preset");
    assert_eq!(installs.len(), 2);
    let cfb = &installs[0].body;
    assert_eq!(cfb["presetKey"], "CFB");
    assert_eq!(cfb["sessionId"], "sess-1");
    assert_eq!(cfb["customData"]["classes"], json!(["10ª"]));
    assert_eq!(cfb["customData"]["classTotals"], json!({ "10ª": 6 }));
    assert_eq!(
        cfb["customData"]["matrix"],
        json!({ "Matemática::10ª::M": true, "Matemática::10ª::T": true })
    );

    let publishes = api.hits_to("/curriculo/publish");
    assert_eq!(publishes.len(), 2);
    assert_eq!(publishes[0].body, json!({ "cursoId": "curso-cfb", "version": 1 }));
    assert_eq!(publishes[1].body, json!({ "cursoId": "curso-cej", "version": 2 }));

    let ledger = sc.request_ok("curriculum.installs", json!({}));
    let rows = ledger["installs"].as_array().expect("installs");
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r["published"] == true));

    // Same selection again: nothing is re-sent.
    let again = sc.request_ok(
        "curriculum.apply",
        json!({
            "sessionId": "sess-1",
            "matrix": matrix(),
            "hourOverrides": {
                "CFB::10ª::Matemática": 6,
                "CFB::11ª::Matemática": 10
            }
        }),
    );
    assert!(again["groups"]
        .as_array()
        .expect("groups")
        .iter()
        .all(|g| g["status"] == "skipped"));
    assert_eq!(api.hits_to("/curriculo/install-preset").len(), 2);
    assert_eq!(api.hits_to("/curriculo/publish").len(), 2);

    // A changed override reinstalls only the affected course.
    let changed = sc.request_ok(
        "curriculum.apply",
        json!({
            "sessionId": "sess-1",
            "matrix": matrix(),
            "hourOverrides": { "CFB::10ª::Matemática": 5 }
        }),
    );
    assert_eq!(changed["groups"][0]["status"], "installed");
    assert_eq!(changed["groups"][1]["status"], "skipped");
    assert_eq!(api.hits_to("/curriculo/install-preset").len(), 3);
}

#[test]
fn apply_stops_at_first_failure_without_rollback() {
    let fail = Arc::new(AtomicBool::new(true));
    let api = school_api(Arc::clone(&fail));
    let mut sc = Sidecar::spawn();
    sc.connect("escolad-apply-fail", &api);

    let e = sc.request_err(
        "curriculum.apply",
        json!({ "matrix": matrix(), "publish": false }),
    );
    assert_eq!(e["code"], "install_failed");
    assert!(e["message"]
        .as_str()
        .unwrap_or("")
        .contains("preset CEJ indisponível"));
    assert_eq!(e["details"]["failedCourse"], "CEJ");
    assert_eq!(e["details"]["stage"], "install");
    assert_eq!(e["details"]["completed"][0]["courseKey"], "CFB");

    let ledger = sc.request_ok("curriculum.installs", json!({}));
    let rows = ledger["installs"].as_array().expect("installs");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["courseKey"], "CFB");
    assert_eq!(rows[0]["published"], false);
    assert!(api.hits_to("/curriculo/publish").is_empty());

    fail.store(false, Ordering::SeqCst);
    let retry = sc.request_ok(
        "curriculum.apply",
        json!({ "matrix": matrix(), "publish": false }),
    );
    assert_eq!(retry["groups"][0]["status"], "skipped");
    assert_eq!(retry["groups"][1]["status"], "installed");

    let published = sc.request_ok("curriculum.publish", json!({ "courseKey": "CEJ" }));
    assert_eq!(published["cursoId"], "curso-cej");
    assert_eq!(api.hits_to("/curriculo/publish").len(), 1);

    let e = sc.request_err("curriculum.publish", json!({ "courseKey": "ZZZ" }));
    assert_eq!(e["code"], "not_found");
}

#[test]
fn apply_uses_saved_draft_and_validates_selection() {
    let api = school_api(Arc::new(AtomicBool::new(false)));
    let mut sc = Sidecar::spawn();
    sc.connect("escolad-apply-draft", &api);

    let e = sc.request_err("curriculum.apply", json!({}));
    assert_eq!(e["code"], "bad_params");

    let e = sc.request_err(
        "curriculum.apply",
        json!({ "matrix": [{ "courseKey": "CFB", "classLabel": "10ª" }] }),
    );
    assert_eq!(e["code"], "bad_params");

    sc.request_ok(
        "wizard.save",
        json!({ "patch": { "matrix": [{ "courseKey": "CFB", "classLabel": "11ª", "turno": "N" }] } }),
    );
    let res = sc.request_ok("curriculum.apply", json!({ "publish": false }));
    assert_eq!(res["groups"][0]["courseKey"], "CFB");
    assert_eq!(
        res["groups"][0]["classTotals"],
        json!([{ "classLabel": "11ª", "weeklyHours": 4 }])
    );
    assert!(api.hits_to("/curriculo/publish").is_empty());
}
