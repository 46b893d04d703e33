//! Blocking client for the school REST API and the relational store's HTTP
//! interface.
//!
//! Every REST endpoint answers with the same envelope:
//! `{ ok, data | items, error, next_cursor }`. A non-2xx status or `ok: false`
//! is surfaced as a single error carrying the server's message; nothing is
//! retried.

use anyhow::{anyhow, bail, Context};
use reqwest::blocking::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;

use crate::curriculum::{PresetSubject, ScheduleSlot, SubjectOverride};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub api_base_url: String,
    pub data_base_url: Option<String>,
    pub data_api_key: Option<String>,
    pub access_token: Option<String>,
    pub escola_id: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Default)]
struct Envelope {
    #[serde(default)]
    ok: Option<bool>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    items: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    next_cursor: Option<String>,
}

fn error_message(error: Option<&Value>) -> Option<String> {
    match error? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Object(o) => o
            .get("message")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        _ => None,
    }
}

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

/// Follows `next_cursor` until the server stops returning one, accumulating
/// items in request order.
pub fn collect_pages<T, F>(mut fetch: F) -> anyhow::Result<Vec<T>>
where
    F: FnMut(Option<&str>) -> anyhow::Result<Page<T>>,
{
    let mut out = Vec::new();
    let mut cursor: Option<String> = None;
    let mut seen: HashSet<String> = HashSet::new();
    loop {
        let page = fetch(cursor.as_deref())?;
        out.extend(page.items);
        match page.next_cursor.filter(|c| !c.is_empty()) {
            Some(next) => {
                if !seen.insert(next.clone()) {
                    bail!("pagination cursor repeated: {}", next);
                }
                cursor = Some(next);
            }
            None => break,
        }
    }
    Ok(out)
}

pub struct Remote {
    http: Client,
    cfg: RemoteConfig,
}

impl Remote {
    pub fn new(cfg: RemoteConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .context("failed to build http client")?;
        Ok(Self { http, cfg })
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.cfg
    }

    pub fn escola_id(&self) -> &str {
        &self.cfg.escola_id
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.cfg.api_base_url.trim_end_matches('/'), path)
    }

    fn admin_path(&self, rest: &str) -> String {
        format!("/api/escola/{}/admin/{}", self.cfg.escola_id, rest)
    }

    fn school_path(&self, rest: &str) -> String {
        format!("/api/escolas/{}/{}", self.cfg.escola_id, rest)
    }

    fn authorize(&self, rb: RequestBuilder) -> RequestBuilder {
        match &self.cfg.access_token {
            Some(t) => rb.bearer_auth(t),
            None => rb,
        }
    }

    fn send(&self, rb: RequestBuilder, what: &str) -> anyhow::Result<Envelope> {
        let resp = self
            .authorize(rb)
            .send()
            .with_context(|| format!("{what}: request failed"))?;
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        let env: Envelope = if body.trim().is_empty() {
            Envelope::default()
        } else {
            match serde_json::from_str(&body) {
                Ok(v) => v,
                Err(_) if !status.is_success() => Envelope::default(),
                Err(e) => return Err(anyhow!("{what}: invalid json response: {e}")),
            }
        };
        if !status.is_success() || env.ok == Some(false) {
            let msg = error_message(env.error.as_ref())
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            tracing::warn!(%status, what, message = %msg, "remote call failed");
            bail!("{what}: {msg}");
        }
        Ok(env)
    }

    fn post(&self, path: &str, body: &Value, what: &str) -> anyhow::Result<Value> {
        tracing::debug!(path, what, "POST");
        let env = self.send(self.http.post(self.url(path)).json(body), what)?;
        Ok(env.data.or(env.items).unwrap_or(Value::Null))
    }

    fn get(&self, path: &str, query: &[(String, String)], what: &str) -> anyhow::Result<Envelope> {
        tracing::debug!(path, what, "GET");
        self.send(self.http.get(self.url(path)).query(query), what)
    }

    pub fn upsert_session(&self, body: &Value) -> anyhow::Result<Value> {
        self.post(&self.admin_path("ano-letivo/upsert"), body, "ano-letivo upsert")
    }

    pub fn upsert_periods(&self, body: &Value) -> anyhow::Result<Value> {
        self.post(
            &self.admin_path("periodos-letivos/upsert-bulk"),
            body,
            "periodos-letivos upsert-bulk",
        )
    }

    pub fn get_preferences(&self) -> anyhow::Result<Value> {
        let env = self.get(
            &self.admin_path("configuracoes/avaliacao-frequencia"),
            &[],
            "avaliacao-frequencia get",
        )?;
        Ok(env.data.unwrap_or(Value::Null))
    }

    pub fn save_preferences(&self, body: &Value) -> anyhow::Result<Value> {
        self.post(
            &self.admin_path("configuracoes/avaliacao-frequencia"),
            body,
            "avaliacao-frequencia save",
        )
    }

    pub fn install_preset(&self, body: &Value) -> anyhow::Result<InstallResult> {
        let data = self.post(
            &self.admin_path("curriculo/install-preset"),
            body,
            "curriculo install-preset",
        )?;
        serde_json::from_value(data).context("curriculo install-preset: unexpected response")
    }

    pub fn publish_curriculum(&self, curso_id: &str, version: i64) -> anyhow::Result<Value> {
        self.post(
            &self.admin_path("curriculo/publish"),
            &serde_json::json!({ "cursoId": curso_id, "version": version }),
            "curriculo publish",
        )
    }

    pub fn generate_turmas(&self, body: &Value) -> anyhow::Result<Value> {
        self.post(&self.admin_path("turmas/generate"), body, "turmas generate")
    }

    pub fn schedule_slots(&self) -> anyhow::Result<Vec<ScheduleSlot>> {
        self.list_all("horarios/slots", &[])
    }

    /// Lists every item of a school-scoped resource, following cursors.
    pub fn list_all<T: DeserializeOwned>(
        &self,
        resource: &str,
        params: &[(String, String)],
    ) -> anyhow::Result<Vec<T>> {
        let path = self.school_path(resource);
        let what = format!("list {resource}");
        collect_pages(|cursor| {
            let mut query: Vec<(String, String)> = params.to_vec();
            if let Some(c) = cursor {
                query.push(("cursor".to_string(), c.to_string()));
            }
            let env = self.get(&path, &query, &what)?;
            let raw = env.items.or(env.data).unwrap_or(Value::Array(vec![]));
            let items: Vec<T> = serde_json::from_value(raw)
                .with_context(|| format!("{what}: unexpected item shape"))?;
            Ok(Page {
                items,
                next_cursor: env.next_cursor,
            })
        })
    }

    fn data_url(&self, table: &str) -> anyhow::Result<String> {
        let Some(base) = self.cfg.data_base_url.as_deref() else {
            bail!("connection.dataBaseUrl is not configured");
        };
        Ok(format!("{}/rest/v1/{}", base.trim_end_matches('/'), table))
    }

    fn data_select<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> anyhow::Result<Vec<T>> {
        let url = self.data_url(table)?;
        tracing::debug!(table, "data select");
        let mut rb = self.http.get(url).query(&[("select", "*")]).query(query);
        if let Some(k) = &self.cfg.data_api_key {
            rb = rb.header("apikey", k);
            if self.cfg.access_token.is_none() {
                rb = rb.bearer_auth(k);
            }
        }
        let resp = self
            .authorize(rb)
            .send()
            .with_context(|| format!("select {table}: request failed"))?;
        let status = resp.status();
        if !status.is_success() {
            let body: Value = resp.json().unwrap_or(Value::Null);
            let msg = error_message(Some(&body))
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            bail!("select {table}: {msg}");
        }
        resp.json::<Vec<T>>()
            .with_context(|| format!("select {table}: unexpected row shape"))
    }

    pub fn preset_subjects(&self, preset_key: &str) -> anyhow::Result<Vec<PresetSubject>> {
        self.data_select(
            "curriculum_preset_subjects",
            &[("preset_key", format!("eq.{preset_key}"))],
        )
    }

    pub fn subject_overrides(&self, preset_subject_ids: &[String]) -> anyhow::Result<Vec<SubjectOverride>> {
        if preset_subject_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.data_select(
            "escola_curriculum_overrides",
            &[
                ("escola_id", format!("eq.{}", self.cfg.escola_id)),
                (
                    "preset_subject_id",
                    format!("in.({})", preset_subject_ids.join(",")),
                ),
            ],
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstallResult {
    #[serde(alias = "cursoId", alias = "course_id")]
    pub curso_id: String,
    #[serde(default, alias = "curriculo_version", alias = "curriculumVersion")]
    pub version: i64,
}
