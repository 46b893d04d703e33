#![allow(dead_code)]

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Sidecar {
    pub fn spawn() -> Self {
        let exe = env!("CARGO_BIN_EXE_escolad");
        let mut child = Command::new(exe)
            .env_remove("ESCOLAD_API_URL")
            .env_remove("ESCOLAD_DATA_URL")
            .env_remove("ESCOLAD_DATA_KEY")
            .env_remove("ESCOLAD_TOKEN")
            .env_remove("ESCOLAD_ESCOLA_ID")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn escolad");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 0,
        }
    }

    pub fn send_raw(&mut self, line: &str) -> Value {
        writeln!(self.stdin, "{}", line).expect("write request");
        self.stdin.flush().expect("flush request");
        let mut out = String::new();
        self.reader.read_line(&mut out).expect("read response line");
        assert!(!out.trim().is_empty(), "empty response for {}", line);
        serde_json::from_str(out.trim()).expect("parse response json")
    }

    pub fn request(&mut self, method: &str, params: Value) -> Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let payload = json!({
            "id": id,
            "method": method,
            "params": params,
        });
        let value = self.send_raw(&payload.to_string());
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    pub fn request_ok(&mut self, method: &str, params: Value) -> Value {
        let value = self.request(method, params);
        assert!(
            value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
            "{} failed: {}",
            method,
            value
        );
        value.get("result").cloned().unwrap_or_else(|| json!({}))
    }

    pub fn request_err(&mut self, method: &str, params: Value) -> Value {
        let value = self.request(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            value
        );
        value.get("error").cloned().unwrap_or_else(|| json!({}))
    }

    /// Selects a fresh workspace and points the connection at `api`.
    pub fn connect(&mut self, prefix: &str, api: &FakeApi) -> PathBuf {
        let workspace = temp_dir(prefix);
        self.request_ok(
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        );
        self.request_ok(
            "config.update",
            json!({
                "section": "connection",
                "patch": {
                    "apiBaseUrl": api.base_url,
                    "dataBaseUrl": api.base_url,
                    "dataApiKey": "anon-key",
                    "accessToken": "token-1",
                    "escolaId": "esc-1"
                }
            }),
        );
        workspace
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[derive(Debug, Clone)]
pub struct Hit {
    pub method: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

impl Hit {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

fn decode(s: &str) -> String {
    let s = s.replace('+', " ");
    match urlencoding::decode(&s) {
        Ok(c) => c.into_owned(),
        Err(_) => s.clone(),
    }
}

fn parse_query(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((k, v)) => (decode(k), decode(v)),
            None => (decode(p), String::new()),
        })
        .collect()
}

type Route = dyn Fn(&Hit) -> (u16, Value) + Send + Sync + 'static;

/// In-process stand-in for the school REST API and the data endpoint.
pub struct FakeApi {
    pub base_url: String,
    hits: Arc<Mutex<Vec<Hit>>>,
    server: Arc<tiny_http::Server>,
    handle: Option<JoinHandle<()>>,
}

impl FakeApi {
    pub fn start<F>(route: F) -> Self
    where
        F: Fn(&Hit) -> (u16, Value) + Send + Sync + 'static,
    {
        let server = Arc::new(tiny_http::Server::http("127.0.0.1:0").expect("bind fake api"));
        let port = server
            .server_addr()
            .to_ip()
            .map(|a| a.port())
            .expect("fake api port");
        let hits: Arc<Mutex<Vec<Hit>>> = Arc::new(Mutex::new(Vec::new()));
        let route: Arc<Route> = Arc::new(route);

        let srv = Arc::clone(&server);
        let recorded = Arc::clone(&hits);
        let handle = std::thread::spawn(move || {
            for mut rq in srv.incoming_requests() {
                let url = rq.url().to_string();
                let (path, query) = match url.split_once('?') {
                    Some((p, q)) => (p.to_string(), parse_query(q)),
                    None => (url.clone(), Vec::new()),
                };
                let mut raw = String::new();
                let _ = rq.as_reader().read_to_string(&mut raw);
                let body = serde_json::from_str(&raw).unwrap_or(Value::Null);
                let headers = rq
                    .headers()
                    .iter()
                    .map(|h| (h.field.as_str().as_str().to_string(), h.value.as_str().to_string()))
                    .collect();
                let hit = Hit {
                    method: rq.method().to_string(),
                    path,
                    query,
                    headers,
                    body,
                };
                let (status, reply) = route(&hit);
                recorded.lock().expect("hits lock").push(hit);

                let header = tiny_http::Header::from_bytes(
                    &b"Content-Type"[..],
                    &b"application/json"[..],
                )
                .expect("header");
                let resp = tiny_http::Response::from_string(reply.to_string())
                    .with_status_code(status)
                    .with_header(header);
                let _ = rq.respond(resp);
            }
        });

        Self {
            base_url: format!("http://127.0.0.1:{}", port),
            hits,
            server,
            handle: Some(handle),
        }
    }

    pub fn hits(&self) -> Vec<Hit> {
        self.hits.lock().expect("hits lock").clone()
    }

    pub fn hits_to(&self, path_suffix: &str) -> Vec<Hit> {
        self.hits()
            .into_iter()
            .filter(|h| h.path.ends_with(path_suffix))
            .collect()
    }
}

impl Drop for FakeApi {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

pub fn envelope(data: Value) -> (u16, Value) {
    (200, json!({ "ok": true, "data": data }))
}

pub fn page(items: Value, next_cursor: Option<&str>) -> (u16, Value) {
    (
        200,
        json!({ "ok": true, "items": items, "next_cursor": next_cursor }),
    )
}

pub fn failure(status: u16, message: &str) -> (u16, Value) {
    (status, json!({ "ok": false, "error": message }))
}
