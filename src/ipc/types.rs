use std::collections::HashMap;
use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::curriculum::BlueprintRow;
use crate::remote::Remote;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    /// Built lazily from the `connection` config section.
    pub remote: Option<Remote>,
    /// Resolved blueprints by preset key, kept for the life of the process.
    pub blueprints: HashMap<String, Vec<BlueprintRow>>,
}

impl AppState {
    /// Drops everything derived from the connection settings.
    pub fn reset_remote(&mut self) {
        self.remote = None;
        self.blueprints.clear();
    }
}
