use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;

pub const DB_FILE: &str = "escolad.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS curriculum_installs(
            id TEXT PRIMARY KEY,
            escola_id TEXT NOT NULL,
            course_key TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            curso_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            published INTEGER NOT NULL DEFAULT 0,
            installed_at TEXT NOT NULL,
            class_totals_json TEXT NOT NULL DEFAULT '{}',
            UNIQUE(escola_id, course_key)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_curriculum_installs_escola ON curriculum_installs(escola_id)",
        [],
    )?;

    Ok(conn)
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json, updated_at) VALUES(?, ?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
        (key, serde_json::to_string(value)?, now_rfc3339()),
    )?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallRecord {
    pub course_key: String,
    pub fingerprint: String,
    pub curso_id: String,
    pub version: i64,
    pub published: bool,
    pub installed_at: String,
    pub class_totals: serde_json::Value,
}

fn install_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<InstallRecord> {
    let totals_raw: String = r.get(6)?;
    Ok(InstallRecord {
        course_key: r.get(0)?,
        fingerprint: r.get(1)?,
        curso_id: r.get(2)?,
        version: r.get(3)?,
        published: r.get::<_, i64>(4)? != 0,
        installed_at: r.get(5)?,
        class_totals: serde_json::from_str(&totals_raw).unwrap_or_else(|_| serde_json::json!({})),
    })
}

pub fn install_get(
    conn: &Connection,
    escola_id: &str,
    course_key: &str,
) -> anyhow::Result<Option<InstallRecord>> {
    let rec = conn
        .query_row(
            "SELECT course_key, fingerprint, curso_id, version, published, installed_at, class_totals_json
             FROM curriculum_installs
             WHERE escola_id = ? AND course_key = ?",
            [escola_id, course_key],
            install_from_row,
        )
        .optional()?;
    Ok(rec)
}

pub fn install_list(conn: &Connection, escola_id: &str) -> anyhow::Result<Vec<InstallRecord>> {
    let mut stmt = conn.prepare(
        "SELECT course_key, fingerprint, curso_id, version, published, installed_at, class_totals_json
         FROM curriculum_installs
         WHERE escola_id = ?
         ORDER BY installed_at, course_key",
    )?;
    let rows = stmt
        .query_map([escola_id], install_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn install_record(
    conn: &Connection,
    escola_id: &str,
    course_key: &str,
    fingerprint: &str,
    curso_id: &str,
    version: i64,
    class_totals: &serde_json::Value,
) -> anyhow::Result<()> {
    // A reinstall replaces the previous version and resets the publish flag.
    conn.execute(
        "INSERT INTO curriculum_installs(
            id, escola_id, course_key, fingerprint, curso_id, version, published, installed_at, class_totals_json
         ) VALUES(?, ?, ?, ?, ?, ?, 0, ?, ?)
         ON CONFLICT(escola_id, course_key) DO UPDATE SET
            fingerprint = excluded.fingerprint,
            curso_id = excluded.curso_id,
            version = excluded.version,
            published = 0,
            installed_at = excluded.installed_at,
            class_totals_json = excluded.class_totals_json",
        (
            uuid::Uuid::new_v4().to_string(),
            escola_id,
            course_key,
            fingerprint,
            curso_id,
            version,
            now_rfc3339(),
            serde_json::to_string(class_totals)?,
        ),
    )?;
    Ok(())
}

pub fn install_mark_published(
    conn: &Connection,
    escola_id: &str,
    course_key: &str,
) -> anyhow::Result<bool> {
    let n = conn.execute(
        "UPDATE curriculum_installs SET published = 1 WHERE escola_id = ? AND course_key = ?",
        [escola_id, course_key],
    )?;
    Ok(n > 0)
}
