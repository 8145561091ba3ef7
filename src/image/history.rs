//! Applied-image history.
//!
//! Each successful build-and-switch appends a snapshot of the configuration
//! that produced it, the resulting image reference, and a timestamp. The
//! latest entry is what "has anything changed" comparisons run against.

use crate::image::config::ImageConfig;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

/// One appended history row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: i64,
    /// Snapshot of the configuration that was applied.
    pub config: ImageConfig,
    /// Image the switch landed on.
    pub image_ref: String,
    pub created: DateTime<Utc>,
}

/// Append-only history store.
pub struct HistoryStore {
    conn: Mutex<Connection>,
}

impl HistoryStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS image_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                config TEXT NOT NULL,
                image_ref TEXT NOT NULL,
                created TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Append a new entry, returning its id.
    pub fn append(&self, config: &ImageConfig, image_ref: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let snapshot = serde_json::to_string(config)?;
        conn.execute(
            "INSERT INTO image_history (config, image_ref, created) VALUES (?1, ?2, ?3)",
            params![snapshot, image_ref, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// The most recently applied entry, if any.
    pub fn latest(&self) -> Result<Option<HistoryEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT id, config, image_ref, created FROM image_history
             ORDER BY id DESC LIMIT 1",
        )?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_entry(row)?)),
            None => Ok(None),
        }
    }

    /// All entries, newest first.
    pub fn list(&self, limit: Option<u32>) -> Result<Vec<HistoryEntry>> {
        let conn = self.conn.lock().unwrap();
        let sql = match limit {
            Some(n) => format!(
                "SELECT id, config, image_ref, created FROM image_history
                 ORDER BY id DESC LIMIT {n}"
            ),
            None => "SELECT id, config, image_ref, created FROM image_history
                 ORDER BY id DESC"
                .to_string(),
        };
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(row_to_entry(row)?);
        }
        Ok(entries)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> Result<HistoryEntry> {
    let snapshot: String = row.get(1)?;
    let created: String = row.get(3)?;
    Ok(HistoryEntry {
        id: row.get(0)?,
        config: serde_json::from_str(&snapshot).context("Corrupt history snapshot")?,
        image_ref: row.get(2)?,
        created: DateTime::parse_from_rfc3339(&created)
            .context("Corrupt history timestamp")?
            .with_timezone(&Utc),
    })
}
