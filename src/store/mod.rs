//! SQLite persistence for the module catalogue.
//!
//! The store is deliberately narrow: upsert-on-name-conflict, status update
//! by name, delete by name and select-all. Everything else lives in memory
//! inside the registry.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::error::ModuleError;

pub type DbConnection = Arc<Mutex<Connection>>;

/// One persisted module row. Status and source type are kept as plain
/// strings here; the registry owns the typed views.
#[derive(Debug, Clone)]
pub struct ModuleRecord {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub status: String,
    pub source_type: String,
    pub source_url: String,
    pub manifest_json: String,
    pub error_log: String,
    pub installed_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ModuleStore {
    conn: DbConnection,
}

impl ModuleStore {
    /// Open (or create) `<data_dir>/modhost.db` and run the schema.
    pub fn open(data_dir: &Path) -> Result<Self, ModuleError> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join("modhost.db");
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        create_tables(&conn)?;
        tracing::info!("module store opened at {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self, ModuleError> {
        let conn = Connection::open_in_memory()?;
        create_tables(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, ModuleError> {
        self.conn
            .lock()
            .map_err(|_| ModuleError::Store("database lock poisoned".into()))
    }

    /// Insert or replace a module row by name. An upsert always resets the
    /// row to inactive with a clean error log; `installed_at` is refreshed
    /// to the record's timestamp.
    pub fn upsert(&self, rec: &ModuleRecord) -> Result<(), ModuleError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO modules
                (name, version, description, author, status, source_type, source_url, manifest, error_log, installed_at)
             VALUES (?1, ?2, ?3, ?4, 'inactive', ?5, ?6, ?7, '', ?8)
             ON CONFLICT(name) DO UPDATE SET
                version = excluded.version,
                description = excluded.description,
                author = excluded.author,
                source_type = excluded.source_type,
                source_url = excluded.source_url,
                manifest = excluded.manifest,
                status = 'inactive',
                error_log = '',
                installed_at = excluded.installed_at",
            params![
                rec.name,
                rec.version,
                rec.description,
                rec.author,
                rec.source_type,
                rec.source_url,
                rec.manifest_json,
                rec.installed_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn set_status(&self, name: &str, status: &str, error_log: &str) -> Result<(), ModuleError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE modules SET status = ?1, error_log = ?2 WHERE name = ?3",
            params![status, error_log, name],
        )?;
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<(), ModuleError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM modules WHERE name = ?1", params![name])?;
        Ok(())
    }

    /// All rows in name order.
    pub fn load_all(&self) -> Result<Vec<ModuleRecord>, ModuleError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT name, version, description, author, status, source_type, source_url, manifest, error_log, installed_at
             FROM modules ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| {
            let installed_at: String = row.get(9)?;
            Ok(ModuleRecord {
                name: row.get(0)?,
                version: row.get(1)?,
                description: row.get(2)?,
                author: row.get(3)?,
                status: row.get(4)?,
                source_type: row.get(5)?,
                source_url: row.get(6)?,
                manifest_json: row.get(7)?,
                error_log: row.get(8)?,
                installed_at: DateTime::parse_from_rfc3339(&installed_at)
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn create_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS modules (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            name         TEXT    UNIQUE NOT NULL,
            version      TEXT    NOT NULL DEFAULT '0.0.0',
            description  TEXT    NOT NULL DEFAULT '',
            author       TEXT    NOT NULL DEFAULT '',
            status       TEXT    NOT NULL DEFAULT 'inactive',
            source_type  TEXT    NOT NULL DEFAULT '',
            source_url   TEXT    NOT NULL DEFAULT '',
            manifest     TEXT    NOT NULL DEFAULT '{}',
            error_log    TEXT    NOT NULL DEFAULT '',
            installed_at TEXT    NOT NULL DEFAULT (datetime('now'))
        );",
    )
}
