use crate::types::MigrationRecord;
use crate::utils::now_iso;
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

fn load_schema_v1() -> &'static str {
    r"
CREATE TABLE IF NOT EXISTS migration_records (
  key TEXT PRIMARY KEY,
  migrated INTEGER NOT NULL DEFAULT 0,
  cursor INTEGER NOT NULL DEFAULT 0,
  migrated_count INTEGER NOT NULL DEFAULT 0,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS migration_events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  key TEXT NOT NULL,
  action TEXT NOT NULL,
  timestamp TEXT NOT NULL,
  payload TEXT
);
"
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MigrationRecord> {
    let migrated: i64 = row.get("migrated")?;
    let cursor: i64 = row.get("cursor")?;
    let migrated_count: i64 = row.get("migrated_count")?;

    Ok(MigrationRecord {
        key: row.get("key")?,
        migrated: migrated != 0,
        cursor: cursor.max(0) as usize,
        migrated_count: migrated_count.max(0) as usize,
        updated_at: parse_ts(&row.get::<_, String>("updated_at")?),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerEvent {
    pub key: String,
    pub action: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Option<serde_json::Value>,
}

pub struct MigrationLedger {
    conn: Mutex<Connection>,
}

impl MigrationLedger {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create ledger dir {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("open sqlite db {}", db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5_000_i64)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory().context("open in-memory ledger")?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.migrate()?;
        Ok(ledger)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("migration ledger mutex poisoned"))
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_migrations (
              version INTEGER PRIMARY KEY,
              applied_at TEXT NOT NULL
            );
            ",
        )?;

        let version: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if version < 1 {
            conn.execute_batch(load_schema_v1())?;
            conn.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?)",
                params![1_i64, now_iso()],
            )?;
        }

        if version < 2 {
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_migration_events_key ON migration_events(key, timestamp)",
                [],
            )?;
            conn.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?)",
                params![2_i64, now_iso()],
            )?;
        }

        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<MigrationRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT key, migrated, cursor, migrated_count, updated_at FROM migration_records WHERE key = ?",
                params![key],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn is_migrated(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some_and(|record| record.migrated))
    }

    pub fn mark_migrated(&self, key: &str, cursor: usize, count: usize) -> Result<MigrationRecord> {
        {
            let conn = self.conn()?;
            conn.execute(
                "
                INSERT INTO migration_records (key, migrated, cursor, migrated_count, updated_at)
                VALUES (?, 1, ?, ?, ?)
                ON CONFLICT(key) DO UPDATE SET
                  migrated = 1,
                  cursor = excluded.cursor,
                  migrated_count = excluded.migrated_count,
                  updated_at = excluded.updated_at
                ",
                params![key, cursor as i64, count as i64, now_iso()],
            )?;
        }
        self.get(key)?
            .ok_or_else(|| anyhow!("migration record for {key} vanished after write"))
    }

    pub fn advance_cursor(&self, key: &str, cursor: usize, added: usize) -> Result<bool> {
        let conn = self.conn()?;
        let changes = conn.execute(
            "
            UPDATE migration_records
            SET cursor = MAX(cursor, ?), migrated_count = migrated_count + ?, updated_at = ?
            WHERE key = ? AND migrated = 1
            ",
            params![cursor as i64, added as i64, now_iso(), key],
        )?;
        Ok(changes > 0)
    }

    pub fn list(&self) -> Result<Vec<MigrationRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT key, migrated, cursor, migrated_count, updated_at FROM migration_records ORDER BY key",
        )?;
        let rows = stmt
            .query_map([], record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn record_event(&self, key: &str, action: &str, payload: Option<&serde_json::Value>) {
        let payload_text = payload.and_then(|p| serde_json::to_string(p).ok());
        let result = self.conn().and_then(|conn| {
            conn.execute(
                "INSERT INTO migration_events (key, action, timestamp, payload) VALUES (?, ?, ?, ?)",
                params![key, action, now_iso(), payload_text],
            )
            .map_err(anyhow::Error::from)
        });
        if let Err(error) = result {
            tracing::debug!(key, action, %error, "failed to record migration event");
        }
    }

    pub fn events(&self, key: &str, limit: usize) -> Result<Vec<LedgerEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "
            SELECT key, action, timestamp, payload
            FROM migration_events
            WHERE key = ?
            ORDER BY id DESC
            LIMIT ?
            ",
        )?;
        let rows = stmt
            .query_map(params![key, limit as i64], |row| {
                let payload: Option<String> = row.get(3)?;
                Ok(LedgerEvent {
                    key: row.get(0)?,
                    action: row.get(1)?,
                    timestamp: parse_ts(&row.get::<_, String>(2)?),
                    payload: payload.and_then(|text| serde_json::from_str(&text).ok()),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
