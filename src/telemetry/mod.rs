//! Diagnostics journal (`.azedarach/telemetry.db`).
//!
//! An append-only record of state changes, merge outcomes, and poller
//! heartbeats. Observability only: registries are rebuilt by scanning tmux
//! and the worktree list, never from this database.

use crate::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One journal entry.
#[derive(Debug, Clone)]
pub struct TelemetryEvent {
    pub bead_id: Option<String>,
    pub kind: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// SQLite-backed diagnostics journal.
pub struct Telemetry {
    db_path: PathBuf,
    conn: Mutex<Connection>,
}

impl Telemetry {
    pub fn open(project_path: impl AsRef<Path>) -> Result<Self> {
        let dir = project_path.as_ref().join(".azedarach");
        std::fs::create_dir_all(&dir)?;
        let db_path = dir.join("telemetry.db");
        let conn = Connection::open(&db_path)?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              bead_id TEXT,
              kind TEXT NOT NULL,
              message TEXT NOT NULL,
              created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS heartbeats (
              component TEXT PRIMARY KEY,
              last_seen_at TEXT NOT NULL,
              detail TEXT
            );
            "#,
        )?;

        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn record_event(&self, bead_id: Option<&str>, kind: &str, message: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO events(bead_id, kind, message, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![bead_id, kind, message, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn touch_heartbeat(&self, component: &str, detail: Option<&str>) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            r#"
            INSERT INTO heartbeats(component, last_seen_at, detail) VALUES (?1, ?2, ?3)
            ON CONFLICT(component) DO UPDATE SET
              last_seen_at = excluded.last_seen_at,
              detail = excluded.detail
            "#,
            params![component, Utc::now().to_rfc3339(), detail],
        )?;
        Ok(())
    }

    pub fn heartbeat(&self, component: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock();
        let seen: Option<String> = conn
            .query_row(
                "SELECT last_seen_at FROM heartbeats WHERE component = ?1",
                [component],
                |row| row.get(0),
            )
            .optional()?;
        Ok(seen.and_then(|s| {
            chrono::DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
        }))
    }

    pub fn recent_events(&self, limit: usize) -> Result<Vec<TelemetryEvent>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT bead_id, kind, message, created_at FROM events ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            let created_at: String = row.get(3)?;
            Ok(TelemetryEvent {
                bead_id: row.get(0)?,
                kind: row.get(1)?,
                message: row.get(2)?,
                created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
