// SQLite index of past sessions for fast recent-list queries

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};

use super::metadata::SessionSummary;

/// Recent-sessions index.
///
/// Wraps Connection in a parking_lot::Mutex since rusqlite::Connection is
/// not Sync. Using parking_lot instead of std::sync::Mutex to avoid mutex
/// poisoning on panic, which would make all subsequent index operations
/// fail.
pub struct SessionIndex {
    conn: Mutex<Connection>,
}

impl SessionIndex {
    /// Open or create the index database at `path`.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let index = Self {
            conn: Mutex::new(conn),
        };
        index.init_schema()?;
        Ok(index)
    }

    /// In-memory fallback when the file database cannot be opened.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        log::warn!("Using in-memory session index - the recent list will not persist");
        let conn = Connection::open_in_memory()?;
        let index = Self {
            conn: Mutex::new(conn),
        };
        index.init_schema()?;
        Ok(index)
    }

    fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                started_at TEXT NOT NULL,
                duration_ms REAL NOT NULL,
                frame_count INTEGER NOT NULL,
                effective_fps REAL NOT NULL,
                fps_mismatch INTEGER NOT NULL DEFAULT 0,
                partial INTEGER NOT NULL DEFAULT 0,
                path TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_started_at
                ON sessions(started_at DESC);
        "#,
        )?;
        Ok(())
    }

    /// Insert or replace one session row.
    pub fn insert(&self, summary: &SessionSummary) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO sessions
                (session_id, started_at, duration_ms, frame_count,
                 effective_fps, fps_mismatch, partial, path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                summary.session_id,
                summary.started_at.to_rfc3339(),
                summary.duration_ms,
                summary.frame_count as i64,
                summary.measured_effective_fps,
                summary.fps_mismatch as i64,
                summary.partial as i64,
                summary.path.to_string_lossy().to_string(),
            ],
        )?;
        Ok(())
    }

    /// Newest sessions first.
    pub fn recent(&self, limit: usize) -> anyhow::Result<Vec<SessionSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id, started_at, duration_ms, frame_count,
                    effective_fps, fps_mismatch, partial, path
             FROM sessions
             ORDER BY started_at DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let started_at: String = row.get(1)?;
            Ok(SessionSummary {
                session_id: row.get(0)?,
                started_at: started_at
                    .parse::<DateTime<Utc>>()
                    .unwrap_or_else(|_| Utc::now()),
                duration_ms: row.get(2)?,
                frame_count: row.get::<_, i64>(3)? as u64,
                measured_effective_fps: row.get(4)?,
                fps_mismatch: row.get::<_, i64>(5)? != 0,
                partial: row.get::<_, i64>(6)? != 0,
                path: PathBuf::from(row.get::<_, String>(7)?),
            })
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row?);
        }
        Ok(summaries)
    }

    pub fn count(&self) -> anyhow::Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}
