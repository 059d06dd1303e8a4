use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use evoflow_core::error::{EvoflowError, Result};
use evoflow_core::record::{Record, RecordKind};
use evoflow_core::traits::RecordStore;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS records (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_records_kind ON records(kind);";

fn db_err(e: impl std::fmt::Display) -> EvoflowError {
    EvoflowError::Database(e.to_string())
}

/// SQLite-backed record store: one row per record id.
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| db_err(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite record store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Number of stored records of the given kind.
    pub fn count(&self, kind: RecordKind) -> Result<usize> {
        let conn = self.conn.lock().map_err(db_err)?;
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM records WHERE kind = ?1",
                params![kind.as_str()],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(n as usize)
    }
}

impl RecordStore for SqliteRecordStore {
    fn append(&self, record: Record) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let payload = serde_json::to_string(&record.payload)?;
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT OR REPLACE INTO records (id, kind, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.id,
                    record.kind.as_str(),
                    payload,
                    record.created_at.to_rfc3339()
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn fetch(&self, id: &str) -> BoxFuture<'_, Result<Option<Record>>> {
        let id = id.to_string();
        Box::pin(async move {
            let row = {
                let conn = self.conn.lock().map_err(db_err)?;
                conn.query_row(
                    "SELECT kind, payload, created_at FROM records WHERE id = ?1",
                    params![id],
                    |row| {
                        let kind: String = row.get(0)?;
                        let payload: String = row.get(1)?;
                        let created_at: String = row.get(2)?;
                        Ok((kind, payload, created_at))
                    },
                )
                .optional()
                .map_err(db_err)?
            };

            let Some((kind, payload, created_at)) = row else {
                return Ok(None);
            };
            let kind = RecordKind::parse(&kind)
                .ok_or_else(|| db_err(format!("unknown record kind '{}'", kind)))?;
            let created_at = DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());

            Ok(Some(Record {
                id,
                kind,
                payload: serde_json::from_str(&payload)?,
                created_at,
            }))
        })
    }
}
