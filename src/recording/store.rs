//! Recording metadata store.
//!
//! The recording core only adds and updates rows; querying and reconciliation
//! belong to whoever owns the database. Two implementations: an in-memory
//! store and a SQLite store (`rusqlite`, WAL journal, schema created on open).

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::events::Event;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Recording {
    pub id: i64,
    pub stream_name: String,
    pub file_path: String,
    /// Unix seconds.
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub size_bytes: u64,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub codec: String,
    pub is_complete: bool,
}

pub trait RecordingStore: Send + Sync {
    /// Insert a row; returns its id.
    fn add_recording(&self, recording: &Recording) -> Result<i64>;

    /// Overwrite the row with `recording.id`.
    fn update_recording(&self, recording: &Recording) -> Result<()>;

    /// Newest incomplete row for `stream`.
    fn active_recording(&self, stream: &str) -> Result<Option<Recording>>;

    fn add_event(&self, event: &Event) -> Result<i64>;

    /// Rows for `stream` (or every stream), oldest first.
    fn list_recordings(&self, stream: Option<&str>) -> Result<Vec<Recording>>;
}

#[derive(Default)]
struct MemoryInner {
    recordings: Vec<Recording>,
    events: Vec<(i64, Event)>,
    next_id: i64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))
    }

    pub fn events(&self) -> Vec<Event> {
        self.lock()
            .map(|inner| inner.events.iter().map(|(_, e)| e.clone()).collect())
            .unwrap_or_default()
    }
}

impl RecordingStore for MemoryStore {
    fn add_recording(&self, recording: &Recording) -> Result<i64> {
        let mut inner = self.lock()?;
        inner.next_id += 1;
        let id = inner.next_id;
        inner.recordings.push(Recording {
            id,
            ..recording.clone()
        });
        Ok(id)
    }

    fn update_recording(&self, recording: &Recording) -> Result<()> {
        let mut inner = self.lock()?;
        let row = inner
            .recordings
            .iter_mut()
            .find(|r| r.id == recording.id)
            .ok_or_else(|| anyhow!("recording {} not found", recording.id))?;
        *row = recording.clone();
        Ok(())
    }

    fn active_recording(&self, stream: &str) -> Result<Option<Recording>> {
        Ok(self
            .lock()?
            .recordings
            .iter()
            .rev()
            .find(|r| r.stream_name == stream && !r.is_complete)
            .cloned())
    }

    fn add_event(&self, event: &Event) -> Result<i64> {
        let mut inner = self.lock()?;
        inner.next_id += 1;
        let id = inner.next_id;
        inner.events.push((id, event.clone()));
        Ok(id)
    }

    fn list_recordings(&self, stream: Option<&str>) -> Result<Vec<Recording>> {
        Ok(self
            .lock()?
            .recordings
            .iter()
            .filter(|r| stream.map_or(true, |s| r.stream_name == s))
            .cloned()
            .collect())
    }
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

const RECORDING_COLUMNS: &str = "id, stream_name, file_path, start_time, end_time, size_bytes, \
     width, height, fps, codec, is_complete";

impl SqliteStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("open recordings db {}", db_path.display()))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("recordings db lock poisoned"))
    }

    fn ensure_schema(&self) -> Result<()> {
        self.lock()?.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS recordings (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              stream_name TEXT NOT NULL,
              file_path TEXT NOT NULL,
              start_time INTEGER NOT NULL,
              end_time INTEGER,
              size_bytes INTEGER NOT NULL DEFAULT 0,
              width INTEGER NOT NULL DEFAULT 0,
              height INTEGER NOT NULL DEFAULT 0,
              fps INTEGER NOT NULL DEFAULT 0,
              codec TEXT NOT NULL DEFAULT '',
              is_complete INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              kind TEXT NOT NULL,
              stream_name TEXT NOT NULL,
              description TEXT NOT NULL,
              file_path TEXT,
              timestamp INTEGER NOT NULL,
              payload_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_recordings_stream ON recordings(stream_name, start_time);
            CREATE INDEX IF NOT EXISTS idx_events_stream ON events(stream_name, timestamp);
            "#,
        )?;
        Ok(())
    }

    fn row_to_recording(row: &Row<'_>) -> rusqlite::Result<Recording> {
        Ok(Recording {
            id: row.get(0)?,
            stream_name: row.get(1)?,
            file_path: row.get(2)?,
            start_time: row.get(3)?,
            end_time: row.get(4)?,
            size_bytes: row.get::<_, i64>(5)?.max(0) as u64,
            width: row.get(6)?,
            height: row.get(7)?,
            fps: row.get(8)?,
            codec: row.get(9)?,
            is_complete: row.get(10)?,
        })
    }
}

fn size_param(size: u64) -> Result<i64> {
    i64::try_from(size).map_err(|_| anyhow!("recording size {} exceeds i64 range", size))
}

impl RecordingStore for SqliteStore {
    fn add_recording(&self, r: &Recording) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO recordings (stream_name, file_path, start_time, end_time, size_bytes, \
             width, height, fps, codec, is_complete) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                r.stream_name,
                r.file_path,
                r.start_time,
                r.end_time,
                size_param(r.size_bytes)?,
                r.width,
                r.height,
                r.fps,
                r.codec,
                r.is_complete
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn update_recording(&self, r: &Recording) -> Result<()> {
        let changed = self.lock()?.execute(
            "UPDATE recordings SET stream_name = ?2, file_path = ?3, start_time = ?4, end_time = ?5, \
             size_bytes = ?6, width = ?7, height = ?8, fps = ?9, codec = ?10, is_complete = ?11 \
             WHERE id = ?1",
            params![
                r.id,
                r.stream_name,
                r.file_path,
                r.start_time,
                r.end_time,
                size_param(r.size_bytes)?,
                r.width,
                r.height,
                r.fps,
                r.codec,
                r.is_complete
            ],
        )?;
        if changed == 0 {
            return Err(anyhow!("recording {} not found", r.id));
        }
        Ok(())
    }

    fn active_recording(&self, stream: &str) -> Result<Option<Recording>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM recordings WHERE stream_name = ?1 AND is_complete = 0 \
             ORDER BY id DESC LIMIT 1",
            RECORDING_COLUMNS
        );
        let row = conn
            .query_row(&sql, params![stream], Self::row_to_recording)
            .optional()?;
        Ok(row)
    }

    fn add_event(&self, event: &Event) -> Result<i64> {
        let payload = serde_json::to_string(event)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO events (kind, stream_name, description, file_path, timestamp, payload_json) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.kind.as_str(),
                event.stream,
                event.description,
                event.file_path,
                event.timestamp,
                payload
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn list_recordings(&self, stream: Option<&str>) -> Result<Vec<Recording>> {
        let conn = self.lock()?;
        let rows = match stream {
            Some(stream) => {
                let sql = format!(
                    "SELECT {} FROM recordings WHERE stream_name = ?1 ORDER BY id",
                    RECORDING_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![stream], Self::row_to_recording)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let sql = format!("SELECT {} FROM recordings ORDER BY id", RECORDING_COLUMNS);
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], Self::row_to_recording)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::events::EventKind;
    use tempfile::tempdir;

    fn sample(stream: &str) -> Recording {
        Recording {
            stream_name: stream.to_string(),
            file_path: format!("/rec/{}/recording_20240101_000000.mp4", stream),
            start_time: 1_700_000_000,
            width: 640,
            height: 480,
            fps: 10,
            codec: "h264".to_string(),
            ..Default::default()
        }
    }

    fn exercise(store: &dyn RecordingStore) {
        let id = store.add_recording(&sample("cam1")).unwrap();
        store.add_recording(&sample("cam2")).unwrap();

        let mut active = store.active_recording("cam1").unwrap().expect("active row");
        assert_eq!(active.id, id);
        active.is_complete = true;
        active.end_time = Some(1_700_000_060);
        active.size_bytes = 4096;
        store.update_recording(&active).unwrap();

        assert!(store.active_recording("cam1").unwrap().is_none());
        let rows = store.list_recordings(Some("cam1")).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_complete);
        assert_eq!(rows[0].size_bytes, 4096);
        assert_eq!(store.list_recordings(None).unwrap().len(), 2);

        store
            .add_event(&Event::new(EventKind::RecordingStop, "cam1", "closed"))
            .unwrap();
        let missing = Recording {
            id: 999,
            ..sample("cam9")
        };
        assert!(store.update_recording(&missing).is_err());
    }

    #[test]
    fn memory_store_round() {
        let store = MemoryStore::new();
        exercise(&store);
        assert_eq!(store.events().len(), 1);
    }

    #[test]
    fn sqlite_store_round() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("db/recordings.db")).unwrap();
        exercise(&store);
    }

    #[test]
    fn sqlite_in_memory_opens() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.list_recordings(None).unwrap().is_empty());
    }
}
