//! Local state store (C6): per-path sync state, in-flight upload
//! progress, and the incremental-sync cursor. SQLite via `rusqlite`,
//! guarded by one mutex so writes are serialized into single
//! transactions; the connection is never updated optimistically ahead
//! of server confirmation.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Synced,
    Modified,
    New,
    PendingUpload,
    Conflict,
    Deleted,
}

impl FileStatus {
    fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Synced => "SYNCED",
            FileStatus::Modified => "MODIFIED",
            FileStatus::New => "NEW",
            FileStatus::PendingUpload => "PENDING_UPLOAD",
            FileStatus::Conflict => "CONFLICT",
            FileStatus::Deleted => "DELETED",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "MODIFIED" => FileStatus::Modified,
            "NEW" => FileStatus::New,
            "PENDING_UPLOAD" => FileStatus::PendingUpload,
            "CONFLICT" => FileStatus::Conflict,
            "DELETED" => FileStatus::Deleted,
            _ => FileStatus::Synced,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileState {
    pub path: String,
    pub server_file_id: Option<i64>,
    pub server_version: Option<i64>,
    pub local_mtime: Option<i64>,
    pub local_size: Option<i64>,
    pub local_content_hash: Option<String>,
    pub chunk_hashes: Vec<String>,
    pub status: FileStatus,
    pub last_synced_at: Option<i64>,
}

impl FileState {
    pub fn new(path: &str, status: FileStatus) -> Self {
        FileState {
            path: path.to_string(),
            server_file_id: None,
            server_version: None,
            local_mtime: None,
            local_size: None,
            local_content_hash: None,
            chunk_hashes: Vec::new(),
            status,
            last_synced_at: None,
        }
    }
}

#[derive(Clone)]
pub struct LocalDb {
    conn: Arc<Mutex<Connection>>,
}

impl LocalDb {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS files (
                path TEXT PRIMARY KEY,
                server_file_id INTEGER,
                server_version INTEGER,
                local_mtime INTEGER,
                local_size INTEGER,
                local_content_hash TEXT,
                chunk_hashes TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL,
                last_synced_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_files_status ON files(status);

            CREATE TABLE IF NOT EXISTS upload_progress (
                path TEXT PRIMARY KEY,
                expected_chunks TEXT NOT NULL,
                acknowledged_chunks TEXT NOT NULL DEFAULT '[]',
                started_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sync_state (
                key TEXT PRIMARY KEY,
                value TEXT
            );
            "#,
        )?;
        Ok(LocalDb { conn: Arc::new(Mutex::new(conn)) })
    }

    fn row_to_state(row: &rusqlite::Row) -> rusqlite::Result<FileState> {
        let chunk_json: String = row.get(6)?;
        let status: String = row.get(7)?;
        Ok(FileState {
            path: row.get(0)?,
            server_file_id: row.get(1)?,
            server_version: row.get(2)?,
            local_mtime: row.get(3)?,
            local_size: row.get(4)?,
            local_content_hash: row.get(5)?,
            chunk_hashes: serde_json::from_str(&chunk_json).unwrap_or_default(),
            status: FileStatus::parse(&status),
            last_synced_at: row.get(8)?,
        })
    }

    pub fn get(&self, path: &str) -> anyhow::Result<Option<FileState>> {
        let conn = self.conn.lock().unwrap();
        let result = conn
            .query_row(
                "SELECT path, server_file_id, server_version, local_mtime, local_size,
                        local_content_hash, chunk_hashes, status, last_synced_at
                 FROM files WHERE path = ?1",
                params![path],
                Self::row_to_state,
            )
            .optional()?;
        Ok(result)
    }

    pub fn upsert(&self, state: &FileState) -> anyhow::Result<()> {
        let chunk_json = serde_json::to_string(&state.chunk_hashes)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO files (path, server_file_id, server_version, local_mtime, local_size,
                                 local_content_hash, chunk_hashes, status, last_synced_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(path) DO UPDATE SET
                server_file_id = excluded.server_file_id,
                server_version = excluded.server_version,
                local_mtime = excluded.local_mtime,
                local_size = excluded.local_size,
                local_content_hash = excluded.local_content_hash,
                chunk_hashes = excluded.chunk_hashes,
                status = excluded.status,
                last_synced_at = excluded.last_synced_at",
            params![
                state.path,
                state.server_file_id,
                state.server_version,
                state.local_mtime,
                state.local_size,
                state.local_content_hash,
                chunk_json,
                state.status.as_str(),
                state.last_synced_at,
            ],
        )?;
        Ok(())
    }

    pub fn delete(&self, path: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM files WHERE path = ?1", params![path])?;
        Ok(())
    }

    pub fn list_by_status(&self, status: FileStatus) -> anyhow::Result<Vec<FileState>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT path, server_file_id, server_version, local_mtime, local_size,
                    local_content_hash, chunk_hashes, status, last_synced_at
             FROM files WHERE status = ?1",
        )?;
        let rows = stmt.query_map(params![status.as_str()], Self::row_to_state)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn list_all(&self) -> anyhow::Result<Vec<FileState>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT path, server_file_id, server_version, local_mtime, local_size,
                    local_content_hash, chunk_hashes, status, last_synced_at
             FROM files",
        )?;
        let rows = stmt.query_map([], Self::row_to_state)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn mark_synced(
        &self,
        path: &str,
        server_file_id: i64,
        server_version: i64,
        chunk_hashes: &[String],
        local_mtime: i64,
        local_size: i64,
        local_content_hash: &str,
    ) -> anyhow::Result<()> {
        let state = FileState {
            path: path.to_string(),
            server_file_id: Some(server_file_id),
            server_version: Some(server_version),
            local_mtime: Some(local_mtime),
            local_size: Some(local_size),
            local_content_hash: Some(local_content_hash.to_string()),
            chunk_hashes: chunk_hashes.to_vec(),
            status: FileStatus::Synced,
            last_synced_at: Some(now()),
        };
        self.upsert(&state)
    }

    fn mark_status(&self, path: &str, status: FileStatus) -> anyhow::Result<()> {
        let mut state = self.get(path)?.unwrap_or_else(|| FileState::new(path, status));
        state.status = status;
        self.upsert(&state)
    }

    pub fn mark_modified(&self, path: &str) -> anyhow::Result<()> {
        self.mark_status(path, FileStatus::Modified)
    }

    pub fn mark_new(&self, path: &str) -> anyhow::Result<()> {
        self.mark_status(path, FileStatus::New)
    }

    pub fn mark_deleted(&self, path: &str) -> anyhow::Result<()> {
        self.mark_status(path, FileStatus::Deleted)
    }

    pub fn mark_conflict(&self, path: &str) -> anyhow::Result<()> {
        self.mark_status(path, FileStatus::Conflict)
    }

    pub fn mark_pending_upload(&self, path: &str) -> anyhow::Result<()> {
        self.mark_status(path, FileStatus::PendingUpload)
    }

    // --- Upload progress (survives restart) ---

    pub fn start_upload(&self, path: &str, expected_chunks: &[String]) -> anyhow::Result<()> {
        let expected_json = serde_json::to_string(expected_chunks)?;
        let conn = self.conn.lock().unwrap();
        let ts = now();
        conn.execute(
            "INSERT INTO upload_progress (path, expected_chunks, acknowledged_chunks, started_at, updated_at)
             VALUES (?1, ?2, '[]', ?3, ?3)
             ON CONFLICT(path) DO UPDATE SET expected_chunks = excluded.expected_chunks, updated_at = excluded.updated_at",
            params![path, expected_json, ts],
        )?;
        Ok(())
    }

    pub fn mark_chunk_uploaded(&self, path: &str, hash: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        let acked_json: Option<String> = conn
            .query_row(
                "SELECT acknowledged_chunks FROM upload_progress WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        let Some(acked_json) = acked_json else {
            return Ok(());
        };
        let mut acked: Vec<String> = serde_json::from_str(&acked_json).unwrap_or_default();
        if !acked.iter().any(|h| h == hash) {
            acked.push(hash.to_string());
        }
        conn.execute(
            "UPDATE upload_progress SET acknowledged_chunks = ?1, updated_at = ?2 WHERE path = ?3",
            params![serde_json::to_string(&acked)?, now(), path],
        )?;
        Ok(())
    }

    /// Chunk hashes still awaiting acknowledgment, preserving original order.
    pub fn remaining_chunks(&self, path: &str) -> anyhow::Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT expected_chunks, acknowledged_chunks FROM upload_progress WHERE path = ?1",
                params![path],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((expected_json, acked_json)) = row else {
            return Ok(Vec::new());
        };
        let expected: Vec<String> = serde_json::from_str(&expected_json).unwrap_or_default();
        let acked: Vec<String> = serde_json::from_str(&acked_json).unwrap_or_default();
        Ok(expected.into_iter().filter(|h| !acked.contains(h)).collect())
    }

    pub fn clear_upload_progress(&self, path: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM upload_progress WHERE path = ?1", params![path])?;
        Ok(())
    }

    // --- Sync cursor ---

    pub fn get_cursor(&self) -> anyhow::Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let result = conn
            .query_row("SELECT value FROM sync_state WHERE key = 'cursor'", [], |row| row.get(0))
            .optional()?;
        Ok(result)
    }

    pub fn set_cursor(&self, cursor: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sync_state (key, value) VALUES ('cursor', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![cursor],
        )?;
        Ok(())
    }
}

fn now() -> i64 {
    // Wall-clock timestamps here are advisory bookkeeping (progress
    // staleness, mtimes), never used for ordering guarantees — those come
    // from the server's monotonic version/change-log columns.
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn db() -> LocalDb {
        let dir = tempdir().unwrap();
        LocalDb::open(&dir.path().join("state.sqlite3")).unwrap()
    }

    #[test]
    fn upsert_and_get_round_trips() {
        let db = db();
        let mut state = FileState::new("docs/a.txt", FileStatus::New);
        state.chunk_hashes = vec!["aaa".to_string(), "bbb".to_string()];
        db.upsert(&state).unwrap();

        let fetched = db.get("docs/a.txt").unwrap().unwrap();
        assert_eq!(fetched.chunk_hashes, vec!["aaa", "bbb"]);
        assert_eq!(fetched.status, FileStatus::New);
    }

    #[test]
    fn mark_synced_then_list_by_status() {
        let db = db();
        db.mark_new("a.txt").unwrap();
        db.mark_new("b.txt").unwrap();
        db.mark_synced("a.txt", 1, 1, &["h1".to_string()], 123, 456, "hash").unwrap();

        let new_files = db.list_by_status(FileStatus::New).unwrap();
        assert_eq!(new_files.len(), 1);
        assert_eq!(new_files[0].path, "b.txt");

        let synced = db.list_by_status(FileStatus::Synced).unwrap();
        assert_eq!(synced.len(), 1);
        assert_eq!(synced[0].server_version, Some(1));
    }

    #[test]
    fn upload_progress_tracks_remaining_chunks() {
        let db = db();
        let chunks = vec!["h1".to_string(), "h2".to_string(), "h3".to_string()];
        db.start_upload("big.bin", &chunks).unwrap();
        db.mark_chunk_uploaded("big.bin", "h2").unwrap();

        let remaining = db.remaining_chunks("big.bin").unwrap();
        assert_eq!(remaining, vec!["h1".to_string(), "h3".to_string()]);

        db.clear_upload_progress("big.bin").unwrap();
        assert!(db.remaining_chunks("big.bin").unwrap().is_empty());
    }

    #[test]
    fn cursor_persists() {
        let db = db();
        assert_eq!(db.get_cursor().unwrap(), None);
        db.set_cursor("2024-01-01T00:00:00Z").unwrap();
        assert_eq!(db.get_cursor().unwrap(), Some("2024-01-01T00:00:00Z".to_string()));
    }
}
