//! Thread-safe priority event queue (C10), deduplicated by path.
//!
//! Lower priority numbers are drained first: LOCAL_DELETED, REMOTE_DELETED,
//! LOCAL_CREATED, LOCAL_MODIFIED, REMOTE_CREATED, REMOTE_MODIFIED,
//! TRANSFER_COMPLETE, TRANSFER_FAILED. Putting a second event for a path
//! already queued replaces the first rather than appending.

use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum EventKind {
    LocalDeleted,
    RemoteDeleted,
    LocalCreated,
    LocalModified,
    RemoteCreated,
    RemoteModified,
    TransferComplete,
    TransferFailed,
}

impl EventKind {
    fn priority(&self) -> u8 {
        match self {
            EventKind::LocalDeleted => 0,
            EventKind::RemoteDeleted => 1,
            EventKind::LocalCreated => 2,
            EventKind::LocalModified => 3,
            EventKind::RemoteCreated => 4,
            EventKind::RemoteModified => 5,
            EventKind::TransferComplete => 6,
            EventKind::TransferFailed => 7,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, EventKind::RemoteCreated | EventKind::RemoteModified | EventKind::RemoteDeleted)
    }

    pub fn is_local(&self) -> bool {
        matches!(self, EventKind::LocalCreated | EventKind::LocalModified | EventKind::LocalDeleted)
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SyncEvent {
    pub path: String,
    pub kind: EventKind,
    /// Populated for REMOTE_* events from the change log, used by the
    /// coordinator's conflict detection (§4.11).
    pub server_version: Option<i64>,
}

struct Inner {
    items: HashMap<String, SyncEvent>,
    persist: Option<Connection>,
}

pub struct EventQueue {
    inner: Mutex<Inner>,
    ready: Condvar,
}

impl EventQueue {
    pub fn new() -> Self {
        EventQueue {
            inner: Mutex::new(Inner { items: HashMap::new(), persist: None }),
            ready: Condvar::new(),
        }
    }

    /// Back the queue with a local table so pending events survive a
    /// daemon restart (grounded on the same connection family as C6).
    pub fn with_persistence(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS event_queue (path TEXT PRIMARY KEY, kind TEXT NOT NULL, server_version INTEGER)",
        )?;

        let mut items = HashMap::new();
        {
            let mut stmt = conn.prepare("SELECT path, kind, server_version FROM event_queue")?;
            let rows = stmt.query_map([], |row| {
                let path: String = row.get(0)?;
                let kind_json: String = row.get(1)?;
                let server_version: Option<i64> = row.get(2)?;
                Ok((path, kind_json, server_version))
            })?;
            for row in rows {
                let (path, kind_json, server_version) = row?;
                if let Ok(kind) = serde_json::from_str::<EventKind>(&kind_json) {
                    items.insert(path.clone(), SyncEvent { path, kind, server_version });
                }
            }
        }

        Ok(EventQueue { inner: Mutex::new(Inner { items, persist: Some(conn) }), ready: Condvar::new() })
    }

    pub fn put(&self, event: SyncEvent) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(conn) = &inner.persist {
            let kind_json = serde_json::to_string(&event.kind).unwrap_or_default();
            let _ = conn.execute(
                "INSERT INTO event_queue (path, kind, server_version) VALUES (?1, ?2, ?3)
                 ON CONFLICT(path) DO UPDATE SET kind = excluded.kind, server_version = excluded.server_version",
                params![event.path, kind_json, event.server_version],
            );
        }
        inner.items.insert(event.path.clone(), event);
        self.ready.notify_one();
    }

    fn pop_best(inner: &mut Inner) -> Option<SyncEvent> {
        let best_path = inner
            .items
            .values()
            .min_by_key(|e| e.kind.priority())
            .map(|e| e.path.clone())?;
        let event = inner.items.remove(&best_path);
        if let (Some(conn), Some(_)) = (&inner.persist, &event) {
            let _ = conn.execute("DELETE FROM event_queue WHERE path = ?1", params![best_path]);
        }
        event
    }

    /// Block up to `timeout` for an event; `None` on expiry.
    pub fn get(&self, timeout: Duration) -> Option<SyncEvent> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(event) = Self::pop_best(&mut inner) {
                return Some(event);
            }
            let (guard, result) = self.ready.wait_timeout(inner, timeout).unwrap();
            inner = guard;
            if result.timed_out() {
                return Self::pop_best(&mut inner);
            }
        }
    }

    pub fn get_nowait(&self) -> Option<SyncEvent> {
        let mut inner = self.inner.lock().unwrap();
        Self::pop_best(&mut inner)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_by_path_replaces_not_appends() {
        let q = EventQueue::new();
        q.put(SyncEvent { path: "a.txt".into(), kind: EventKind::LocalModified, server_version: None });
        q.put(SyncEvent { path: "a.txt".into(), kind: EventKind::LocalDeleted, server_version: None });
        assert_eq!(q.len(), 1);
        let event = q.get_nowait().unwrap();
        assert_eq!(event.kind, EventKind::LocalDeleted);
    }

    #[test]
    fn drains_in_priority_order() {
        let q = EventQueue::new();
        q.put(SyncEvent { path: "b.txt".into(), kind: EventKind::TransferFailed, server_version: None });
        q.put(SyncEvent { path: "a.txt".into(), kind: EventKind::LocalDeleted, server_version: None });
        q.put(SyncEvent { path: "c.txt".into(), kind: EventKind::RemoteCreated, server_version: Some(3) });

        assert_eq!(q.get_nowait().unwrap().path, "a.txt");
        assert_eq!(q.get_nowait().unwrap().path, "c.txt");
        assert_eq!(q.get_nowait().unwrap().path, "b.txt");
        assert!(q.get_nowait().is_none());
    }

    #[test]
    fn get_times_out_when_empty() {
        let q = EventQueue::new();
        assert!(q.get(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("queue.sqlite3");
        {
            let q = EventQueue::with_persistence(&db_path).unwrap();
            q.put(SyncEvent { path: "a.txt".into(), kind: EventKind::LocalModified, server_version: None });
        }
        let q = EventQueue::with_persistence(&db_path).unwrap();
        assert_eq!(q.len(), 1);
        assert_eq!(q.get_nowait().unwrap().path, "a.txt");
    }
}
