//! Change scanner (C7): local filesystem scan plus remote change-log
//! reconciliation, both expressed as `SyncEvent`s pushed onto the queue.

use std::path::Path;
use walkdir::WalkDir;

use crate::api::ApiClient;
use crate::db::{FileStatus, LocalDb};
use crate::ignore::IgnoreRules;
use crate::queue::{EventKind, EventQueue, SyncEvent};

/// Walk the sync folder and diff against local state (§4.7). Symlinks
/// and ignored paths are skipped.
pub fn scan_local(sync_root: &Path, db: &LocalDb, ignore: &IgnoreRules, queue: &EventQueue) -> anyhow::Result<()> {
    let mut seen = std::collections::HashSet::new();

    for entry in WalkDir::new(sync_root).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        if entry.path_is_symlink() || entry.file_type().is_dir() {
            continue;
        }

        let relative = match entry.path().strip_prefix(sync_root) {
            Ok(p) => p.to_string_lossy().replace('\\', "/"),
            Err(_) => continue,
        };
        if ignore.is_ignored(&relative, false) {
            continue;
        }

        seen.insert(relative.clone());

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let size = metadata.len() as i64;

        match db.get(&relative)? {
            None => {
                db.mark_new(&relative)?;
                queue.put(SyncEvent { path: relative, kind: EventKind::LocalCreated, server_version: None });
            }
            Some(state) => match state.status {
                FileStatus::Synced if state.local_mtime != Some(mtime) || state.local_size != Some(size) => {
                    db.mark_modified(&relative)?;
                    queue.put(SyncEvent { path: relative, kind: EventKind::LocalModified, server_version: None });
                }
                FileStatus::New | FileStatus::Modified => {
                    // Re-emit idempotently: the coordinator/worker pool may
                    // not have drained the earlier event yet.
                    let kind = if state.status == FileStatus::New {
                        EventKind::LocalCreated
                    } else {
                        EventKind::LocalModified
                    };
                    queue.put(SyncEvent { path: relative, kind, server_version: None });
                }
                _ => {}
            },
        }
    }

    // Anything SYNCED in state but absent on disk is a local deletion.
    for state in db.list_by_status(FileStatus::Synced)? {
        if !seen.contains(&state.path) {
            db.mark_deleted(&state.path)?;
            queue.put(SyncEvent { path: state.path, kind: EventKind::LocalDeleted, server_version: None });
        }
    }

    Ok(())
}

/// Reconcile remote state (§4.7). With a cursor, fetches the incremental
/// change log; without one (or on a failed incremental fetch), falls
/// back to a full listing diffed against local state — a path that
/// cannot detect remote deletions (§9's known limitation).
pub async fn scan_remote(api: &ApiClient, db: &LocalDb, queue: &EventQueue) -> anyhow::Result<()> {
    match db.get_cursor()? {
        Some(cursor) => match scan_remote_incremental(api, db, queue, &cursor).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, "incremental change fetch failed, falling back to full listing");
                scan_remote_fallback(api, db, queue).await
            }
        },
        None => scan_remote_fallback(api, db, queue).await,
    }
}

async fn scan_remote_incremental(
    api: &ApiClient,
    db: &LocalDb,
    queue: &EventQueue,
    cursor: &str,
) -> anyhow::Result<()> {
    let mut since = cursor.to_string();
    loop {
        let page = api.get_changes(Some(&since), 500).await?;
        for change in &page.changes {
            enqueue_remote_change(db, queue, &change.file_path, &change.action, change.version)?;
        }
        db.set_cursor(&page.latest_timestamp)?;
        since = page.latest_timestamp.clone();
        if !page.has_more {
            break;
        }
    }
    Ok(())
}

async fn scan_remote_fallback(api: &ApiClient, db: &LocalDb, queue: &EventQueue) -> anyhow::Result<()> {
    let files = api.list_files(None).await?;
    for file in files {
        let local = db.get(&file.path)?;
        let is_new_or_changed = match &local {
            None => true,
            Some(state) => state.server_version != Some(file.version),
        };
        if is_new_or_changed {
            let action = if local.is_none() { "CREATED" } else { "UPDATED" };
            enqueue_remote_change(db, queue, &file.path, action, file.version)?;
        }
    }

    if let Ok(latest) = api.get_changes(None, 1).await {
        db.set_cursor(&latest.latest_timestamp)?;
    }
    Ok(())
}

fn enqueue_remote_change(db: &LocalDb, queue: &EventQueue, path: &str, action: &str, version: i64) -> anyhow::Result<()> {
    // Local edits in flight take priority over remote notifications; the
    // upload-side conflict protocol (C13) is what reconciles these.
    if let Some(state) = db.get(path)? {
        if matches!(state.status, FileStatus::Modified | FileStatus::New | FileStatus::Conflict) {
            return Ok(());
        }
    }

    let kind = match action {
        "CREATED" => EventKind::RemoteCreated,
        "DELETED" => EventKind::RemoteDeleted,
        _ => EventKind::RemoteModified,
    };
    queue.put(SyncEvent { path: path.to_string(), kind, server_version: Some(version) });
    Ok(())
}
