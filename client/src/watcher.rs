//! Filesystem watcher (C8): a recursive `notify` watcher debounced into
//! `SyncEvent`s. Renames are split into a delete of the old path and a
//! create of the new one rather than modeled as a first-class move,
//! matching how the coordinator already treats LOCAL_DELETED/LOCAL_CREATED.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::time::{Duration, Instant};

use notify::{Event, EventKind as NotifyEventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::ignore::IgnoreRules;
use crate::queue::{EventKind, EventQueue, SyncEvent};

const DEBOUNCE: Duration = Duration::from_millis(250);

/// Runs until `stop` is set, watching `sync_root` recursively and pushing
/// debounced events onto `queue`. Intended to run on a dedicated thread.
pub fn run(sync_root: PathBuf, ignore: IgnoreRules, queue: std::sync::Arc<EventQueue>, stop: std::sync::Arc<std::sync::atomic::AtomicBool>) -> anyhow::Result<()> {
    let (tx, rx) = channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res| {
        let _ = tx.send(res);
    })?;
    watcher.watch(&sync_root, RecursiveMode::Recursive)?;

    let mut pending: HashMap<PathBuf, Instant> = HashMap::new();

    loop {
        if stop.load(std::sync::atomic::Ordering::Relaxed) {
            return Ok(());
        }

        match rx.recv_timeout(DEBOUNCE) {
            Ok(Ok(event)) => record_paths(&event, &mut pending),
            Ok(Err(_)) => {}
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        }

        flush_ready(&sync_root, &ignore, &queue, &mut pending);
    }
}

fn record_paths(event: &Event, pending: &mut HashMap<PathBuf, Instant>) {
    if matches!(event.kind, NotifyEventKind::Access(_)) {
        return;
    }
    let now = Instant::now();
    for path in &event.paths {
        pending.insert(path.clone(), now);
    }
}

fn flush_ready(sync_root: &Path, ignore: &IgnoreRules, queue: &EventQueue, pending: &mut HashMap<PathBuf, Instant>) {
    let now = Instant::now();
    let ready: Vec<PathBuf> = pending
        .iter()
        .filter(|(_, seen)| now.duration_since(**seen) >= DEBOUNCE)
        .map(|(path, _)| path.clone())
        .collect();

    for path in ready {
        pending.remove(&path);

        if path.is_symlink() {
            continue;
        }

        let relative = match path.strip_prefix(sync_root) {
            Ok(p) => p.to_string_lossy().replace('\\', "/"),
            Err(_) => continue,
        };
        if relative.is_empty() {
            continue;
        }

        let is_dir = path.is_dir();
        if ignore.is_ignored(&relative, is_dir) {
            continue;
        }
        if is_dir {
            // Directory creation/removal is handled indirectly: the next
            // scan picks up files that moved with it.
            continue;
        }

        let kind = if path.exists() {
            EventKind::LocalModified
        } else {
            EventKind::LocalDeleted
        };
        queue.put(SyncEvent { path: relative, kind, server_version: None });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignored_paths_are_skipped_from_flush() {
        let dir = tempfile::tempdir().unwrap();
        let ignore = IgnoreRules::load(dir.path());
        let queue = EventQueue::new();
        let mut pending = HashMap::new();
        let git_path = dir.path().join(".git").join("HEAD");
        std::fs::create_dir_all(git_path.parent().unwrap()).unwrap();
        std::fs::write(&git_path, b"ref: refs/heads/main").unwrap();
        pending.insert(git_path, Instant::now() - DEBOUNCE * 2);

        flush_ready(dir.path(), &ignore, &queue, &mut pending);
        assert!(queue.is_empty());
    }

    #[test]
    fn modified_file_emits_local_modified() {
        let dir = tempfile::tempdir().unwrap();
        let ignore = IgnoreRules::load(dir.path());
        let queue = EventQueue::new();
        let mut pending = HashMap::new();
        let file_path = dir.path().join("a.txt");
        std::fs::write(&file_path, b"hello").unwrap();
        pending.insert(file_path, Instant::now() - DEBOUNCE * 2);

        flush_ready(dir.path(), &ignore, &queue, &mut pending);
        let event = queue.get_nowait().unwrap();
        assert_eq!(event.path, "a.txt");
        assert_eq!(event.kind, EventKind::LocalModified);
    }
}
