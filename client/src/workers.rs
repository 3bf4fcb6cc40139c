//! Worker pool (C12) plus the three transfer protocols it dispatches to
//! (C13): Uploader, Downloader, Deleter.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;

use crate::api::{ApiClient, ApiError};
use crate::chunking::{chunk_bytes, decrypt_chunk, encrypt_chunk, hash_bytes};
use crate::db::LocalDb;
use crate::keystore::KEY_LEN;
use crate::queue::{EventKind, EventQueue, SyncEvent};

const MAX_ATTEMPTS: u32 = 5;
const MID_TRANSFER_RECHECK_INTERVAL: usize = 10;
const SPEED_WINDOW: Duration = Duration::from_secs(5);

/// Live per-machine counters reported over the status socket (§4.5):
/// in-progress transfer counts plus a 5s sliding-window byte rate, matching
/// the sample-list approach the original worker pool used for its own
/// `upload_speed`/`download_speed` properties.
#[derive(Default)]
pub struct TransferStats {
    uploads_active: AtomicU32,
    downloads_active: AtomicU32,
    upload_samples: Mutex<VecDeque<(Instant, u64)>>,
    download_samples: Mutex<VecDeque<(Instant, u64)>>,
}

impl TransferStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(samples: &Mutex<VecDeque<(Instant, u64)>>, bytes: u64) {
        let mut samples = samples.lock().unwrap();
        let now = Instant::now();
        samples.push_back((now, bytes));
        while samples.front().is_some_and(|(t, _)| now.duration_since(*t) > SPEED_WINDOW) {
            samples.pop_front();
        }
    }

    fn speed(samples: &Mutex<VecDeque<(Instant, u64)>>) -> f64 {
        let samples = samples.lock().unwrap();
        if samples.is_empty() {
            return 0.0;
        }
        let now = Instant::now();
        let total: u64 = samples.iter().filter(|(t, _)| now.duration_since(*t) <= SPEED_WINDOW).map(|(_, b)| b).sum();
        let elapsed = samples.front().map(|(t, _)| now.duration_since(*t).as_secs_f64()).unwrap_or(0.0).max(1.0);
        total as f64 / elapsed
    }

    pub fn record_upload_bytes(&self, bytes: u64) {
        Self::record(&self.upload_samples, bytes);
    }

    pub fn record_download_bytes(&self, bytes: u64) {
        Self::record(&self.download_samples, bytes);
    }

    pub fn upload_speed(&self) -> f64 {
        Self::speed(&self.upload_samples)
    }

    pub fn download_speed(&self) -> f64 {
        Self::speed(&self.download_samples)
    }

    pub fn uploads_active(&self) -> u32 {
        self.uploads_active.load(Ordering::Relaxed)
    }

    pub fn downloads_active(&self) -> u32 {
        self.downloads_active.load(Ordering::Relaxed)
    }

    fn enter(&self, transfer_type: TransferType) {
        match transfer_type {
            TransferType::Upload => self.uploads_active.fetch_add(1, Ordering::Relaxed),
            TransferType::Download => self.downloads_active.fetch_add(1, Ordering::Relaxed),
            TransferType::Delete => 0,
        };
    }

    fn exit(&self, transfer_type: TransferType) {
        match transfer_type {
            TransferType::Upload => self.uploads_active.fetch_sub(1, Ordering::Relaxed),
            TransferType::Download => self.downloads_active.fetch_sub(1, Ordering::Relaxed),
            TransferType::Delete => 0,
        };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Upload,
    Download,
    Delete,
}

/// Per-run outcome counts for the CLI's end-of-run summary line (§7):
/// uploaded, downloaded, deleted, conflicts, errors.
#[derive(Default)]
pub struct RunSummary {
    pub uploaded: AtomicU32,
    pub downloaded: AtomicU32,
    pub deleted: AtomicU32,
    pub conflicts: AtomicU32,
    pub errors: AtomicU32,
}

impl RunSummary {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> (u32, u32, u32, u32, u32) {
        (
            self.uploaded.load(Ordering::Relaxed),
            self.downloaded.load(Ordering::Relaxed),
            self.deleted.load(Ordering::Relaxed),
            self.conflicts.load(Ordering::Relaxed),
            self.errors.load(Ordering::Relaxed),
        )
    }
}

#[derive(Clone)]
pub struct Task {
    pub path: String,
    pub transfer_type: TransferType,
    /// The event that started this transfer. Deleter uses this to tell a
    /// local deletion (always propagates) from a remote one (only applies
    /// if nothing changed locally since the last synced state).
    pub origin: EventKind,
    pub cancel_requested: Arc<AtomicBool>,
}

struct Inner {
    queue: VecDeque<Task>,
}

/// Bounded task queue driving N concurrent worker loops, each of which
/// calls into the matching transfer protocol below. `new_noop` exists so
/// unit tests can exercise the coordinator without a live runtime.
pub struct WorkerPool {
    inner: Arc<Mutex<Inner>>,
    ready: Arc<Condvar>,
    concurrency: Arc<Semaphore>,
    active: Arc<AtomicU32>,
    noop: bool,
}

impl WorkerPool {
    pub fn new(concurrency: usize) -> Self {
        WorkerPool {
            inner: Arc::new(Mutex::new(Inner { queue: VecDeque::new() })),
            ready: Arc::new(Condvar::new()),
            concurrency: Arc::new(Semaphore::new(concurrency)),
            active: Arc::new(AtomicU32::new(0)),
            noop: false,
        }
    }

    /// N = max(cpu_count, 2), matching the default policy.
    pub fn default_sized() -> Self {
        let n = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2).max(2);
        Self::new(n)
    }

    pub fn new_noop() -> Self {
        let mut pool = Self::new(1);
        pool.noop = true;
        pool
    }

    pub fn submit(&self, task: Task) {
        if self.noop {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.queue.push_back(task);
        self.ready.notify_one();
    }

    fn next_task(&self, stop: &AtomicBool) -> Option<Task> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(task) = inner.queue.pop_front() {
                return Some(task);
            }
            if stop.load(Ordering::Relaxed) {
                return None;
            }
            let (guard, _) = self.ready.wait_timeout(inner, Duration::from_millis(250)).unwrap();
            inner = guard;
        }
    }

    pub fn active_count(&self) -> u32 {
        self.active.load(Ordering::Relaxed)
    }

    /// Spawns `concurrency` tokio tasks, each looping on `next_task` until
    /// `stop` is set and the queue drains. Retries network-class errors by
    /// blocking on `wait_for_network` before re-enqueueing unchanged;
    /// everything else gets capped exponential backoff.
    pub fn run(
        self: Arc<Self>,
        ctx: Arc<WorkerContext>,
        stop: Arc<AtomicBool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let permits = self.concurrency.available_permits();
        (0..permits)
            .map(|_| {
                let pool = self.clone();
                let ctx = ctx.clone();
                let stop = stop.clone();
                tokio::spawn(async move { pool.worker_loop(ctx, stop).await })
            })
            .collect()
    }

    async fn worker_loop(self: Arc<Self>, ctx: Arc<WorkerContext>, stop: Arc<AtomicBool>) {
        loop {
            let task = match self.next_task(&stop) {
                Some(t) => t,
                None => return,
            };

            self.active.fetch_add(1, Ordering::Relaxed);
            ctx.stats.enter(task.transfer_type);
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                let result = run_transfer(&ctx, &task).await;
                match result {
                    Ok(()) => {
                        match task.transfer_type {
                            TransferType::Upload => ctx.summary.uploaded.fetch_add(1, Ordering::Relaxed),
                            TransferType::Download => ctx.summary.downloaded.fetch_add(1, Ordering::Relaxed),
                            TransferType::Delete => ctx.summary.deleted.fetch_add(1, Ordering::Relaxed),
                        };
                        ctx.queue.put(SyncEvent {
                            path: task.path.clone(),
                            kind: EventKind::TransferComplete,
                            server_version: None,
                        });
                        break;
                    }
                    Err(TransferError::Cancelled) => break,
                    Err(TransferError::Api(e)) if e.is_network() => {
                        wait_for_network(&ctx.api).await;
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(path = %task.path, attempt, error = %e, "transfer attempt failed");
                        if attempt >= MAX_ATTEMPTS {
                            ctx.summary.errors.fetch_add(1, Ordering::Relaxed);
                            ctx.queue.put(SyncEvent {
                                path: task.path.clone(),
                                kind: EventKind::TransferFailed,
                                server_version: None,
                            });
                            break;
                        }
                        let backoff = Duration::from_millis(200 * 2u64.pow(attempt.min(6)));
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
            ctx.stats.exit(task.transfer_type);
            self.active.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

async fn wait_for_network(api: &ApiClient) {
    loop {
        if api.health().await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

#[derive(Debug, thiserror::Error)]
enum TransferError {
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("content decrypt failed")]
    Crypto,
    #[error("early conflict: server version changed")]
    EarlyConflict,
}

pub struct WorkerContext {
    pub api: Arc<ApiClient>,
    pub db: LocalDb,
    pub queue: Arc<EventQueue>,
    pub sync_root: PathBuf,
    pub key: [u8; KEY_LEN],
    pub machine_name: String,
    pub stats: Arc<TransferStats>,
    pub summary: Arc<RunSummary>,
}

async fn run_transfer(ctx: &WorkerContext, task: &Task) -> Result<(), TransferError> {
    match task.transfer_type {
        TransferType::Upload => upload(ctx, task).await,
        TransferType::Download => download(ctx, task).await,
        TransferType::Delete => delete(ctx, task).await,
    }
}

fn check_cancelled(task: &Task) -> Result<(), TransferError> {
    if task.cancel_requested.load(Ordering::Relaxed) {
        Err(TransferError::Cancelled)
    } else {
        Ok(())
    }
}

/// Uploader: pre-check → chunk/encrypt → HEAD-then-PUT each chunk,
/// re-checking the server version every K chunks → commit via create-or-
/// update, resolving false conflicts by content hash and genuine ones via
/// a renamed conflict copy.
async fn upload(ctx: &WorkerContext, task: &Task) -> Result<(), TransferError> {
    check_cancelled(task)?;

    let existing = ctx.db.get(&task.path).ok().flatten();
    let base_version = existing.as_ref().and_then(|s| s.server_version);

    if let Some(version) = base_version {
        if let Ok(remote) = ctx.api.get_file(&task.path).await {
            if remote.version != version {
                return handle_upload_conflict(ctx, task, remote.content_hash).await;
            }
        }
    }

    let full_path = ctx.sync_root.join(&task.path);
    let data = tokio::fs::read(&full_path).await?;
    let content_hash = hash_bytes(&data);
    let chunks = chunk_bytes(&data);
    let chunk_hashes: Vec<String> = chunks.iter().map(|c| c.hash.clone()).collect();

    ctx.db.start_upload(&task.path, &chunk_hashes).ok();
    ctx.db.mark_pending_upload(&task.path).ok();

    for (i, chunk) in chunks.iter().enumerate() {
        check_cancelled(task)?;

        if i > 0 && i % MID_TRANSFER_RECHECK_INTERVAL == 0 {
            if let (Some(version), Ok(remote)) = (base_version, ctx.api.get_file(&task.path).await) {
                if remote.version != version {
                    return handle_upload_conflict(ctx, task, remote.content_hash).await;
                }
            }
        }

        if !ctx.api.chunk_exists(&chunk.hash).await.unwrap_or(false) {
            let blob = encrypt_chunk(&ctx.key, &chunk.data);
            ctx.api.upload_chunk(&chunk.hash, blob).await?;
        }
        ctx.stats.record_upload_bytes(chunk.data.len() as u64);
        ctx.db.mark_chunk_uploaded(&task.path, &chunk.hash).ok();
    }

    check_cancelled(task)?;

    let result = if let Some(version) = base_version {
        ctx.api.update_file(&task.path, data.len() as i64, &content_hash, version, &chunk_hashes).await
    } else {
        match ctx.api.create_file(&task.path, data.len() as i64, &content_hash, &chunk_hashes).await {
            Err(ApiError::Server { status: 409, .. }) => {
                let remote = ctx.api.get_file(&task.path).await?;
                ctx.api
                    .update_file(&task.path, data.len() as i64, &content_hash, remote.version, &chunk_hashes)
                    .await
            }
            other => other,
        }
    };

    let file = match result {
        Ok(f) => f,
        Err(ApiError::Conflict) => {
            let remote = ctx.api.get_file(&task.path).await?;
            return handle_upload_conflict(ctx, task, remote.content_hash).await;
        }
        Err(e) => return Err(e.into()),
    };

    ctx.db.clear_upload_progress(&task.path).ok();
    let mtime = mtime_secs(&full_path).await;
    ctx.db
        .mark_synced(&task.path, file.id, file.version, &chunk_hashes, mtime, data.len() as i64, &content_hash)
        .ok();
    Ok(())
}

/// Auto-heals false conflicts (identical content hash) by adopting the
/// server's version; genuine conflicts get a renamed local copy and the
/// server's content downloaded to the original path.
async fn handle_upload_conflict(ctx: &WorkerContext, task: &Task, remote_hash: String) -> Result<(), TransferError> {
    let full_path = ctx.sync_root.join(&task.path);
    let mtime_at_read = mtime_secs(&full_path).await;
    let data = tokio::fs::read(&full_path).await?;
    let local_hash = hash_bytes(&data);

    if local_hash == remote_hash {
        let remote = ctx.api.get_file(&task.path).await?;
        let mtime = mtime_secs(&full_path).await;
        let chunks = ctx.api.get_file_chunks(&task.path).await.unwrap_or_default();
        ctx.db
            .mark_synced(&task.path, remote.id, remote.version, &chunks, mtime, data.len() as i64, &local_hash)
            .ok();
        return Ok(());
    }

    ctx.db.mark_conflict(&task.path).ok();
    ctx.summary.conflicts.fetch_add(1, Ordering::Relaxed);

    let conflict_path = conflict_copy_path(&task.path, &ctx.machine_name);
    let conflict_full = ctx.sync_root.join(&conflict_path);
    if let Some(parent) = conflict_full.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    // Re-stat right before the rename: if the file was touched again since
    // we read it above, bail without renaming and let the caller retry
    // against the now-current content instead of conflict-copying stale bytes.
    if mtime_secs(&full_path).await != mtime_at_read {
        return Err(TransferError::EarlyConflict);
    }
    tokio::fs::rename(&full_path, &conflict_full).await?;

    download_to_path(ctx, task, &full_path).await?;
    let remote = ctx.api.get_file(&task.path).await?;
    let mtime = mtime_secs(&full_path).await;
    let chunks = ctx.api.get_file_chunks(&task.path).await.unwrap_or_default();
    ctx.db
        .mark_synced(&task.path, remote.id, remote.version, &chunks, mtime, remote.size, &remote.content_hash)
        .ok();
    ctx.db.mark_new(&conflict_path).ok();
    tracing::warn!(path = %task.path, conflict = %conflict_path, "upload conflict resolved with local copy");
    Ok(())
}

/// Builds the sibling conflict-copy path `<stem>.conflict-<timestamp>-<machine>.<ext>`.
fn conflict_copy_path(path: &str, machine: &str) -> String {
    let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S%3f");
    match path.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            format!("{stem}.conflict-{timestamp}-{machine}.{ext}")
        }
        _ => format!("{path}.conflict-{timestamp}-{machine}"),
    }
}

/// Downloader: conflict-check, ordered chunk fetch/decrypt into a `.tmp`
/// sibling, atomic rename on completion.
async fn download(ctx: &WorkerContext, task: &Task) -> Result<(), TransferError> {
    check_cancelled(task)?;

    let full_path = ctx.sync_root.join(&task.path);
    if let Some(local) = ctx.db.get(&task.path).ok().flatten() {
        if matches!(
            local.status,
            crate::db::FileStatus::Modified | crate::db::FileStatus::New | crate::db::FileStatus::PendingUpload
        ) {
            return handle_upload_conflict(ctx, task, ctx.api.get_file(&task.path).await?.content_hash).await;
        }
    }

    let file = ctx.api.get_file(&task.path).await?;
    download_to_path(ctx, task, &full_path).await?;

    let mtime = mtime_secs(&full_path).await;
    let chunks = ctx.api.get_file_chunks(&task.path).await.unwrap_or_default();
    ctx.db
        .mark_synced(&task.path, file.id, file.version, &chunks, mtime, file.size, &file.content_hash)
        .ok();
    Ok(())
}

async fn download_to_path(ctx: &WorkerContext, task: &Task, dest: &std::path::Path) -> Result<(), TransferError> {
    use tokio::io::AsyncWriteExt;

    let chunk_hashes = ctx.api.get_file_chunks(&task.path).await?;
    let tmp_path = {
        let mut p = dest.as_os_str().to_owned();
        p.push(".tmp");
        PathBuf::from(p)
    };
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    // Written incrementally and always cleaned up on a non-success path so
    // `dest` never observes anything but its previous content or the
    // complete new content (§8 atomicity-of-download property).
    let result = async {
        let mut tmp = tokio::fs::File::create(&tmp_path).await?;
        for hash in &chunk_hashes {
            if task.cancel_requested.load(Ordering::Relaxed) {
                return Err(TransferError::Cancelled);
            }
            let blob = ctx.api.download_chunk(hash).await?;
            let plaintext = decrypt_chunk(&ctx.key, &blob).map_err(|_| TransferError::Crypto)?;
            ctx.stats.record_download_bytes(plaintext.len() as u64);
            tmp.write_all(&plaintext).await?;
        }
        tmp.flush().await?;
        Ok(())
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    tokio::fs::rename(&tmp_path, dest).await?;
    Ok(())
}

/// Deleter: a local deletion propagates to the server unconditionally
/// (404 counts as success); a remote deletion only removes the local
/// file if it still matches the state we last synced — otherwise the
/// user edited it after the server-side delete, which is a conflict.
async fn delete(ctx: &WorkerContext, task: &Task) -> Result<(), TransferError> {
    check_cancelled(task)?;

    if task.origin == EventKind::RemoteDeleted {
        let full_path = ctx.sync_root.join(&task.path);
        let local = ctx.db.get(&task.path).ok().flatten();
        let unmodified = match &local {
            Some(state) if full_path.exists() => mtime_secs(&full_path).await == state.local_mtime.unwrap_or(-1),
            _ => true,
        };

        if !unmodified {
            // The server no longer has a copy to download, so there's
            // nothing to reconcile against except keeping the local edit:
            // drop our stale state and let the next local scan re-upload
            // it as a new file.
            ctx.db.delete(&task.path).ok();
            tracing::warn!(path = %task.path, "remote delete conflicted with local edit, keeping local copy");
            return Ok(());
        }

        let _ = tokio::fs::remove_file(&full_path).await;
        ctx.db.delete(&task.path).ok();
        return Ok(());
    }

    match ctx.api.delete_file(&task.path).await {
        Ok(()) => {
            ctx.db.delete(&task.path).ok();
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn mtime_secs(path: &std::path::Path) -> i64 {
    tokio::fs::metadata(path)
        .await
        .ok()
        .and_then(|m| m.modified().ok())
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_copy_path_preserves_extension_and_embeds_machine() {
        let path = conflict_copy_path("docs/notes.txt", "laptop");
        assert!(path.starts_with("docs/notes.conflict-"), "{path}");
        assert!(path.ends_with("-laptop.txt"), "{path}");
    }

    #[test]
    fn conflict_copy_path_without_extension() {
        let path = conflict_copy_path("README", "laptop");
        assert!(path.starts_with("README.conflict-"), "{path}");
        assert!(path.ends_with("-laptop"), "{path}");
    }

    #[test]
    fn default_sized_pool_is_at_least_two() {
        let pool = WorkerPool::default_sized();
        assert!(pool.concurrency.available_permits() >= 2);
    }

    #[test]
    fn transfer_stats_tracks_active_counts_and_speed() {
        let stats = TransferStats::new();
        assert_eq!(stats.uploads_active(), 0);
        stats.enter(TransferType::Upload);
        stats.enter(TransferType::Download);
        assert_eq!(stats.uploads_active(), 1);
        assert_eq!(stats.downloads_active(), 1);
        stats.record_upload_bytes(1024);
        assert!(stats.upload_speed() > 0.0);
        assert_eq!(stats.download_speed(), 0.0);
        stats.exit(TransferType::Upload);
        stats.exit(TransferType::Download);
        assert_eq!(stats.uploads_active(), 0);
    }
}
