//! Coordinator (C11): single-consumer loop over the event queue,
//! maintaining one `TransferState` per path and deciding whether an
//! incoming event starts a new transfer, cancels one in flight, or is
//! dropped as redundant.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::queue::{EventKind, EventQueue, SyncEvent};
use crate::workers::{Task, TransferType, WorkerPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictType {
    ConcurrentEvent,
}

pub struct TransferState {
    pub event: EventKind,
    pub transfer_type: TransferType,
    pub status: TransferStatus,
    pub cancel_requested: Arc<AtomicBool>,
    pub base_version: Option<i64>,
    pub detected_server_version: Option<i64>,
    pub conflict_type: Option<ConflictType>,
}

/// Shared with workers so they can flip status/record conflicts without
/// routing back through the queue.
pub type TransferMap = Arc<Mutex<HashMap<String, TransferState>>>;

pub struct Coordinator {
    queue: Arc<EventQueue>,
    pool: Arc<WorkerPool>,
    transfers: TransferMap,
}

impl Coordinator {
    pub fn new(queue: Arc<EventQueue>, pool: Arc<WorkerPool>) -> Self {
        Coordinator { queue, pool, transfers: Arc::new(Mutex::new(HashMap::new())) }
    }

    pub fn transfers(&self) -> TransferMap {
        self.transfers.clone()
    }

    /// Drains the queue until `stop` is set, blocking briefly between
    /// polls so the loop can observe shutdown promptly.
    pub fn run(&self, stop: &AtomicBool) {
        while !stop.load(Ordering::Relaxed) {
            match self.queue.get(Duration::from_millis(500)) {
                Some(event) => self.handle_event(event),
                None => continue,
            }
        }
    }

    /// One-shot mode (`tangle sync` without `--watch`): drain whatever is
    /// queued now plus whatever the in-flight workers still enqueue, then
    /// return once both the queue and the active worker count go idle.
    pub fn run_until_drained(&self) {
        loop {
            match self.queue.get(Duration::from_millis(300)) {
                Some(event) => self.handle_event(event),
                None => {
                    if self.queue.is_empty() && self.pool.active_count() == 0 {
                        return;
                    }
                }
            }
        }
    }

    fn handle_event(&self, event: SyncEvent) {
        let mut transfers = self.transfers.lock().unwrap();

        if let Some(existing) = transfers.get(&event.path) {
            if existing.status == TransferStatus::InProgress || existing.status == TransferStatus::Queued {
                match (event.kind.is_local(), existing.transfer_type) {
                    (true, TransferType::Upload) => {
                        if event.kind == EventKind::LocalDeleted {
                            existing.cancel_requested.store(true, Ordering::Relaxed);
                            drop(transfers);
                            self.queue.put(event);
                        }
                        return;
                    }
                    (true, TransferType::Download) => {
                        existing.cancel_requested.store(true, Ordering::Relaxed);
                        drop(transfers);
                        self.queue.put(event);
                        return;
                    }
                    (false, TransferType::Upload) if event.kind.is_remote() => {
                        let cancel = existing.cancel_requested.clone();
                        if let Some(state) = transfers.get_mut(&event.path) {
                            state.conflict_type = Some(ConflictType::ConcurrentEvent);
                            state.detected_server_version = event.server_version;
                        }
                        cancel.store(true, Ordering::Relaxed);
                        return;
                    }
                    (false, TransferType::Download) if event.kind.is_remote() => {
                        return;
                    }
                    (true, TransferType::Delete) | (false, TransferType::Delete) => {
                        return;
                    }
                    _ => {}
                }
            }
        }

        let transfer_type = match event.kind {
            EventKind::LocalCreated | EventKind::LocalModified => TransferType::Upload,
            EventKind::LocalDeleted | EventKind::RemoteDeleted => TransferType::Delete,
            EventKind::RemoteCreated | EventKind::RemoteModified => TransferType::Download,
            EventKind::TransferComplete => {
                transfers.remove(&event.path);
                return;
            }
            EventKind::TransferFailed => {
                if let Some(state) = transfers.get_mut(&event.path) {
                    state.status = TransferStatus::Failed;
                }
                return;
            }
        };

        let cancel_requested = Arc::new(AtomicBool::new(false));
        transfers.insert(
            event.path.clone(),
            TransferState {
                event: event.kind,
                transfer_type,
                status: TransferStatus::Queued,
                cancel_requested: cancel_requested.clone(),
                base_version: None,
                detected_server_version: event.server_version,
                conflict_type: None,
            },
        );
        drop(transfers);

        self.pool.submit(Task { path: event.path, transfer_type, origin: event.kind, cancel_requested });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::WorkerPool;

    fn test_coordinator() -> Coordinator {
        let queue = Arc::new(EventQueue::new());
        let pool = Arc::new(WorkerPool::new_noop());
        Coordinator::new(queue, pool)
    }

    #[test]
    fn local_created_with_no_existing_transfer_starts_upload() {
        let c = test_coordinator();
        c.handle_event(SyncEvent { path: "a.txt".into(), kind: EventKind::LocalCreated, server_version: None });
        let transfers = c.transfers.lock().unwrap();
        assert_eq!(transfers.get("a.txt").unwrap().transfer_type, TransferType::Upload);
    }

    #[test]
    fn remote_event_against_inflight_upload_marks_conflict() {
        let c = test_coordinator();
        c.handle_event(SyncEvent { path: "a.txt".into(), kind: EventKind::LocalModified, server_version: None });
        c.handle_event(SyncEvent { path: "a.txt".into(), kind: EventKind::RemoteModified, server_version: Some(7) });
        let transfers = c.transfers.lock().unwrap();
        let state = transfers.get("a.txt").unwrap();
        assert_eq!(state.conflict_type, Some(ConflictType::ConcurrentEvent));
        assert!(state.cancel_requested.load(Ordering::Relaxed));
    }

    #[test]
    fn local_deleted_against_inflight_download_cancels_and_requeues() {
        let c = test_coordinator();
        c.handle_event(SyncEvent { path: "a.txt".into(), kind: EventKind::RemoteCreated, server_version: Some(1) });
        c.handle_event(SyncEvent { path: "a.txt".into(), kind: EventKind::LocalDeleted, server_version: None });
        // The download's cancel flag was flipped and the delete re-enqueued for the next drain.
        assert_eq!(c.queue.len(), 1);
    }
}
