pub mod rest;
pub mod ws;

use crate::config::Config;
use crate::db::DbPool;
use crate::storage::BlobStore;
use std::sync::Arc;

pub use ws::SyncHub;

/// Shared application state handed to every Axum handler. Cloning is cheap:
/// `DbPool` is itself a connection pool handle, and the rest are `Arc`s.
#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub blob_store: Arc<BlobStore>,
    pub config: Config,
    pub hub: SyncHub,
}

impl AppState {
    pub fn new(db: DbPool, blob_store: BlobStore, config: Config, hub: SyncHub) -> Self {
        Self {
            db,
            blob_store: Arc::new(blob_store),
            config,
            hub,
        }
    }
}
