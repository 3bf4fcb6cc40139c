//! Remote listener (C9): persistent WebSocket subscription to
//! `/ws/client/{token}`, translating pushed `file_change` frames into
//! REMOTE_* `SyncEvent`s and reporting machine status upstream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;

use crate::api::ApiClient;
use crate::db::{FileStatus, LocalDb};
use crate::queue::{EventKind, EventQueue, SyncEvent};
use crate::workers::TransferStats;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const STATUS_INTERVAL: Duration = Duration::from_secs(5);
const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame {
    FileChange { action: String, path: String, #[allow(dead_code)] timestamp: DateTime<Utc> },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame<'a> {
    Status {
        state: &'a str,
        files_pending: u32,
        uploads_in_progress: u32,
        downloads_in_progress: u32,
        upload_speed: f64,
        download_speed: f64,
    },
    Heartbeat {},
}

/// Runs until `stop` is set. Connection loss is swallowed and retried
/// with exponential backoff; it never propagates to the caller.
pub async fn run(
    server_url: String,
    token: String,
    api: Arc<ApiClient>,
    db: LocalDb,
    queue: Arc<EventQueue>,
    online: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    stats: Arc<TransferStats>,
) {
    let ws_url = to_ws_url(&server_url, &token);
    let mut backoff = BACKOFF_MIN;

    while !stop.load(Ordering::Relaxed) {
        match connect_and_run(&ws_url, &api, &db, &queue, &online, &stop, &stats).await {
            Ok(()) => backoff = BACKOFF_MIN,
            Err(e) => {
                tracing::warn!(error = %e, "remote listener disconnected, reconnecting");
                online.store(false, Ordering::Relaxed);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_MAX);
            }
        }
    }
}

fn to_ws_url(server_url: &str, token: &str) -> String {
    let trimmed = server_url.trim_end_matches('/');
    let scheme_stripped = trimmed
        .strip_prefix("https://")
        .map(|rest| format!("wss://{rest}"))
        .or_else(|| trimmed.strip_prefix("http://").map(|rest| format!("ws://{rest}")))
        .unwrap_or_else(|| format!("ws://{trimmed}"));
    format!("{scheme_stripped}/ws/client/{token}")
}

async fn connect_and_run(
    ws_url: &str,
    api: &ApiClient,
    db: &LocalDb,
    queue: &EventQueue,
    online: &AtomicBool,
    stop: &AtomicBool,
    stats: &TransferStats,
) -> anyhow::Result<()> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(ws_url).await?;
    let (mut write, mut read) = ws_stream.split();
    online.store(true, Ordering::Relaxed);

    // Close the gap between the last acknowledged cursor and now before
    // trusting the live stream for anything newer (§4.9).
    if let Err(e) = crate::scanner::scan_remote(api, db, queue).await {
        tracing::warn!(error = %e, "gap-closing scan failed on reconnect");
    }

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // first tick fires immediately
    let mut status_tick = tokio::time::interval(STATUS_INTERVAL);
    status_tick.tick().await;

    loop {
        if stop.load(Ordering::Relaxed) {
            let _ = write.close().await;
            return Ok(());
        }

        tokio::select! {
            _ = heartbeat.tick() => {
                let frame = serde_json::to_string(&ClientFrame::Heartbeat {})?;
                write.send(Message::Text(frame)).await?;
            }
            _ = status_tick.tick() => {
                let state = if queue.is_empty() && stats.uploads_active() == 0 && stats.downloads_active() == 0 {
                    "IDLE"
                } else {
                    "SYNCING"
                };
                let frame = serde_json::to_string(&ClientFrame::Status {
                    state,
                    files_pending: queue.len() as u32,
                    uploads_in_progress: stats.uploads_active(),
                    downloads_in_progress: stats.downloads_active(),
                    upload_speed: stats.upload_speed(),
                    download_speed: stats.download_speed(),
                })?;
                write.send(Message::Text(frame)).await?;
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(ServerFrame::FileChange { action, path, .. }) = serde_json::from_str(&text) {
                            handle_file_change(db, queue, &action, &path)?;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        anyhow::bail!("server closed websocket");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                }
            }
        }
    }
}

fn handle_file_change(db: &LocalDb, queue: &EventQueue, action: &str, path: &str) -> anyhow::Result<()> {
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
    queue.put(SyncEvent { path: path.to_string(), kind, server_version: None });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_http_scheme_to_ws() {
        assert_eq!(to_ws_url("http://localhost:8080", "tok"), "ws://localhost:8080/ws/client/tok");
        assert_eq!(to_ws_url("https://sync.example.com/", "tok"), "wss://sync.example.com/ws/client/tok");
    }
}
