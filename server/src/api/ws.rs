//! Status/notification hub (C5).
//!
//! Two connection kinds share one in-memory hub:
//!
//! - `/ws/client/{token}`: authenticated sync clients. Each connecting
//!   machine replaces any previous socket it held, the hub tracks a live
//!   `MachineStatus` for it, and `file_change` events are pushed to every
//!   *other* connected client whenever a mutation commits.
//! - `/ws/dashboard`: admin dashboard viewers. They get a full status
//!   snapshot on connect, then incremental updates.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use super::AppState;
use crate::auth::hash_token;
use crate::db;

/// Live status of one machine, as last reported over its client socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineStatus {
    pub machine_id: i64,
    pub machine_name: String,
    pub state: String,
    pub files_pending: u32,
    pub uploads_in_progress: u32,
    pub downloads_in_progress: u32,
    pub upload_speed: f64,
    pub download_speed: f64,
    pub last_update: DateTime<Utc>,
}

impl MachineStatus {
    fn offline(machine_id: i64, machine_name: String) -> Self {
        Self {
            machine_id,
            machine_name,
            state: "OFFLINE".to_string(),
            files_pending: 0,
            uploads_in_progress: 0,
            downloads_in_progress: 0,
            upload_speed: 0.0,
            download_speed: 0.0,
            last_update: Utc::now(),
        }
    }
}

/// Server→client push: a file mutation the recipient should reconcile.
#[derive(Debug, Clone)]
pub struct FileChangeMessage {
    pub action: String,
    pub path: String,
    pub timestamp: DateTime<Utc>,
}

/// `file_change` serializes with an explicit `"type":"file_change"` tag,
/// matching §6.2's wire format exactly.
impl Serialize for FileChangeMessage {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("FileChange", 4)?;
        s.serialize_field("type", "file_change")?;
        s.serialize_field("action", &self.action)?;
        s.serialize_field("path", &self.path)?;
        s.serialize_field("timestamp", &self.timestamp)?;
        s.end()
    }
}

/// Client→server status report, sent periodically by the sync daemon.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Status {
        state: String,
        files_pending: u32,
        uploads_in_progress: u32,
        downloads_in_progress: u32,
        upload_speed: f64,
        download_speed: f64,
    },
    Heartbeat {},
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
enum DashboardFrame {
    #[serde(rename = "all_status")]
    AllStatus { machines: Vec<MachineStatus> },
    #[serde(rename = "status_update")]
    StatusUpdate { machine: MachineStatus },
}

type ClientSender = mpsc::UnboundedSender<Message>;

#[derive(Default)]
struct HubInner {
    /// One socket per machine; connecting again replaces the old entry so a
    /// stale duplicate never receives pushes meant for the live session.
    client_sockets: HashMap<i64, ClientSender>,
    statuses: HashMap<i64, MachineStatus>,
    dashboards: Vec<ClientSender>,
}

/// Shared handle to the hub. Cloning is cheap: it's one `Arc<Mutex<..>>`.
#[derive(Clone, Default)]
pub struct SyncHub {
    inner: Arc<Mutex<HubInner>>,
}

impl SyncHub {
    /// Register (or replace) the live socket for `machine_id`.
    async fn register_client(&self, machine_id: i64, machine_name: String, tx: ClientSender) {
        let mut inner = self.inner.lock().await;
        inner.client_sockets.insert(machine_id, tx);
        inner
            .statuses
            .entry(machine_id)
            .or_insert_with(|| MachineStatus::offline(machine_id, machine_name));
    }

    async fn update_status(&self, machine_id: i64, status: MachineStatus) {
        let dashboard_targets = {
            let mut inner = self.inner.lock().await;
            inner.statuses.insert(machine_id, status.clone());
            inner.dashboards.clone()
        };
        let frame = DashboardFrame::StatusUpdate { machine: status };
        broadcast_dashboards(&dashboard_targets, &frame).await;
    }

    /// Drop `machine_id`'s socket and mark it OFFLINE for dashboard viewers.
    /// Per §4.5: "if a client socket's send fails, the hub drops the socket
    /// and marks the machine OFFLINE."
    async fn disconnect_client(&self, machine_id: i64) {
        let (name, dashboard_targets) = {
            let mut inner = self.inner.lock().await;
            inner.client_sockets.remove(&machine_id);
            let name = inner
                .statuses
                .get(&machine_id)
                .map(|s| s.machine_name.clone())
                .unwrap_or_default();
            if let Some(status) = inner.statuses.get_mut(&machine_id) {
                status.state = "OFFLINE".to_string();
                status.last_update = Utc::now();
            }
            (name, inner.dashboards.clone())
        };
        let status = MachineStatus::offline(machine_id, name);
        let frame = DashboardFrame::StatusUpdate { machine: status };
        broadcast_dashboards(&dashboard_targets, &frame).await;
    }

    /// Push a `file_change` to every connected client except `origin_machine_id`.
    /// Must only be called from the same commit path that wrote the change
    /// log entry (§4.5: "driven by the same transaction boundary... on
    /// failure nothing is emitted").
    pub async fn notify_file_change(&self, origin_machine_id: i64, action: &str, path: &str) {
        let msg = FileChangeMessage {
            action: action.to_string(),
            path: path.to_string(),
            timestamp: Utc::now(),
        };
        let Ok(json) = serde_json::to_string(&msg) else {
            return;
        };

        let mut dead = Vec::new();
        {
            let inner = self.inner.lock().await;
            for (&machine_id, tx) in inner.client_sockets.iter() {
                if machine_id == origin_machine_id {
                    continue;
                }
                if tx.send(Message::Text(json.clone())).is_err() {
                    dead.push(machine_id);
                }
            }
        }
        for machine_id in dead {
            self.disconnect_client(machine_id).await;
        }
    }

    async fn register_dashboard(&self, tx: ClientSender) -> Vec<MachineStatus> {
        let mut inner = self.inner.lock().await;
        inner.dashboards.push(tx);
        inner.statuses.values().cloned().collect()
    }

    async fn remove_dashboard(&self, tx: &ClientSender) {
        let mut inner = self.inner.lock().await;
        inner.dashboards.retain(|t| !t.same_channel(tx));
    }
}

async fn broadcast_dashboards(targets: &[ClientSender], frame: &DashboardFrame) {
    if targets.is_empty() {
        return;
    }
    let Ok(json) = serde_json::to_string(frame) else {
        return;
    };
    for tx in targets {
        let _ = tx.send(Message::Text(json.clone()));
    }
}

pub async fn client_ws_handler(
    ws: WebSocketUpgrade,
    Path(token): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let hash = hash_token(&token);
    let machine_id = match db::tokens::validate_token(&state.db, &hash).await {
        Ok(Some(id)) => id,
        _ => {
            return ws.on_upgrade(|mut socket| async move {
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: 4001,
                        reason: "invalid token".into(),
                    })))
                    .await;
            });
        }
    };

    ws.on_upgrade(move |socket| handle_client_socket(socket, state, machine_id))
}

async fn handle_client_socket(socket: WebSocket, state: AppState, machine_id: i64) {
    let machine = db::machines::get_machine(&state.db, machine_id)
        .await
        .ok()
        .flatten();
    let machine_name = machine.map(|m| m.name).unwrap_or_default();

    info!(machine_id, "client websocket connected");
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    state
        .hub
        .register_client(machine_id, machine_name.clone(), tx)
        .await;

    let forward = tokio::spawn(async move {
        use futures_util::SinkExt;
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    use futures_util::StreamExt;
    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => {
                if let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) {
                    match frame {
                        ClientFrame::Status {
                            state: reported_state,
                            files_pending,
                            uploads_in_progress,
                            downloads_in_progress,
                            upload_speed,
                            download_speed,
                        } => {
                            state
                                .hub
                                .update_status(
                                    machine_id,
                                    MachineStatus {
                                        machine_id,
                                        machine_name: machine_name.clone(),
                                        state: reported_state,
                                        files_pending,
                                        uploads_in_progress,
                                        downloads_in_progress,
                                        upload_speed,
                                        download_speed,
                                        last_update: Utc::now(),
                                    },
                                )
                                .await;
                        }
                        ClientFrame::Heartbeat {} => {
                            debug!(machine_id, "heartbeat");
                        }
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    forward.abort();
    state.hub.disconnect_client(machine_id).await;
    info!(machine_id, "client websocket disconnected");
}

pub async fn dashboard_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_dashboard_socket(socket, state))
}

async fn handle_dashboard_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let snapshot = state.hub.register_dashboard(tx.clone()).await;
    let initial = DashboardFrame::AllStatus { machines: snapshot };
    if let Ok(json) = serde_json::to_string(&initial) {
        let _ = tx.send(Message::Text(json));
    }

    let forward = tokio::spawn(async move {
        use futures_util::SinkExt;
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    use futures_util::StreamExt;
    while let Some(Ok(msg)) = stream.next().await {
        if matches!(msg, Message::Close(_)) {
            break;
        }
    }

    forward.abort();
    state.hub.remove_dashboard(&tx).await;
}
