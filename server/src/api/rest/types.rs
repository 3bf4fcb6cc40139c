//! Wire-format DTOs for the REST API (§6.1).

use crate::db::{ChangeLogEntry, FileRecord, Machine};
use serde::Serialize;

#[derive(Serialize)]
pub struct FileResponse {
    pub id: i64,
    pub path: String,
    pub size: i64,
    pub content_hash: String,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
}

impl From<FileRecord> for FileResponse {
    fn from(f: FileRecord) -> Self {
        FileResponse {
            id: f.id,
            path: f.path,
            size: f.size,
            content_hash: f.content_hash,
            version: f.version,
            created_at: f.created_at.to_rfc3339(),
            updated_at: f.updated_at.to_rfc3339(),
            deleted_at: f.deleted_at.map(|d| d.to_rfc3339()),
        }
    }
}

#[derive(Serialize)]
pub struct MachineResponse {
    pub id: i64,
    pub name: String,
    pub platform: String,
    pub created_at: String,
    pub last_seen: String,
}

impl From<Machine> for MachineResponse {
    fn from(m: Machine) -> Self {
        MachineResponse {
            id: m.id,
            name: m.name,
            platform: m.platform,
            created_at: m.created_at.to_rfc3339(),
            last_seen: m.last_seen.to_rfc3339(),
        }
    }
}

#[derive(Serialize)]
pub struct ChangeEntryResponse {
    pub id: i64,
    pub file_path: String,
    pub action: String,
    pub version: i64,
    pub machine_id: Option<i64>,
    pub timestamp: String,
}

impl From<ChangeLogEntry> for ChangeEntryResponse {
    fn from(c: ChangeLogEntry) -> Self {
        ChangeEntryResponse {
            id: c.id,
            file_path: c.file_path,
            action: c.action.as_str().to_string(),
            version: c.version,
            machine_id: c.machine_id,
            timestamp: c.timestamp.to_rfc3339(),
        }
    }
}

#[derive(Serialize)]
pub struct ChangesResponse {
    pub changes: Vec<ChangeEntryResponse>,
    pub has_more: bool,
    pub latest_timestamp: String,
}
