//! Database models for the metadata store.
//!
//! These map directly onto the tables in `migrations/0001_init.sql`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered client machine.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Machine {
    pub id: i64,
    pub name: String,
    pub platform: String,
    pub is_server_machine: bool,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Bearer credential owned by a machine. `token_hash` is all that is ever persisted.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Token {
    pub id: i64,
    pub machine_id: i64,
    pub token_hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
}

/// A single-use invitation that grants the right to register one new machine.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Invitation {
    pub id: i64,
    pub token_hash: String,
    pub created_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub consumed_by_machine_id: Option<i64>,
}

/// One logical file path.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct FileRecord {
    pub id: i64,
    pub path: String,
    pub size: i64,
    pub content_hash: String,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub updated_by: i64,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl FileRecord {
    pub fn is_trashed(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Action recorded in the append-only change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeAction {
    Created,
    Updated,
    Deleted,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Created => "CREATED",
            ChangeAction::Updated => "UPDATED",
            ChangeAction::Deleted => "DELETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(ChangeAction::Created),
            "UPDATED" => Some(ChangeAction::Updated),
            "DELETED" => Some(ChangeAction::Deleted),
            _ => None,
        }
    }
}

/// One append-only change-log row.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeLogEntry {
    pub id: i64,
    pub file_path: String,
    pub action: ChangeAction,
    pub version: i64,
    pub machine_id: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
pub(crate) struct ChangeLogRow {
    pub id: i64,
    pub file_path: String,
    pub action: String,
    pub version: i64,
    pub machine_id: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

impl From<ChangeLogRow> for ChangeLogEntry {
    fn from(row: ChangeLogRow) -> Self {
        ChangeLogEntry {
            id: row.id,
            file_path: row.file_path,
            action: ChangeAction::parse(&row.action).unwrap_or(ChangeAction::Updated),
            version: row.version,
            machine_id: row.machine_id,
            timestamp: row.timestamp,
        }
    }
}
