pub mod changes;
pub mod files;
pub mod machines;
pub mod models;
pub mod tokens;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

pub type DbPool = SqlitePool;

pub use models::{ChangeAction, ChangeLogEntry, FileRecord, Invitation, Machine, Token};

/// Create a database connection pool, enabling WAL mode for concurrent readers.
///
/// `create_if_missing` only creates the database file itself, not its parent
/// directory, so a fresh install pointed at e.g. `sqlite://./data/syncagent.db`
/// would otherwise fail before `./data` exists.
pub async fn create_pool(database_url: &str) -> anyhow::Result<DbPool> {
    if let Some(path) = database_url.strip_prefix("sqlite://").or_else(|| database_url.strip_prefix("sqlite:")) {
        let path = path.split('?').next().unwrap_or(path);
        if path != ":memory:" {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }
    }

    let opts = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect_with(opts)
        .await?;
    Ok(pool)
}

/// Run database migrations using SQLx's built-in migration tracking.
/// Migrations are tracked in the `_sqlx_migrations` table and only run once.
pub async fn run_migrations(pool: &DbPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Server statistics surfaced on the dashboard and `status` CLI subcommand.
pub struct Stats {
    pub total_machines: i64,
    pub total_files: i64,
    pub total_change_log_entries: i64,
    pub total_bytes: i64,
}

/// Get server statistics.
pub async fn get_stats(pool: &DbPool) -> anyhow::Result<Stats> {
    let total_machines: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM machines")
        .fetch_one(pool)
        .await?;

    let total_files: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM files WHERE deleted_at IS NULL")
            .fetch_one(pool)
            .await?;

    let total_change_log_entries: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM change_log")
        .fetch_one(pool)
        .await?;

    let total_bytes: (Option<i64>,) = sqlx::query_as(
        "SELECT CAST(COALESCE(SUM(size), 0) AS BIGINT) FROM files WHERE deleted_at IS NULL",
    )
    .fetch_one(pool)
    .await?;

    Ok(Stats {
        total_machines: total_machines.0,
        total_files: total_files.0,
        total_change_log_entries: total_change_log_entries.0,
        total_bytes: total_bytes.0.unwrap_or(0),
    })
}
