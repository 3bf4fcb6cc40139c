use super::models::ChangeLogRow;
use super::{ChangeLogEntry, DbPool};
use chrono::{DateTime, Utc};

/// Fetch up to `limit` change log entries strictly after `since`, ordered by
/// `(timestamp, id)` — the total order §5 guarantees clients observe. `since`
/// of `None` starts from the beginning of the log (used by a client with no
/// stored cursor yet, though §4.7 prefers the full-listing fallback in that case).
pub async fn changes_since(
    pool: &DbPool,
    since: Option<DateTime<Utc>>,
    limit: i64,
) -> Result<Vec<ChangeLogEntry>, sqlx::Error> {
    let since = since.unwrap_or_else(|| DateTime::from_timestamp(0, 0).unwrap());
    let rows = sqlx::query_as::<_, ChangeLogRow>(
        r#"
        SELECT id, file_path, action, version, machine_id, timestamp
        FROM change_log
        WHERE timestamp > ?
        ORDER BY timestamp ASC, id ASC
        LIMIT ?
        "#,
    )
    .bind(since)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(ChangeLogEntry::from).collect())
}

/// The timestamp of the most recent change log entry, if any. A freshly
/// registered machine starts its cursor here so it only ever replays
/// changes made after it joined.
pub async fn latest_change_timestamp(pool: &DbPool) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    let row: (Option<DateTime<Utc>>,) = sqlx::query_as("SELECT MAX(timestamp) FROM change_log")
        .fetch_one(pool)
        .await?;
    Ok(row.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::files::create_file;
    use crate::db::machines::create_machine;

    async fn pool() -> DbPool {
        let pool = crate::db::create_pool("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn cursor_only_returns_newer_entries() {
        let pool = pool().await;
        let m = create_machine(&pool, "laptop", "linux", false).await.unwrap();
        create_file(&pool, "a.txt", 1, "h1", m.id).await.unwrap();
        let cursor = latest_change_timestamp(&pool).await.unwrap();
        create_file(&pool, "b.txt", 2, "h2", m.id).await.unwrap();

        let changes = changes_since(&pool, cursor, 100).await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].file_path, "b.txt");
    }

    #[tokio::test]
    async fn empty_log_has_no_cursor() {
        let pool = pool().await;
        assert_eq!(latest_change_timestamp(&pool).await.unwrap(), None);
    }

    #[tokio::test]
    async fn none_cursor_returns_everything() {
        let pool = pool().await;
        let m = create_machine(&pool, "laptop", "linux", false).await.unwrap();
        create_file(&pool, "a.txt", 1, "h1", m.id).await.unwrap();
        create_file(&pool, "b.txt", 2, "h2", m.id).await.unwrap();

        let changes = changes_since(&pool, None, 100).await.unwrap();
        assert_eq!(changes.len(), 2);
    }
}
