use super::models::ChangeAction;
use super::{DbPool, FileRecord};
use chrono::Utc;

/// Errors specific to file metadata mutation, distinct from plain `sqlx::Error`
/// so the REST layer can map conflicts to 409 instead of 500.
#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("version conflict on {path}: expected parent version {expected}, found {actual}")]
    Conflict {
        path: String,
        expected: i64,
        actual: i64,
    },
    #[error("file already exists and is not trashed: {0}")]
    AlreadyExists(String),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

async fn log_change(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    file_path: &str,
    action: ChangeAction,
    version: i64,
    machine_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO change_log (file_path, action, version, machine_id, timestamp)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(file_path)
    .bind(action.as_str())
    .bind(version)
    .bind(machine_id)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Create a brand new file record at version 1. Fails if a live (non-trashed)
/// record already occupies `path`.
pub async fn create_file(
    pool: &DbPool,
    path: &str,
    size: i64,
    content_hash: &str,
    machine_id: i64,
) -> Result<FileRecord, FileError> {
    // Restore-only semantics: a trashed record still occupies its path.
    // The only way back to a live file at that path is an explicit
    // restore (§9 Open Question, resolved).
    if get_file(pool, path).await?.is_some() {
        return Err(FileError::AlreadyExists(path.to_string()));
    }

    let mut tx = pool.begin().await?;
    let now = Utc::now();

    sqlx::query(
        r#"
        INSERT INTO files (path, size, content_hash, version, created_at, updated_at, updated_by, deleted_at)
        VALUES (?, ?, ?, 1, ?, ?, ?, NULL)
        "#,
    )
    .bind(path)
    .bind(size)
    .bind(content_hash)
    .bind(now)
    .bind(now)
    .bind(machine_id)
    .execute(&mut *tx)
    .await?;

    log_change(&mut tx, path, ChangeAction::Created, 1, machine_id).await?;
    tx.commit().await?;

    get_file(pool, path)
        .await?
        .ok_or_else(|| FileError::NotFound(path.to_string()))
}

/// Update an existing file's content, enforcing optimistic concurrency: the
/// caller must supply the version it last observed (`parent_version`).
pub async fn update_file(
    pool: &DbPool,
    path: &str,
    size: i64,
    content_hash: &str,
    parent_version: i64,
    machine_id: i64,
) -> Result<FileRecord, FileError> {
    let current = get_file(pool, path)
        .await?
        .ok_or_else(|| FileError::NotFound(path.to_string()))?;

    if current.version != parent_version {
        return Err(FileError::Conflict {
            path: path.to_string(),
            expected: parent_version,
            actual: current.version,
        });
    }

    let mut tx = pool.begin().await?;
    let now = Utc::now();
    let new_version = current.version + 1;

    let result = sqlx::query(
        r#"
        UPDATE files
        SET size = ?, content_hash = ?, version = ?, updated_at = ?, updated_by = ?, deleted_at = NULL
        WHERE path = ? AND version = ?
        "#,
    )
    .bind(size)
    .bind(content_hash)
    .bind(new_version)
    .bind(now)
    .bind(machine_id)
    .bind(path)
    .bind(parent_version)
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        tx.rollback().await?;
        let now_current = get_file(pool, path)
            .await?
            .ok_or_else(|| FileError::NotFound(path.to_string()))?;
        return Err(FileError::Conflict {
            path: path.to_string(),
            expected: parent_version,
            actual: now_current.version,
        });
    }

    log_change(&mut tx, path, ChangeAction::Updated, new_version, machine_id).await?;
    tx.commit().await?;

    get_file(pool, path)
        .await?
        .ok_or_else(|| FileError::NotFound(path.to_string()))
}

/// Soft-delete a file, moving it to the trash. Deleting an already-deleted
/// path is a no-op success (idempotent, §7 "Not found" policy) rather than
/// an error, since the Deleter protocol treats server-side 404 the same way.
pub async fn delete_file(pool: &DbPool, path: &str, machine_id: i64) -> Result<FileRecord, FileError> {
    let current = get_file(pool, path)
        .await?
        .ok_or_else(|| FileError::NotFound(path.to_string()))?;

    if current.is_trashed() {
        return Ok(current);
    }

    let mut tx = pool.begin().await?;
    let now = Utc::now();
    let new_version = current.version + 1;

    let result = sqlx::query(
        r#"
        UPDATE files
        SET version = ?, updated_at = ?, updated_by = ?, deleted_at = ?
        WHERE path = ? AND version = ?
        "#,
    )
    .bind(new_version)
    .bind(now)
    .bind(machine_id)
    .bind(now)
    .bind(path)
    .bind(current.version)
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        tx.rollback().await?;
        return Err(FileError::Conflict {
            path: path.to_string(),
            expected: current.version,
            actual: current.version,
        });
    }

    log_change(&mut tx, path, ChangeAction::Deleted, new_version, machine_id).await?;
    tx.commit().await?;

    get_file(pool, path)
        .await?
        .ok_or_else(|| FileError::NotFound(path.to_string()))
}

/// Restore a trashed file back to live status. Restoration is always an
/// explicit client action — a file never comes back on its own because a
/// peer happened to recreate the same path.
pub async fn restore_file(pool: &DbPool, path: &str, machine_id: i64) -> Result<FileRecord, FileError> {
    let current = get_file(pool, path)
        .await?
        .ok_or_else(|| FileError::NotFound(path.to_string()))?;

    if !current.is_trashed() {
        return Err(FileError::AlreadyExists(path.to_string()));
    }

    let mut tx = pool.begin().await?;
    let now = Utc::now();
    let new_version = current.version + 1;

    sqlx::query(
        r#"
        UPDATE files
        SET version = ?, updated_at = ?, updated_by = ?, deleted_at = NULL
        WHERE path = ?
        "#,
    )
    .bind(new_version)
    .bind(now)
    .bind(machine_id)
    .bind(path)
    .execute(&mut *tx)
    .await?;

    log_change(&mut tx, path, ChangeAction::Created, new_version, machine_id).await?;
    tx.commit().await?;

    get_file(pool, path)
        .await?
        .ok_or_else(|| FileError::NotFound(path.to_string()))
}

pub async fn get_file(pool: &DbPool, path: &str) -> Result<Option<FileRecord>, sqlx::Error> {
    sqlx::query_as::<_, FileRecord>("SELECT * FROM files WHERE path = ?")
        .bind(path)
        .fetch_optional(pool)
        .await
}

pub async fn list_files(pool: &DbPool, prefix: Option<&str>) -> Result<Vec<FileRecord>, sqlx::Error> {
    match prefix {
        Some(prefix) => {
            let like = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
            sqlx::query_as::<_, FileRecord>(
                "SELECT * FROM files WHERE deleted_at IS NULL AND path LIKE ? ESCAPE '\\' ORDER BY path",
            )
            .bind(like)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, FileRecord>("SELECT * FROM files WHERE deleted_at IS NULL ORDER BY path")
                .fetch_all(pool)
                .await
        }
    }
}

pub async fn list_trash(pool: &DbPool) -> Result<Vec<FileRecord>, sqlx::Error> {
    sqlx::query_as::<_, FileRecord>(
        "SELECT * FROM files WHERE deleted_at IS NOT NULL ORDER BY deleted_at DESC",
    )
    .fetch_all(pool)
    .await
}

/// Remove trash rows whose `deleted_at` predates `older_than`. Returns the
/// number of file records purged.
pub async fn purge_trash(pool: &DbPool, older_than: chrono::DateTime<Utc>) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM files WHERE deleted_at IS NOT NULL AND deleted_at < ?")
        .bind(older_than)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Replace the chunk manifest for a file. Called once the server has
/// verified (or received) every chunk referenced by `chunk_hashes`.
pub async fn set_file_chunks(
    pool: &DbPool,
    file_id: i64,
    chunk_hashes: &[String],
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM file_chunks WHERE file_id = ?")
        .bind(file_id)
        .execute(&mut *tx)
        .await?;

    for (index, hash) in chunk_hashes.iter().enumerate() {
        sqlx::query(
            "INSERT INTO file_chunks (file_id, chunk_index, chunk_hash) VALUES (?, ?, ?)",
        )
        .bind(file_id)
        .bind(index as i64)
        .bind(hash)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

pub async fn get_file_chunks(pool: &DbPool, file_id: i64) -> Result<Vec<String>, sqlx::Error> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT chunk_hash FROM file_chunks WHERE file_id = ? ORDER BY chunk_index",
    )
    .bind(file_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(h,)| h).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::machines::create_machine;

    async fn setup() -> (DbPool, i64) {
        let pool = crate::db::create_pool("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let m = create_machine(&pool, "laptop", "linux", false).await.unwrap();
        (pool, m.id)
    }

    #[tokio::test]
    async fn create_then_update_bumps_version() {
        let (pool, machine) = setup().await;
        create_file(&pool, "a.txt", 10, "hash1", machine).await.unwrap();
        let updated = update_file(&pool, "a.txt", 20, "hash2", 1, machine).await.unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.content_hash, "hash2");
    }

    #[tokio::test]
    async fn update_with_stale_parent_conflicts() {
        let (pool, machine) = setup().await;
        create_file(&pool, "a.txt", 10, "hash1", machine).await.unwrap();
        update_file(&pool, "a.txt", 20, "hash2", 1, machine).await.unwrap();

        let err = update_file(&pool, "a.txt", 30, "hash3", 1, machine).await;
        assert!(matches!(err, Err(FileError::Conflict { expected: 1, actual: 2, .. })));
    }

    #[tokio::test]
    async fn delete_then_restore_round_trips() {
        let (pool, machine) = setup().await;
        create_file(&pool, "a.txt", 10, "hash1", machine).await.unwrap();
        let deleted = delete_file(&pool, "a.txt", machine).await.unwrap();
        assert!(deleted.is_trashed());

        let restored = restore_file(&pool, "a.txt", machine).await.unwrap();
        assert!(!restored.is_trashed());
        assert_eq!(restored.version, 3);
    }

    #[tokio::test]
    async fn create_over_trashed_path_rejected() {
        let (pool, machine) = setup().await;
        create_file(&pool, "a.txt", 10, "hash1", machine).await.unwrap();
        delete_file(&pool, "a.txt", machine).await.unwrap();

        let err = create_file(&pool, "a.txt", 30, "hash3", machine).await;
        assert!(matches!(err, Err(FileError::AlreadyExists(_))));

        let restored = restore_file(&pool, "a.txt", machine).await.unwrap();
        assert!(!restored.is_trashed());
    }

    #[tokio::test]
    async fn create_over_live_path_rejected() {
        let (pool, machine) = setup().await;
        create_file(&pool, "a.txt", 10, "hash1", machine).await.unwrap();
        let err = create_file(&pool, "a.txt", 20, "hash2", machine).await;
        assert!(matches!(err, Err(FileError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn chunk_manifest_round_trips() {
        let (pool, machine) = setup().await;
        let file = create_file(&pool, "a.txt", 10, "hash1", machine).await.unwrap();
        let chunks = vec!["c1".to_string(), "c2".to_string(), "c3".to_string()];
        set_file_chunks(&pool, file.id, &chunks).await.unwrap();

        let fetched = get_file_chunks(&pool, file.id).await.unwrap();
        assert_eq!(fetched, chunks);
    }
}
