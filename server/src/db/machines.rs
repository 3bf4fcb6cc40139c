use super::{DbPool, Machine};
use chrono::Utc;

/// Register a new machine. `name` must be unique across the fleet.
pub async fn create_machine(
    pool: &DbPool,
    name: &str,
    platform: &str,
    is_server_machine: bool,
) -> anyhow::Result<Machine> {
    let now = Utc::now();
    let id = sqlx::query(
        r#"
        INSERT INTO machines (name, platform, is_server_machine, created_at, last_seen)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(name)
    .bind(platform)
    .bind(is_server_machine)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?
    .last_insert_rowid();

    get_machine(pool, id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("machine {id} vanished after insert"))
}

pub async fn get_machine(pool: &DbPool, id: i64) -> anyhow::Result<Option<Machine>> {
    let machine = sqlx::query_as::<_, Machine>("SELECT * FROM machines WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(machine)
}

pub async fn get_machine_by_name(pool: &DbPool, name: &str) -> anyhow::Result<Option<Machine>> {
    let machine = sqlx::query_as::<_, Machine>("SELECT * FROM machines WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await?;
    Ok(machine)
}

pub async fn list_machines(pool: &DbPool) -> anyhow::Result<Vec<Machine>> {
    let machines = sqlx::query_as::<_, Machine>("SELECT * FROM machines ORDER BY id")
        .fetch_all(pool)
        .await?;
    Ok(machines)
}

/// Remove a machine row outright. Callers should revoke its tokens first
/// (`tokens::revoke_all_for_machine`) so a stale bearer token never outlives
/// the machine it was minted for.
pub async fn delete_machine(pool: &DbPool, id: i64) -> anyhow::Result<()> {
    sqlx::query("DELETE FROM machines WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn touch_last_seen(pool: &DbPool, id: i64) -> anyhow::Result<()> {
    sqlx::query("UPDATE machines SET last_seen = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// The dashboard materializes a row representing the server process itself lazily,
/// the first time an admin action needs to attribute a change to "the server".
pub async fn get_or_create_server_machine(pool: &DbPool, server_name: &str) -> anyhow::Result<Machine> {
    if let Some(m) = get_machine_by_name(pool, server_name).await? {
        return Ok(m);
    }
    create_machine(pool, server_name, "server", true).await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pool() -> DbPool {
        let pool = crate::db::create_pool("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn create_and_fetch_machine() {
        let pool = pool().await;
        let m = create_machine(&pool, "laptop", "linux", false).await.unwrap();
        assert_eq!(m.name, "laptop");
        assert!(!m.is_server_machine);

        let fetched = get_machine(&pool, m.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, m.id);
    }

    #[tokio::test]
    async fn duplicate_name_rejected() {
        let pool = pool().await;
        create_machine(&pool, "laptop", "linux", false).await.unwrap();
        let err = create_machine(&pool, "laptop", "macos", false).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn server_machine_materializes_once() {
        let pool = pool().await;
        let a = get_or_create_server_machine(&pool, "syncagent").await.unwrap();
        let b = get_or_create_server_machine(&pool, "syncagent").await.unwrap();
        assert_eq!(a.id, b.id);
    }
}
