use super::{DbPool, Invitation, Token};
use chrono::{DateTime, Utc};

/// Store the hash of a freshly minted bearer token for `machine_id`.
/// The caller holds the plaintext only long enough to hand it to the client once.
pub async fn create_token(
    pool: &DbPool,
    machine_id: i64,
    token_hash: &str,
    expires_at: Option<DateTime<Utc>>,
) -> anyhow::Result<Token> {
    let now = Utc::now();
    let id = sqlx::query(
        r#"
        INSERT INTO tokens (machine_id, token_hash, created_at, expires_at, revoked)
        VALUES (?, ?, ?, ?, 0)
        "#,
    )
    .bind(machine_id)
    .bind(token_hash)
    .bind(now)
    .bind(expires_at)
    .execute(pool)
    .await?
    .last_insert_rowid();

    let token = sqlx::query_as::<_, Token>("SELECT * FROM tokens WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await?;
    Ok(token)
}

/// Validate a hashed bearer token, returning the owning machine id if it is live.
pub async fn validate_token(pool: &DbPool, token_hash: &str) -> anyhow::Result<Option<i64>> {
    let row = sqlx::query_as::<_, Token>(
        "SELECT * FROM tokens WHERE token_hash = ? AND revoked = 0",
    )
    .bind(token_hash)
    .fetch_optional(pool)
    .await?;

    let Some(token) = row else {
        return Ok(None);
    };

    if let Some(expires_at) = token.expires_at {
        if expires_at <= Utc::now() {
            return Ok(None);
        }
    }

    Ok(Some(token.machine_id))
}

pub async fn revoke_token(pool: &DbPool, id: i64) -> anyhow::Result<()> {
    sqlx::query("UPDATE tokens SET revoked = 1 WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn revoke_all_for_machine(pool: &DbPool, machine_id: i64) -> anyhow::Result<()> {
    sqlx::query("UPDATE tokens SET revoked = 1 WHERE machine_id = ?")
        .bind(machine_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Create a single-use invitation. Its hash is stored the same way a token's is.
pub async fn create_invitation(pool: &DbPool, token_hash: &str) -> anyhow::Result<Invitation> {
    let now = Utc::now();
    let id = sqlx::query(
        "INSERT INTO invitations (token_hash, created_at) VALUES (?, ?)",
    )
    .bind(token_hash)
    .bind(now)
    .execute(pool)
    .await?
    .last_insert_rowid();

    let invitation = sqlx::query_as::<_, Invitation>("SELECT * FROM invitations WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await?;
    Ok(invitation)
}

/// Atomically consume an unconsumed invitation matching `token_hash`, attributing it
/// to `machine_id`. Returns `Ok(None)` if the invitation is missing or already used so
/// the same secret can never register two machines.
pub async fn consume_invitation(
    pool: &DbPool,
    token_hash: &str,
    machine_id: i64,
) -> anyhow::Result<Option<Invitation>> {
    let result = sqlx::query(
        r#"
        UPDATE invitations
        SET consumed_at = ?, consumed_by_machine_id = ?
        WHERE token_hash = ? AND consumed_at IS NULL
        "#,
    )
    .bind(Utc::now())
    .bind(machine_id)
    .bind(token_hash)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }

    let invitation = sqlx::query_as::<_, Invitation>(
        "SELECT * FROM invitations WHERE token_hash = ?",
    )
    .bind(token_hash)
    .fetch_optional(pool)
    .await?;
    Ok(invitation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::machines::create_machine;

    async fn pool() -> DbPool {
        let pool = crate::db::create_pool("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn token_round_trips() {
        let pool = pool().await;
        let m = create_machine(&pool, "laptop", "linux", false).await.unwrap();
        create_token(&pool, m.id, "deadbeef", None).await.unwrap();

        let resolved = validate_token(&pool, "deadbeef").await.unwrap();
        assert_eq!(resolved, Some(m.id));
        assert_eq!(validate_token(&pool, "nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn revoked_token_is_rejected() {
        let pool = pool().await;
        let m = create_machine(&pool, "laptop", "linux", false).await.unwrap();
        let t = create_token(&pool, m.id, "deadbeef", None).await.unwrap();
        revoke_token(&pool, t.id).await.unwrap();
        assert_eq!(validate_token(&pool, "deadbeef").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let pool = pool().await;
        let m = create_machine(&pool, "laptop", "linux", false).await.unwrap();
        let past = Utc::now() - chrono::Duration::seconds(1);
        create_token(&pool, m.id, "deadbeef", Some(past)).await.unwrap();
        assert_eq!(validate_token(&pool, "deadbeef").await.unwrap(), None);
    }

    #[tokio::test]
    async fn invitation_is_single_use() {
        let pool = pool().await;
        create_invitation(&pool, "invite-hash").await.unwrap();
        let m = create_machine(&pool, "laptop", "linux", false).await.unwrap();

        let first = consume_invitation(&pool, "invite-hash", m.id).await.unwrap();
        assert!(first.is_some());

        let second = consume_invitation(&pool, "invite-hash", m.id).await.unwrap();
        assert!(second.is_none());
    }
}
