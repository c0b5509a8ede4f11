use chrono::Utc;

use super::Db;
use crate::error::ApiResult;
use crate::tokens::hash_token;

/// TTL for agent join tokens.
pub const AGENT_JOIN_TOKEN_TTL_SECS: i64 = 3600;

/// A stored join token. The bearer value itself only exists on the wire.
#[derive(Debug, Clone)]
pub struct JoinTokenRecord {
    pub expires_at: i64,
}

/// Store a join token with the standard TTL. Re-adding an existing token
/// refreshes its expiry.
pub async fn add_join_token(db: &Db, token: &str) -> ApiResult<JoinTokenRecord> {
    let expires_at = Utc::now().timestamp() + AGENT_JOIN_TOKEN_TTL_SECS;
    sqlx::query(
        "INSERT INTO join_tokens (token_hash, expires_at) VALUES (?1, ?2)
         ON CONFLICT(token_hash) DO UPDATE SET expires_at = excluded.expires_at",
    )
    .bind(hash_token(token))
    .bind(expires_at)
    .execute(db)
    .await?;
    Ok(JoinTokenRecord { expires_at })
}

/// Check whether a join token is currently valid.
///
/// Expired tokens are deleted in the same transaction (lazy expiry); the
/// token stays reusable until then, so one token can admit several agents
/// during its TTL.
pub async fn check_join_token(db: &Db, token: &str) -> ApiResult<bool> {
    let key = hash_token(token);
    let mut tx = db.begin().await?;

    let row: Option<(i64,)> = sqlx::query_as("SELECT expires_at FROM join_tokens WHERE token_hash = ?1")
        .bind(&key)
        .fetch_optional(&mut *tx)
        .await?;

    let valid = match row {
        None => false,
        Some((expires_at,)) if expires_at >= Utc::now().timestamp() => true,
        Some(_) => {
            sqlx::query("DELETE FROM join_tokens WHERE token_hash = ?1")
                .bind(&key)
                .execute(&mut *tx)
                .await?;
            false
        }
    };

    tx.commit().await?;
    Ok(valid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::store;

    async fn setup_db() -> Db {
        store::open_in_memory().await.expect("open store")
    }

    async fn force_expiry(db: &Db, token: &str, expires_at: i64) {
        sqlx::query("UPDATE join_tokens SET expires_at = ?1 WHERE token_hash = ?2")
            .bind(expires_at)
            .bind(hash_token(token))
            .execute(db)
            .await
            .expect("update expiry");
    }

    #[tokio::test]
    async fn fresh_token_is_valid_and_reusable() {
        let db = setup_db().await;
        let record = add_join_token(&db, "join-1").await.expect("add");
        assert!(record.expires_at > Utc::now().timestamp());

        // A join does not consume the token; it stays valid until TTL.
        assert!(check_join_token(&db, "join-1").await.expect("first"));
        assert!(check_join_token(&db, "join-1").await.expect("second"));
    }

    #[tokio::test]
    async fn unknown_token_is_invalid() {
        let db = setup_db().await;
        assert!(!check_join_token(&db, "ghost").await.expect("check"));
    }

    #[tokio::test]
    async fn expired_token_is_consumed_lazily() {
        let db = setup_db().await;
        add_join_token(&db, "join-1").await.expect("add");
        force_expiry(&db, "join-1", Utc::now().timestamp() - 10).await;

        assert!(!check_join_token(&db, "join-1").await.expect("expired"));

        // The expired entry was deleted, so re-adding mints a fresh TTL.
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT expires_at FROM join_tokens WHERE token_hash = ?1")
                .bind(hash_token("join-1"))
                .fetch_optional(&db)
                .await
                .expect("query");
        assert!(row.is_none());
        assert!(!check_join_token(&db, "join-1").await.expect("still gone"));
    }
}
