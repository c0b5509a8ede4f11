use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use super::Db;
use crate::error::{ApiResult, AppError};

/// How long a connection waits on the file lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(3);

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Open the durable store at `path`, creating file and schema when missing.
///
/// The pool holds exactly one connection: SQLite admits a single writer per
/// file and serializing through the pool keeps the reopen/retry behavior in
/// one place instead of sprinkling busy-retry loops over every caller.
pub async fn open(path: &Path) -> ApiResult<Db> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .busy_timeout(BUSY_TIMEOUT);
    connect(options).await
}

/// Open a process-private in-memory store with the identical contract.
pub async fn open_in_memory() -> ApiResult<Db> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(|err| AppError::internal(format!("invalid in-memory options: {err}")))?
        .busy_timeout(BUSY_TIMEOUT);
    connect(options).await
}

async fn connect(options: SqliteConnectOptions) -> ApiResult<Db> {
    // One connection, kept for the lifetime of the pool: SQLite is
    // single-writer, and an in-memory database lives and dies with its
    // connection.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .map_err(|err| AppError::unavailable(format!("cannot open store: {err}")))?;

    MIGRATOR
        .run(&pool)
        .await
        .map_err(|err| AppError::internal(format!("cannot run store migrations: {err}")))?;

    Ok(pool)
}

/// Truncate every bucket. Used by unlink and by tests.
pub async fn clear_all(db: &Db) -> ApiResult<()> {
    let mut tx = db.begin().await?;
    for table in [
        "managed_assets",
        "pending_operations",
        "pending_agent_responses",
        "pending_ec_responses",
        "join_tokens",
        "agent_start_events",
    ] {
        sqlx::query(&format!("DELETE FROM {table}"))
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn open_creates_file_and_schema() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("edge.db");
        let db = open(&path).await.expect("open");

        let count: (i64,) = sqlx::query_as("SELECT COUNT(1) FROM managed_assets")
            .fetch_one(&db)
            .await
            .expect("query");
        assert_eq!(count.0, 0);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn reopen_preserves_data() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("edge.db");

        {
            let db = open(&path).await.expect("open");
            crate::persistence::assets::add_managed_asset(&db, "asset-1", "token-1")
                .await
                .expect("add");
            db.close().await;
        }

        let db = open(&path).await.expect("reopen");
        let record = crate::persistence::assets::get_asset_by_token(&db, "token-1")
            .await
            .expect("present");
        assert_eq!(record.asset_id, "asset-1");
    }

    #[tokio::test]
    async fn clear_all_truncates_every_bucket() {
        let db = open_in_memory().await.expect("open");
        crate::persistence::assets::add_managed_asset(&db, "asset-1", "token-1")
            .await
            .expect("add asset");
        crate::persistence::tokens::add_join_token(&db, "join-1")
            .await
            .expect("add token");

        clear_all(&db).await.expect("clear");

        let err = crate::persistence::assets::get_asset_by_token(&db, "token-1")
            .await
            .expect_err("gone");
        assert_eq!(err.code, "failed_precondition");
        let valid = crate::persistence::tokens::check_join_token(&db, "join-1")
            .await
            .expect("check");
        assert!(!valid);
    }
}
