use chrono::Utc;
use sqlx::FromRow;

use super::Db;
use crate::error::{ApiResult, AppError};
use crate::tokens::hash_token;

/// An asset managed by this edge controller.
#[derive(Debug, Clone, FromRow)]
pub struct ManagedAssetRecord {
    pub asset_id: String,
    pub created_at: i64,
}

/// Register an asset together with its agent-token index entry.
///
/// Both indices live in one row, so the asset-id/token pair commits (or
/// fails) as one atomic unit.
pub async fn add_managed_asset(db: &Db, asset_id: &str, token: &str) -> ApiResult<()> {
    let mut tx = db.begin().await?;

    let existing: Option<(i64,)> =
        sqlx::query_as("SELECT 1 FROM managed_assets WHERE asset_id = ?1")
            .bind(asset_id)
            .fetch_optional(&mut *tx)
            .await?;
    if existing.is_some() {
        return Err(AppError::already_exists(format!(
            "asset {asset_id} already managed by this controller"
        )));
    }

    sqlx::query("INSERT INTO managed_assets (asset_id, token_hash, created_at) VALUES (?1, ?2, ?3)")
        .bind(asset_id)
        .bind(hash_token(token))
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

/// Drop an asset and its token index entry.
pub async fn remove_managed_asset(db: &Db, asset_id: &str) -> ApiResult<()> {
    let result = sqlx::query("DELETE FROM managed_assets WHERE asset_id = ?1")
        .bind(asset_id)
        .execute(db)
        .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::failed_precondition(format!(
            "asset {asset_id} is not managed by this controller"
        )));
    }
    Ok(())
}

/// Resolve an agent token to its asset.
pub async fn get_asset_by_token(db: &Db, token: &str) -> ApiResult<ManagedAssetRecord> {
    let record = sqlx::query_as::<_, ManagedAssetRecord>(
        "SELECT asset_id, created_at FROM managed_assets WHERE token_hash = ?1",
    )
    .bind(hash_token(token))
    .fetch_optional(db)
    .await?;

    record.ok_or_else(|| AppError::failed_precondition("token is not bound to a managed asset"))
}

pub async fn asset_exists(db: &Db, asset_id: &str) -> ApiResult<bool> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM managed_assets WHERE asset_id = ?1")
        .bind(asset_id)
        .fetch_optional(db)
        .await?;
    Ok(row.is_some())
}
