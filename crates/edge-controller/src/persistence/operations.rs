use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use common::api::AgentOpRequest;

use super::Db;
use crate::error::{ApiResult, AppError};

/// A queued operation as stored in the per-asset FIFO.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOpRecord {
    /// Epoch seconds the controller accepted the operation.
    pub created: i64,
    pub organization_id: String,
    pub edge_controller_id: String,
    pub asset_id: String,
    pub operation_id: String,
    pub operation: String,
    pub plugin: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub params: HashMap<String, String>,
}

impl AgentOpRecord {
    pub fn from_request(request: &AgentOpRequest) -> Self {
        Self {
            created: Utc::now().timestamp(),
            organization_id: request.organization_id.clone(),
            edge_controller_id: request.edge_controller_id.clone(),
            asset_id: request.asset_id.clone(),
            operation_id: request.operation_id.clone(),
            operation: request.operation.clone(),
            plugin: request.plugin.clone(),
            params: request.params.clone(),
        }
    }

    pub fn into_request(self) -> AgentOpRequest {
        AgentOpRequest {
            organization_id: self.organization_id,
            edge_controller_id: self.edge_controller_id,
            asset_id: self.asset_id,
            operation_id: self.operation_id,
            operation: self.operation,
            plugin: self.plugin,
            params: self.params,
        }
    }
}

/// Append an operation to the asset's pending queue.
///
/// The asset must be managed by this controller; the existence check and the
/// append commit in one transaction.
pub async fn add_pending_operation(db: &Db, record: &AgentOpRecord) -> ApiResult<()> {
    let mut tx = db.begin().await?;

    let managed: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM managed_assets WHERE asset_id = ?1")
        .bind(&record.asset_id)
        .fetch_optional(&mut *tx)
        .await?;
    if managed.is_none() {
        return Err(AppError::failed_precondition(format!(
            "asset {} is not managed by this controller",
            record.asset_id
        )));
    }

    let payload = serde_json::to_string(record)?;
    sqlx::query("INSERT INTO pending_operations (asset_id, payload) VALUES (?1, ?2)")
        .bind(&record.asset_id)
        .bind(payload)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

/// Read the asset's pending queue in enqueue order.
///
/// With `remove` set this is the drain-and-ack path: the returned entries are
/// deleted in the same transaction, so an operation is handed out exactly
/// once while the store is healthy.
pub async fn get_pending_operations(
    db: &Db,
    asset_id: &str,
    remove: bool,
) -> ApiResult<Vec<AgentOpRecord>> {
    let mut tx = db.begin().await?;

    let managed: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM managed_assets WHERE asset_id = ?1")
        .bind(asset_id)
        .fetch_optional(&mut *tx)
        .await?;
    if managed.is_none() {
        return Err(AppError::failed_precondition(format!(
            "asset {asset_id} is not managed by this controller"
        )));
    }

    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT payload FROM pending_operations WHERE asset_id = ?1 ORDER BY seq")
            .bind(asset_id)
            .fetch_all(&mut *tx)
            .await?;

    let mut result = Vec::with_capacity(rows.len());
    for (payload,) in rows {
        result.push(serde_json::from_str::<AgentOpRecord>(&payload)?);
    }

    if remove {
        sqlx::query("DELETE FROM pending_operations WHERE asset_id = ?1")
            .bind(asset_id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(result)
}
