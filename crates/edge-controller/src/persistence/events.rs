use chrono::Utc;
use serde::{Deserialize, Serialize};

use common::api::AgentStartInfo;

use super::Db;
use crate::error::ApiResult;

/// Buffered agent-start event awaiting delivery to the center.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStartRecord {
    /// Epoch seconds the controller buffered the event.
    pub created: i64,
    pub asset_id: String,
    pub ip: String,
}

impl AgentStartRecord {
    pub fn from_info(info: &AgentStartInfo) -> Self {
        Self {
            created: Utc::now().timestamp(),
            asset_id: info.asset_id.clone(),
            ip: info.ip.clone(),
        }
    }

    pub fn into_info(self) -> AgentStartInfo {
        AgentStartInfo {
            asset_id: self.asset_id,
            ip: self.ip,
        }
    }
}

/// Buffer an agent-start event. One slot per asset; the latest start wins.
pub async fn add_agent_start(db: &Db, record: &AgentStartRecord) -> ApiResult<()> {
    let payload = serde_json::to_string(record)?;
    sqlx::query(
        "INSERT INTO agent_start_events (asset_id, payload) VALUES (?1, ?2)
         ON CONFLICT(asset_id) DO UPDATE SET payload = excluded.payload",
    )
    .bind(&record.asset_id)
    .bind(payload)
    .execute(db)
    .await?;
    Ok(())
}

/// Read every buffered start event; `remove` drains them in the same
/// transaction.
pub async fn get_pending_agent_starts(db: &Db, remove: bool) -> ApiResult<Vec<AgentStartRecord>> {
    let mut tx = db.begin().await?;

    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT payload FROM agent_start_events ORDER BY asset_id")
            .fetch_all(&mut *tx)
            .await?;

    let mut result = Vec::with_capacity(rows.len());
    for (payload,) in rows {
        result.push(serde_json::from_str::<AgentStartRecord>(&payload)?);
    }

    if remove {
        sqlx::query("DELETE FROM agent_start_events")
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(result)
}
