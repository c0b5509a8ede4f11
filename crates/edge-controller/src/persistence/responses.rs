use chrono::Utc;
use serde::{Deserialize, Serialize};

use common::api::{AgentOpResponse, EdgeControllerOpResponse, OpStatus};

use super::Db;
use crate::error::ApiResult;

/// Buffered agent operation response awaiting delivery to the center.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOpResponseRecord {
    /// Epoch seconds the controller buffered the response.
    pub created: i64,
    pub organization_id: String,
    pub edge_controller_id: String,
    pub asset_id: String,
    pub operation_id: String,
    pub timestamp: i64,
    pub status: OpStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub info: String,
}

impl AgentOpResponseRecord {
    pub fn from_response(response: &AgentOpResponse) -> Self {
        Self {
            created: Utc::now().timestamp(),
            organization_id: response.organization_id.clone(),
            edge_controller_id: response.edge_controller_id.clone(),
            asset_id: response.asset_id.clone(),
            operation_id: response.operation_id.clone(),
            timestamp: response.timestamp,
            status: response.status,
            info: response.info.clone(),
        }
    }

    pub fn into_response(self) -> AgentOpResponse {
        AgentOpResponse {
            organization_id: self.organization_id,
            edge_controller_id: self.edge_controller_id,
            asset_id: self.asset_id,
            operation_id: self.operation_id,
            timestamp: self.timestamp,
            status: self.status,
            info: self.info,
        }
    }
}

/// Buffered edge-controller operation response (install/uninstall progress).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcOpResponseRecord {
    /// Epoch seconds the controller buffered the response.
    pub created: i64,
    pub organization_id: String,
    pub edge_controller_id: String,
    pub operation_id: String,
    pub timestamp: i64,
    pub status: OpStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub info: String,
}

impl EcOpResponseRecord {
    pub fn from_response(response: &EdgeControllerOpResponse) -> Self {
        Self {
            created: Utc::now().timestamp(),
            organization_id: response.organization_id.clone(),
            edge_controller_id: response.edge_controller_id.clone(),
            operation_id: response.operation_id.clone(),
            timestamp: response.timestamp,
            status: response.status,
            info: response.info.clone(),
        }
    }

    pub fn into_response(self) -> EdgeControllerOpResponse {
        EdgeControllerOpResponse {
            organization_id: self.organization_id,
            edge_controller_id: self.edge_controller_id,
            operation_id: self.operation_id,
            timestamp: self.timestamp,
            status: self.status,
            info: self.info,
        }
    }
}

/// Buffer an agent response, keyed by operation id.
///
/// Overwrites an existing entry: the drain loop re-enqueues on delivery
/// failure and agents retry callbacks, so the operation id is the
/// idempotency key.
pub async fn add_op_response(db: &Db, record: &AgentOpResponseRecord) -> ApiResult<()> {
    let payload = serde_json::to_string(record)?;
    sqlx::query(
        "INSERT INTO pending_agent_responses (operation_id, payload) VALUES (?1, ?2)
         ON CONFLICT(operation_id) DO UPDATE SET payload = excluded.payload",
    )
    .bind(&record.operation_id)
    .bind(payload)
    .execute(db)
    .await?;
    Ok(())
}

/// Read every buffered agent response; `remove` drains them in the same
/// transaction.
pub async fn get_pending_op_responses(
    db: &Db,
    remove: bool,
) -> ApiResult<Vec<AgentOpResponseRecord>> {
    let mut tx = db.begin().await?;

    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT payload FROM pending_agent_responses ORDER BY operation_id")
            .fetch_all(&mut *tx)
            .await?;

    let mut result = Vec::with_capacity(rows.len());
    for (payload,) in rows {
        result.push(serde_json::from_str::<AgentOpResponseRecord>(&payload)?);
    }

    if remove {
        sqlx::query("DELETE FROM pending_agent_responses")
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(result)
}

/// Buffer an edge-controller response, keyed by operation id. Overwrites.
pub async fn add_ec_op_response(db: &Db, record: &EcOpResponseRecord) -> ApiResult<()> {
    let payload = serde_json::to_string(record)?;
    sqlx::query(
        "INSERT INTO pending_ec_responses (operation_id, payload) VALUES (?1, ?2)
         ON CONFLICT(operation_id) DO UPDATE SET payload = excluded.payload",
    )
    .bind(&record.operation_id)
    .bind(payload)
    .execute(db)
    .await?;
    Ok(())
}

/// Read every buffered edge-controller response; `remove` drains them.
pub async fn get_pending_ec_op_responses(
    db: &Db,
    remove: bool,
) -> ApiResult<Vec<EcOpResponseRecord>> {
    let mut tx = db.begin().await?;

    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT payload FROM pending_ec_responses ORDER BY operation_id")
            .fetch_all(&mut *tx)
            .await?;

    let mut result = Vec::with_capacity(rows.len());
    for (payload,) in rows {
        result.push(serde_json::from_str::<EcOpResponseRecord>(&payload)?);
    }

    if remove {
        sqlx::query("DELETE FROM pending_ec_responses")
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::store;

    async fn setup_db() -> Db {
        store::open_in_memory().await.expect("open store")
    }

    fn agent_response(operation_id: &str, status: OpStatus) -> AgentOpResponseRecord {
        AgentOpResponseRecord {
            created: 1,
            organization_id: "org".into(),
            edge_controller_id: "ec".into(),
            asset_id: "asset-x".into(),
            operation_id: operation_id.into(),
            timestamp: 10,
            status,
            info: String::new(),
        }
    }

    fn ec_response(operation_id: &str, status: OpStatus) -> EcOpResponseRecord {
        EcOpResponseRecord {
            created: 1,
            organization_id: "org".into(),
            edge_controller_id: "ec".into(),
            operation_id: operation_id.into(),
            timestamp: 10,
            status,
            info: "step done".into(),
        }
    }

    #[tokio::test]
    async fn agent_responses_drain_and_clear() {
        let db = setup_db().await;
        add_op_response(&db, &agent_response("op-1", OpStatus::Success))
            .await
            .expect("add");
        add_op_response(&db, &agent_response("op-2", OpStatus::Fail))
            .await
            .expect("add");

        let drained = get_pending_op_responses(&db, true).await.expect("drain");
        assert_eq!(drained.len(), 2);

        let empty = get_pending_op_responses(&db, true).await.expect("drain");
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn add_overwrites_same_operation_id() {
        let db = setup_db().await;
        add_op_response(&db, &agent_response("op-1", OpStatus::Inprogress))
            .await
            .expect("first");
        add_op_response(&db, &agent_response("op-1", OpStatus::Success))
            .await
            .expect("retry");

        let drained = get_pending_op_responses(&db, true).await.expect("drain");
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].status, OpStatus::Success);
    }

    #[tokio::test]
    async fn re_enqueued_response_survives_next_drain() {
        let db = setup_db().await;
        add_op_response(&db, &agent_response("op-1", OpStatus::Success))
            .await
            .expect("add");

        let drained = get_pending_op_responses(&db, true).await.expect("drain");
        // Simulate a delivery failure: put the record back.
        add_op_response(&db, &drained[0]).await.expect("re-enqueue");

        let retried = get_pending_op_responses(&db, true).await.expect("retry drain");
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].operation_id, "op-1");
    }

    #[tokio::test]
    async fn ec_responses_have_the_same_contract() {
        let db = setup_db().await;
        add_ec_op_response(&db, &ec_response("op-9", OpStatus::Inprogress))
            .await
            .expect("add");

        let peeked = get_pending_ec_op_responses(&db, false).await.expect("peek");
        assert_eq!(peeked.len(), 1);
        assert_eq!(peeked[0].info, "step done");

        let drained = get_pending_ec_op_responses(&db, true).await.expect("drain");
        assert_eq!(drained.len(), 1);
        let empty = get_pending_ec_op_responses(&db, true).await.expect("empty");
        assert!(empty.is_empty());
    }
}
