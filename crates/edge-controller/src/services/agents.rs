use tracing::{debug, info, warn};
use uuid::Uuid;

use common::api::{
    AgentCheckRequest, AgentJoinRequest, AgentJoinResponse, AgentOpRequest, AgentOpResponse,
    AgentStartInfo, CheckResult, InventoryAgentJoinRequest,
};

use crate::error::{ApiResult, AppError};
use crate::notifier::Notifier;
use crate::persistence::{self as db, assets, operations};
use crate::plugins::PluginRegistry;
use crate::proxy::CentralProxyClient;

pub const UNINSTALL_OPERATION: &str = "uninstall";
pub const CORE_PLUGIN: &str = "core";

/// Handles the agent-facing session protocol: join, start, periodic check
/// and operation callbacks.
#[derive(Clone)]
pub struct AgentManager {
    db: db::Db,
    notifier: Notifier,
    proxy: CentralProxyClient,
    plugins: PluginRegistry,
    organization_id: String,
    edge_controller_id: String,
}

impl AgentManager {
    pub fn new(
        db: db::Db,
        notifier: Notifier,
        proxy: CentralProxyClient,
        plugins: PluginRegistry,
        organization_id: &str,
        edge_controller_id: &str,
    ) -> Self {
        Self {
            db,
            notifier,
            proxy,
            plugins,
            organization_id: organization_id.to_string(),
            edge_controller_id: edge_controller_id.to_string(),
        }
    }

    /// Admit a new agent: the central platform assigns the asset identity and
    /// token, then the pair is persisted locally.
    pub async fn agent_join(&self, request: AgentJoinRequest) -> ApiResult<AgentJoinResponse> {
        if request.agent_id.is_empty() {
            return Err(AppError::invalid_argument("agent_id cannot be empty"));
        }
        debug!(agent_id = %request.agent_id, "agent requests join");

        let to_send = InventoryAgentJoinRequest {
            organization_id: self.organization_id.clone(),
            edge_controller_id: self.edge_controller_id.clone(),
            agent_id: request.agent_id.clone(),
            labels: request.labels,
            os: request.os,
            hardware: request.hardware,
            storage: request.storage,
        };

        let response = self.proxy.agent_join(&to_send).await.map_err(|err| {
            warn!(agent_id = %request.agent_id, %err, "cannot join agent");
            err
        })?;

        assets::add_managed_asset(&self.db, &response.asset_id, &response.token).await?;

        info!(agent_id = %request.agent_id, asset_id = %response.asset_id, "agent joined successfully");
        Ok(response)
    }

    /// Buffer the agent's start notification for the next drain.
    pub async fn agent_start(&self, info: AgentStartInfo) -> ApiResult<()> {
        if info.asset_id.is_empty() {
            return Err(AppError::invalid_argument("asset_id cannot be empty"));
        }
        if info.ip.is_empty() {
            return Err(AppError::invalid_argument("ip cannot be empty"));
        }
        debug!(asset_id = %info.asset_id, "agent started");
        self.notifier.notify_agent_start(&info).await
    }

    /// The hot path: one call per agent per check period.
    ///
    /// A pending uninstall short-circuits everything: the asset is dropped,
    /// the uninstall moves to the completed set, and the only thing the agent
    /// gets back is the synthetic uninstall operation.
    pub async fn agent_check(
        &self,
        request: AgentCheckRequest,
        peer_ip: &str,
    ) -> ApiResult<CheckResult> {
        if request.asset_id.is_empty() {
            return Err(AppError::invalid_argument("asset_id cannot be empty"));
        }
        if request.timestamp == 0 {
            return Err(AppError::invalid_argument("timestamp cannot be empty"));
        }
        info!(asset_id = %request.asset_id, ip = peer_ip, "agent check");

        if let Some(uninstall) = self.notifier.pending_uninstall(&request.asset_id).await {
            if let Err(err) = assets::remove_managed_asset(&self.db, &request.asset_id).await {
                warn!(asset_id = %request.asset_id, %err, "error removing agent");
            }
            self.notifier.remove_pending_uninstall(&request.asset_id).await;

            return Ok(CheckResult {
                pending_requests: vec![AgentOpRequest {
                    organization_id: uninstall.organization_id,
                    edge_controller_id: uninstall.edge_controller_id,
                    asset_id: request.asset_id,
                    operation_id: Uuid::new_v4().to_string(),
                    operation: UNINSTALL_OPERATION.to_string(),
                    plugin: CORE_PLUGIN.to_string(),
                    params: Default::default(),
                }],
            });
        }

        self.notifier.agent_alive(&request.asset_id, peer_ip).await;

        // Stop on the first plugin error; the agent resends everything on a
        // failed check.
        for data in &request.plugin_data {
            self.plugins.handle_agent_data(&request.asset_id, data).await?;
        }

        let pending = match operations::get_pending_operations(&self.db, &request.asset_id, true)
            .await
        {
            Ok(pending) => pending,
            Err(err) => {
                // The agent cannot act on a storage error; give it an empty
                // result and let the next check retry.
                warn!(asset_id = %request.asset_id, %err, "cannot retrieve pending operations");
                return Ok(CheckResult::default());
            }
        };

        info!(
            asset_id = %request.asset_id,
            pending = pending.len(),
            "sending pending operations to the agent"
        );
        Ok(CheckResult {
            pending_requests: pending.into_iter().map(|op| op.into_request()).collect(),
        })
    }

    /// Buffer an operation status reported by the agent.
    pub async fn callback_agent_operation(&self, response: AgentOpResponse) -> ApiResult<()> {
        if response.asset_id.is_empty() {
            return Err(AppError::invalid_argument("asset_id cannot be empty"));
        }
        if response.operation_id.is_empty() {
            return Err(AppError::invalid_argument("operation_id cannot be empty"));
        }
        debug!(
            asset_id = %response.asset_id,
            status = response.status.as_str(),
            "agent callback"
        );
        self.notifier.notify_callback(&response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::store;
    use common::api::OpStatus;
    use httpmock::Method::POST;
    use httpmock::MockServer;

    async fn manager_with(server: &MockServer) -> (AgentManager, db::Db, Notifier) {
        let db = store::open_in_memory().await.expect("open store");
        let proxy = CentralProxyClient::new(&server.url(""), None).expect("client");
        let notifier = Notifier::new(db.clone(), proxy.clone(), "org", "ec");
        let manager = AgentManager::new(
            db.clone(),
            notifier.clone(),
            proxy,
            PluginRegistry::new(),
            "org",
            "ec",
        );
        (manager, db, notifier)
    }

    fn mock_join<'a>(server: &'a MockServer, asset_id: &str, token: &str) -> httpmock::Mock<'a> {
        let body = serde_json::json!({
            "organization_id": "org",
            "edge_controller_id": "ec",
            "asset_id": asset_id,
            "token": token,
        });
        server.mock(move |when, then| {
            when.method(POST).path("/api/v1/inventory/agents/join");
            then.status(200).json_body(body.clone());
        })
    }

    fn check_request(asset_id: &str) -> AgentCheckRequest {
        AgentCheckRequest {
            asset_id: asset_id.into(),
            timestamp: 1,
            plugin_data: Vec::new(),
        }
    }

    #[tokio::test]
    async fn join_persists_asset_and_token() {
        let server = MockServer::start();
        mock_join(&server, "asset-x", "token-t");
        let (manager, db, _) = manager_with(&server).await;

        let response = manager
            .agent_join(AgentJoinRequest {
                agent_id: "agent-1".into(),
                ..Default::default()
            })
            .await
            .expect("join");
        assert_eq!(response.asset_id, "asset-x");

        let record = assets::get_asset_by_token(&db, "token-t").await.expect("stored");
        assert_eq!(record.asset_id, "asset-x");
    }

    #[tokio::test]
    async fn join_requires_agent_id() {
        let server = MockServer::start();
        let (manager, _, _) = manager_with(&server).await;
        let err = manager
            .agent_join(AgentJoinRequest::default())
            .await
            .expect_err("empty id");
        assert_eq!(err.code, "invalid_argument");
    }

    #[tokio::test]
    async fn check_drains_operations_in_order_exactly_once() {
        let server = MockServer::start();
        mock_join(&server, "asset-x", "token-t");
        let (manager, db, _) = manager_with(&server).await;
        manager
            .agent_join(AgentJoinRequest {
                agent_id: "agent-1".into(),
                ..Default::default()
            })
            .await
            .expect("join");

        for id in ["op-1", "op-2"] {
            let record = operations::AgentOpRecord {
                created: 1,
                organization_id: "org".into(),
                edge_controller_id: "ec".into(),
                asset_id: "asset-x".into(),
                operation_id: id.into(),
                operation: "ping".into(),
                plugin: "core".into(),
                params: Default::default(),
            };
            operations::add_pending_operation(&db, &record).await.expect("add");
        }

        let result = manager
            .agent_check(check_request("asset-x"), "10.0.0.1")
            .await
            .expect("check");
        let ids: Vec<&str> = result
            .pending_requests
            .iter()
            .map(|op| op.operation_id.as_str())
            .collect();
        assert_eq!(ids, vec!["op-1", "op-2"]);

        let second = manager
            .agent_check(check_request("asset-x"), "10.0.0.1")
            .await
            .expect("second check");
        assert!(second.pending_requests.is_empty());
    }

    #[tokio::test]
    async fn check_validates_timestamp() {
        let server = MockServer::start();
        let (manager, _, _) = manager_with(&server).await;
        let err = manager
            .agent_check(
                AgentCheckRequest {
                    asset_id: "asset-x".into(),
                    timestamp: 0,
                    plugin_data: Vec::new(),
                },
                "10.0.0.1",
            )
            .await
            .expect_err("missing timestamp");
        assert_eq!(err.code, "invalid_argument");
    }

    #[tokio::test]
    async fn pending_uninstall_turns_check_into_uninstall_order() {
        let server = MockServer::start();
        mock_join(&server, "asset-x", "token-t");
        let (manager, db, notifier) = manager_with(&server).await;
        manager
            .agent_join(AgentJoinRequest {
                agent_id: "agent-1".into(),
                ..Default::default()
            })
            .await
            .expect("join");

        notifier
            .uninstall_agent(
                &common::api::UninstallAgentRequest {
                    organization_id: "org".into(),
                    edge_controller_id: "ec".into(),
                    asset_id: "asset-x".into(),
                    force: false,
                },
                "op-u",
            )
            .await;

        let result = manager
            .agent_check(check_request("asset-x"), "10.0.0.1")
            .await
            .expect("check");
        assert_eq!(result.pending_requests.len(), 1);
        let op = &result.pending_requests[0];
        assert_eq!(op.operation, UNINSTALL_OPERATION);
        assert_eq!(op.plugin, CORE_PLUGIN);
        assert!(!op.operation_id.is_empty());

        // The asset and its token are gone; the uninstall is now completed.
        assert!(!assets::asset_exists(&db, "asset-x").await.expect("exists"));
        assert!(assets::get_asset_by_token(&db, "token-t").await.is_err());
        assert!(notifier.pending_uninstall("asset-x").await.is_none());
    }

    #[tokio::test]
    async fn callback_validates_and_buffers() {
        let server = MockServer::start();
        let (manager, db, _) = manager_with(&server).await;

        let err = manager
            .callback_agent_operation(AgentOpResponse {
                organization_id: "org".into(),
                edge_controller_id: "ec".into(),
                asset_id: String::new(),
                operation_id: "op-1".into(),
                timestamp: 1,
                status: OpStatus::Success,
                info: String::new(),
            })
            .await
            .expect_err("empty asset");
        assert_eq!(err.code, "invalid_argument");

        manager
            .callback_agent_operation(AgentOpResponse {
                organization_id: "org".into(),
                edge_controller_id: "ec".into(),
                asset_id: "asset-x".into(),
                operation_id: "op-1".into(),
                timestamp: 1,
                status: OpStatus::Success,
                info: String::new(),
            })
            .await
            .expect("buffer");

        let pending = crate::persistence::responses::get_pending_op_responses(&db, false)
            .await
            .expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation_id, "op-1");
    }
}
