use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use common::api::{
    AgentJoinToken, AgentOpRequest, AgentOpResponse, AggregationType, AssetMetricValues,
    AssetMetrics, AssetSelector, ConfigureRequest, CreateJoinTokenRequest,
    EdgeControllerOpResponse, InstallAgentRequest, MetricsList, OpStatus, QueryMetricsRequest,
    QueryMetricsResult, TimeRange, UninstallAgentRequest,
};

use crate::credentials;
use crate::error::{ApiResult, AppError};
use crate::metrics::{query, MetricStorageProvider, QueryRange};
use crate::notifier::Notifier;
use crate::persistence::{self as db, operations, responses, store, tokens};
use crate::services::install::AgentInstaller;
use crate::vpn;

const CANCELED_RESPONSE_INFO: &str = "Canceled by the System. Agent Uninstalled";
const INSTALL_RESPONSE_INFO: &str = "Agent Install";
const UNINSTALL_RESPONSE_INFO: &str = "Agent Uninstall";

/// Handles the central-facing control operations.
#[derive(Clone)]
pub struct ControlManager {
    db: db::Db,
    notifier: Notifier,
    metrics: Arc<dyn MetricStorageProvider>,
    installer: AgentInstaller,
    credentials_path: PathBuf,
    vpn_username: Option<String>,
    edge_controller_id: String,
}

impl ControlManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: db::Db,
        notifier: Notifier,
        metrics: Arc<dyn MetricStorageProvider>,
        installer: AgentInstaller,
        credentials_path: PathBuf,
        vpn_username: Option<String>,
        edge_controller_id: &str,
    ) -> Self {
        Self {
            db,
            notifier,
            metrics,
            installer,
            credentials_path,
            vpn_username,
            edge_controller_id: edge_controller_id.to_string(),
        }
    }

    /// Detach this controller from the central platform.
    ///
    /// Responds immediately; the teardown (stop the drain loop, drop the VPN
    /// account, delete credentials, wipe the store) runs fire-and-forget.
    pub fn unlink(&self) -> ApiResult<()> {
        let notifier = self.notifier.clone();
        let db = self.db.clone();
        let credentials_path = self.credentials_path.clone();
        let vpn_username = self.vpn_username.clone();
        let edge_controller_id = self.edge_controller_id.clone();

        tokio::spawn(async move {
            notifier.stop();

            if let Some(username) = vpn_username {
                vpn::teardown_account(&username).await;
            }

            if let Err(err) = credentials::remove_credentials(&credentials_path) {
                warn!(%err, "error deleting credentials");
            }

            if let Err(err) = store::clear_all(&db).await {
                warn!(%err, "error clearing store");
            }

            info!(edge_controller_id, "unlinked");
        });

        Ok(())
    }

    /// Queue an operation for an agent, to be delivered on its next check.
    ///
    /// At most one operation may be pending per asset; a loaded queue fails
    /// the precondition so the center can retry after the agent drains.
    pub async fn trigger_agent_operation(
        &self,
        request: AgentOpRequest,
    ) -> ApiResult<AgentOpResponse> {
        info!(
            asset_id = %request.asset_id,
            operation_id = %request.operation_id,
            operation = %request.operation,
            "triggering agent operation"
        );

        let pending = operations::get_pending_operations(&self.db, &request.asset_id, false).await?;
        if !pending.is_empty() {
            return Err(AppError::failed_precondition(
                "unable to queue this operation, there is already one",
            ));
        }

        let record = operations::AgentOpRecord::from_request(&request);
        operations::add_pending_operation(&self.db, &record).await?;

        Ok(AgentOpResponse {
            organization_id: request.organization_id,
            edge_controller_id: request.edge_controller_id,
            asset_id: request.asset_id,
            operation_id: request.operation_id,
            timestamp: record.created,
            status: OpStatus::Scheduled,
            info: String::new(),
        })
    }

    /// Configuration updates are acknowledged; options apply on restart.
    pub fn configure(&self, request: ConfigureRequest) -> ApiResult<()> {
        info!(options = request.options.len(), "configuration update acknowledged");
        Ok(())
    }

    /// Mint a join token admitting agents for the next hour.
    pub async fn create_agent_join_token(
        &self,
        request: CreateJoinTokenRequest,
    ) -> ApiResult<AgentJoinToken> {
        let token = Uuid::new_v4().to_string();
        let record = tokens::add_join_token(&self.db, &token).await?;
        info!("agent join token added");

        Ok(AgentJoinToken {
            organization_id: request.organization_id,
            edge_controller_id: request.edge_controller_id,
            token,
            expires_on: record.expires_at,
        })
    }

    /// Schedule an agent uninstall and cancel whatever was still queued for
    /// the asset so the center observes every operation terminate.
    pub async fn uninstall_agent(
        &self,
        request: UninstallAgentRequest,
    ) -> ApiResult<EdgeControllerOpResponse> {
        if request.asset_id.is_empty() {
            return Err(AppError::invalid_argument("asset_id cannot be empty"));
        }

        let operation_id = Uuid::new_v4().to_string();
        self.notifier.uninstall_agent(&request, &operation_id).await;

        let pending =
            operations::get_pending_operations(&self.db, &request.asset_id, true).await?;
        for operation in pending {
            let canceled = responses::AgentOpResponseRecord {
                created: Utc::now().timestamp(),
                organization_id: request.organization_id.clone(),
                edge_controller_id: request.edge_controller_id.clone(),
                asset_id: request.asset_id.clone(),
                operation_id: operation.operation_id.clone(),
                timestamp: Utc::now().timestamp(),
                status: OpStatus::Canceled,
                info: CANCELED_RESPONSE_INFO.to_string(),
            };
            if let Err(err) = responses::add_op_response(&self.db, &canceled).await {
                error!(
                    asset_id = %request.asset_id,
                    operation_id = %operation.operation_id,
                    %err,
                    "cannot add canceled operation"
                );
            }
        }

        if request.force {
            if let Err(err) =
                crate::persistence::assets::remove_managed_asset(&self.db, &request.asset_id).await
            {
                warn!(asset_id = %request.asset_id, %err, "error removing agent");
            }
        }

        Ok(EdgeControllerOpResponse {
            organization_id: request.organization_id,
            edge_controller_id: request.edge_controller_id,
            operation_id,
            timestamp: Utc::now().timestamp(),
            status: OpStatus::Scheduled,
            info: UNINSTALL_RESPONSE_INFO.to_string(),
        })
    }

    /// Kick off a remote install and answer immediately; progress flows back
    /// through the notifier as EC op-responses.
    pub async fn install_agent(
        &self,
        request: InstallAgentRequest,
    ) -> ApiResult<EdgeControllerOpResponse> {
        let operation_id = Uuid::new_v4().to_string();
        let token = Uuid::new_v4().to_string();
        tokens::add_join_token(&self.db, &token).await?;

        let installer = self.installer.clone();
        let op = operation_id.clone();
        let response = EdgeControllerOpResponse {
            organization_id: request.organization_id.clone(),
            edge_controller_id: request.edge_controller_id.clone(),
            operation_id,
            timestamp: Utc::now().timestamp(),
            status: OpStatus::Inprogress,
            info: INSTALL_RESPONSE_INFO.to_string(),
        };
        tokio::spawn(async move {
            installer.install(op, token, request).await;
        });

        Ok(response)
    }

    /// List the metrics available for a selection of assets.
    pub async fn list_metrics(&self, selector: AssetSelector) -> ApiResult<MetricsList> {
        validate_asset_selector(&selector)?;
        let metrics = self
            .metrics
            .list_metrics(&query::asset_selector(&selector.asset_ids))
            .await?;
        Ok(MetricsList { metrics })
    }

    /// Query metric data for a selection of assets.
    ///
    /// A single-asset selection keys results by asset; anything wider needs
    /// an aggregation and keys results by it.
    pub async fn query_metrics(
        &self,
        request: QueryMetricsRequest,
    ) -> ApiResult<QueryMetricsResult> {
        validate_asset_selector(&request.assets)?;
        validate_time_range(&request.time_range)?;

        let single_asset = request.assets.asset_ids.len() == 1;
        if !single_asset && request.aggregation == AggregationType::None {
            return Err(AppError::invalid_argument(
                "metrics for more than one asset requested without aggregation method",
            ));
        }

        let metrics = if request.metrics.is_empty() {
            self.list_metrics(request.assets.clone()).await?.metrics
        } else {
            request.metrics.clone()
        };

        let selector = query::asset_selector(&request.assets.asset_ids);
        let range = QueryRange::from_wire(&request.time_range);

        let mut results = HashMap::with_capacity(metrics.len());
        for metric in metrics {
            let values = self
                .metrics
                .query_metric(&metric, &selector, &range, request.aggregation)
                .await?;

            let series = AssetMetricValues {
                asset_id: single_asset.then(|| request.assets.asset_ids[0].clone()),
                aggregation: (!single_asset).then_some(request.aggregation),
                values,
            };
            results.insert(
                metric,
                AssetMetrics {
                    metrics: vec![series],
                },
            );
        }

        Ok(QueryMetricsResult { metrics: results })
    }
}

/// Group and label selection must be resolved centrally before a query
/// reaches the edge.
fn validate_asset_selector(selector: &AssetSelector) -> ApiResult<()> {
    if !selector.group_ids.is_empty() {
        return Err(AppError::invalid_argument(
            "cannot select on group IDs at the edge controller",
        ));
    }
    if !selector.labels.is_empty() {
        return Err(AppError::invalid_argument(
            "cannot select on labels at the edge controller",
        ));
    }
    Ok(())
}

/// Either a point in time, or a range with at least one bound; never both.
fn validate_time_range(range: &TimeRange) -> ApiResult<()> {
    if range.timestamp != 0 {
        if range.time_start != 0 || range.time_end != 0 || range.resolution != 0 {
            return Err(AppError::invalid_argument(
                "timestamp is set; start, end and resolution should be 0",
            ));
        }
    } else if range.time_start == 0 && range.time_end == 0 {
        return Err(AppError::invalid_argument(
            "timestamp is not set; either start, end or both should be set",
        ));
    }
    Ok(())
}
