use std::time::Duration;

use axum::http::StatusCode;
use common::api::{
    AgentJoinResponse, AgentOpResponse, AgentStartInfo, AgentsAlive, AssetUninstalledId,
    EdgeControllerOpResponse, EicId, InventoryAgentJoinRequest,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::error::{ApiResult, AppError};

/// Deadline for regular cluster calls.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Joins involve central certificate issuance and get a longer deadline.
const JOIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Client for the edge-inventory proxy on the management cluster.
///
/// Every call is bounded by a deadline; callers on the drain path treat any
/// error as a per-item failure and re-enqueue.
#[derive(Clone)]
pub struct CentralProxyClient {
    base_url: String,
    client: reqwest::Client,
}

impl CentralProxyClient {
    /// Build a client for `base_url`, trusting `ca_pem` when provided (the CA
    /// handed out with the join credentials).
    pub fn new(base_url: &str, ca_pem: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(DEFAULT_TIMEOUT);
        if let Some(pem) = ca_pem {
            let cert = reqwest::Certificate::from_pem(pem.as_bytes())?;
            builder = builder.add_root_certificate(cert);
        }
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: builder.build()?,
        })
    }

    pub async fn agent_join(
        &self,
        request: &InventoryAgentJoinRequest,
    ) -> ApiResult<AgentJoinResponse> {
        self.post_json("/api/v1/inventory/agents/join", request, Some(JOIN_TIMEOUT))
            .await
    }

    pub async fn log_agent_alive(&self, message: &AgentsAlive) -> ApiResult<()> {
        self.post_ack("/api/v1/inventory/agents/alive", message).await
    }

    pub async fn callback_agent_operation(&self, response: &AgentOpResponse) -> ApiResult<()> {
        self.post_ack("/api/v1/inventory/agents/callback", response)
            .await
    }

    pub async fn callback_ec_operation(
        &self,
        response: &EdgeControllerOpResponse,
    ) -> ApiResult<()> {
        self.post_ack("/api/v1/inventory/ec/callback", response).await
    }

    pub async fn agent_uninstalled(&self, message: &AssetUninstalledId) -> ApiResult<()> {
        self.post_ack("/api/v1/inventory/agents/uninstalled", message)
            .await
    }

    pub async fn agent_started(&self, message: &AgentStartInfo) -> ApiResult<()> {
        self.post_ack("/api/v1/inventory/agents/started", message)
            .await
    }

    pub async fn eic_start(&self, message: &EicId) -> ApiResult<()> {
        self.post_ack("/api/v1/inventory/eic/start", message).await
    }

    pub async fn eic_alive(&self, message: &EicId) -> ApiResult<()> {
        self.post_ack("/api/v1/inventory/eic/alive", message).await
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        timeout: Option<Duration>,
    ) -> ApiResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.post(&url).json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(|err| {
            warn!(%url, ?err, "central proxy request failed");
            AppError::unavailable(format!("central proxy unreachable: {err}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%url, %status, error = %body, "central proxy returned error");
            return Err(map_central_error(status, &body));
        }

        response.json::<T>().await.map_err(|err| {
            warn!(%url, ?err, "central proxy response did not decode");
            AppError::internal("unexpected central proxy response shape")
        })
    }

    async fn post_ack<B: Serialize>(&self, path: &str, body: &B) -> ApiResult<()> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.post(&url).json(body).send().await.map_err(|err| {
            warn!(%url, ?err, "central proxy request failed");
            AppError::unavailable(format!("central proxy unreachable: {err}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%url, %status, error = %body, "central proxy returned error");
            return Err(map_central_error(status, &body));
        }
        Ok(())
    }
}

/// Keep the central error kind intact instead of flattening everything into
/// `unavailable`.
fn map_central_error(status: StatusCode, body: &str) -> AppError {
    let message = if body.is_empty() {
        format!("central proxy returned {status}")
    } else {
        body.to_string()
    };
    match status {
        StatusCode::BAD_REQUEST => AppError::invalid_argument(message),
        StatusCode::UNAUTHORIZED => AppError::unauthenticated(message),
        StatusCode::CONFLICT => AppError::already_exists(message),
        StatusCode::NOT_FOUND => AppError::not_found(message),
        StatusCode::PRECONDITION_FAILED => AppError::failed_precondition(message),
        StatusCode::NOT_IMPLEMENTED => AppError::unimplemented(message),
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY | StatusCode::GATEWAY_TIMEOUT => {
            AppError::unavailable(message)
        }
        _ => AppError::internal(message),
    }
}
