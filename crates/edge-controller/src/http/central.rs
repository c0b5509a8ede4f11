use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use utoipa::OpenApi;

use common::api::{
    AgentJoinToken, AgentOpRequest, AgentOpResponse, AssetSelector, ConfigureRequest,
    CreateJoinTokenRequest, EdgeControllerOpResponse, InstallAgentRequest, MetricsList,
    QueryMetricsRequest, QueryMetricsResult, UninstallAgentRequest,
};

use crate::app_state::AppState;
use crate::error::{ApiResult, AppError};
use crate::telemetry;

pub fn router(state: AppState) -> Router<AppState> {
    let mut router = Router::<AppState>::new()
        .route("/api/v1/ec/unlink", post(unlink))
        .route("/api/v1/ec/operations", post(trigger_agent_operation))
        .route("/api/v1/ec/configure", post(configure))
        .route("/api/v1/ec/join-tokens", post(create_agent_join_token))
        .route("/api/v1/ec/agents/uninstall", post(uninstall_agent))
        .route("/api/v1/ec/agents/install", post(install_agent))
        .route("/api/v1/ec/metrics/list", post(list_metrics))
        .route("/api/v1/ec/metrics/query", post(query_metrics))
        .route("/metrics", get(prometheus_metrics));

    if state.debug {
        router = router.route("/openapi.json", get(openapi_document));
    }
    router
}

async fn unlink(State(state): State<AppState>) -> ApiResult<StatusCode> {
    state.control.unlink()?;
    Ok(StatusCode::NO_CONTENT)
}

async fn trigger_agent_operation(
    State(state): State<AppState>,
    Json(request): Json<AgentOpRequest>,
) -> ApiResult<Json<AgentOpResponse>> {
    telemetry::record_operation_triggered();
    let response = state.control.trigger_agent_operation(request).await?;
    Ok(Json(response))
}

async fn configure(
    State(state): State<AppState>,
    Json(request): Json<ConfigureRequest>,
) -> ApiResult<StatusCode> {
    state.control.configure(request)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_agent_join_token(
    State(state): State<AppState>,
    Json(request): Json<CreateJoinTokenRequest>,
) -> ApiResult<Json<AgentJoinToken>> {
    let token = state.control.create_agent_join_token(request).await?;
    Ok(Json(token))
}

async fn uninstall_agent(
    State(state): State<AppState>,
    Json(request): Json<UninstallAgentRequest>,
) -> ApiResult<Json<EdgeControllerOpResponse>> {
    let response = state.control.uninstall_agent(request).await?;
    Ok(Json(response))
}

async fn install_agent(
    State(state): State<AppState>,
    Json(request): Json<InstallAgentRequest>,
) -> ApiResult<Json<EdgeControllerOpResponse>> {
    telemetry::record_install_started();
    let response = state.control.install_agent(request).await?;
    Ok(Json(response))
}

async fn list_metrics(
    State(state): State<AppState>,
    Json(selector): Json<AssetSelector>,
) -> ApiResult<Json<MetricsList>> {
    let list = state.control.list_metrics(selector).await?;
    Ok(Json(list))
}

async fn query_metrics(
    State(state): State<AppState>,
    Json(request): Json<QueryMetricsRequest>,
) -> ApiResult<Json<QueryMetricsResult>> {
    let result = state.control.query_metrics(request).await?;
    Ok(Json(result))
}

async fn prometheus_metrics(State(state): State<AppState>) -> String {
    state.metrics_handle.render()
}

pub(super) async fn openapi_document() -> ApiResult<Json<serde_json::Value>> {
    let doc = super::ApiDoc::openapi();
    let value = serde_json::to_value(doc)
        .map_err(|_| AppError::internal("cannot render the OpenAPI document"))?;
    Ok(Json(value))
}
