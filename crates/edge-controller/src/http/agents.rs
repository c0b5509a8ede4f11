use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    middleware,
    routing::post,
    Json, Router,
};

use common::api::{
    AgentCheckRequest, AgentJoinRequest, AgentJoinResponse, AgentOpResponse, AgentStartInfo,
    CheckResult,
};

use crate::app_state::AppState;
use crate::auth::require_agent_token;
use crate::error::ApiResult;
use crate::telemetry;

pub fn router(state: AppState) -> Router<AppState> {
    // Join and check are the externally reachable methods and go through
    // token admission; start and callback are internal to the agent socket.
    let admitted = Router::<AppState>::new()
        .route("/api/v1/agents/join", post(join))
        .route("/api/v1/agents/check", post(check))
        .layer(middleware::from_fn_with_state(state, require_agent_token));

    Router::<AppState>::new()
        .merge(admitted)
        .route("/api/v1/agents/start", post(start))
        .route("/api/v1/agents/callback", post(callback))
}

async fn join(
    State(state): State<AppState>,
    Json(request): Json<AgentJoinRequest>,
) -> ApiResult<Json<AgentJoinResponse>> {
    telemetry::record_agent_join();
    let response = state.agents.agent_join(request).await?;
    Ok(Json(response))
}

async fn start(
    State(state): State<AppState>,
    Json(info): Json<AgentStartInfo>,
) -> ApiResult<StatusCode> {
    state.agents.agent_start(info).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn check(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(request): Json<AgentCheckRequest>,
) -> ApiResult<Json<CheckResult>> {
    telemetry::record_agent_check();
    let result = state
        .agents
        .agent_check(request, &peer.ip().to_string())
        .await?;
    Ok(Json(result))
}

async fn callback(
    State(state): State<AppState>,
    Json(response): Json<AgentOpResponse>,
) -> ApiResult<StatusCode> {
    state.agents.callback_agent_operation(response).await?;
    Ok(StatusCode::NO_CONTENT)
}
