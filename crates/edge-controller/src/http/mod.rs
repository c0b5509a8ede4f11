use axum::Router;
use tower_http::limit::RequestBodyLimitLayer;
use utoipa::OpenApi;

use crate::app_state::AppState;

mod agents;
mod central;

/// Checks carry embedded plugin payloads (metrics batches); everything else
/// is small.
const AGENT_BODY_LIMIT_BYTES: usize = 4 * 1024 * 1024;

/// OpenAPI document served on the central listener in debug mode, the HTTP
/// counterpart of reflection on a debug build.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "edge-controller",
        description = "Edge controller managing a fleet of on-premise agents"
    ),
    components(schemas(
        common::api::AgentJoinRequest,
        common::api::AgentJoinResponse,
        common::api::AgentStartInfo,
        common::api::AgentCheckRequest,
        common::api::CheckResult,
        common::api::AgentOpRequest,
        common::api::AgentOpResponse,
        common::api::EdgeControllerOpResponse,
        common::api::CreateJoinTokenRequest,
        common::api::AgentJoinToken,
        common::api::UninstallAgentRequest,
        common::api::InstallAgentRequest,
        common::api::ConfigureRequest,
        common::api::AssetSelector,
        common::api::QueryMetricsRequest,
        common::api::QueryMetricsResult,
        common::api::MetricsList,
        common::api::MetricsData,
    ))
)]
pub struct ApiDoc;

/// Agent-facing listener surface.
pub fn build_agent_router(state: AppState) -> Router<AppState> {
    let mut router =
        agents::router(state.clone()).layer(RequestBodyLimitLayer::new(AGENT_BODY_LIMIT_BYTES));
    if state.debug {
        router = router.route("/openapi.json", axum::routing::get(central::openapi_document));
    }
    router
}

/// Central-facing listener surface.
pub fn build_central_router(state: AppState) -> Router<AppState> {
    central::router(state)
}
