use metrics_exporter_prometheus::PrometheusHandle;

use crate::notifier::Notifier;
use crate::persistence::Db;
use crate::services::agents::AgentManager;
use crate::services::control::ControlManager;

/// Shared application state passed into handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub agents: AgentManager,
    pub control: ControlManager,
    pub notifier: Notifier,
    pub metrics_handle: PrometheusHandle,
    pub debug: bool,
}
