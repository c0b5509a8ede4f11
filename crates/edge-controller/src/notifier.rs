use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use common::api::{
    AgentOpResponse, AgentStartInfo, AgentsAlive, AssetUninstalledId, EdgeControllerOpResponse,
    UninstallAgentRequest,
};

use crate::error::ApiResult;
use crate::persistence::{self as db, events, responses};
use crate::proxy::CentralProxyClient;

/// An uninstall in flight, kept until the center has acknowledged it.
#[derive(Debug, Clone)]
pub struct UninstallRecord {
    pub organization_id: String,
    pub edge_controller_id: String,
    pub asset_id: String,
    pub operation_id: String,
    pub force: bool,
}

impl UninstallRecord {
    fn from_request(request: &UninstallAgentRequest, operation_id: &str) -> Self {
        Self {
            organization_id: request.organization_id.clone(),
            edge_controller_id: request.edge_controller_id.clone(),
            asset_id: request.asset_id.clone(),
            operation_id: operation_id.to_string(),
            force: request.force,
        }
    }
}

/// Everything the notifier coalesces between drain ticks. One mutex guards
/// the whole struct; accumulation paths and the drain both go through it.
#[derive(Default)]
struct CoalescedState {
    /// Asset id to epoch seconds of its last check.
    alive_set: HashMap<String, i64>,
    /// Last IP observed per asset.
    ip_set: HashMap<String, String>,
    /// Assets whose IP changed since the last successful alive report.
    new_ip_set: HashMap<String, String>,
    /// Uninstalls waiting for the agent's next check-in.
    pending_uninstall: HashMap<String, UninstallRecord>,
    /// Uninstalls done locally, waiting to be reported to the center.
    completed_uninstall: HashMap<String, UninstallRecord>,
}

/// Buffers edge state and periodically drains it to the central proxy.
///
/// Durable items (op responses, EC responses, start events) live in the
/// store and survive restarts; the alive/uninstall maps are in-memory and
/// rebuilt from agent traffic.
#[derive(Clone)]
pub struct Notifier {
    inner: Arc<NotifierInner>,
}

struct NotifierInner {
    db: db::Db,
    proxy: CentralProxyClient,
    organization_id: String,
    edge_controller_id: String,
    state: Mutex<CoalescedState>,
    shutdown: watch::Sender<bool>,
}

impl Notifier {
    pub fn new(
        db: db::Db,
        proxy: CentralProxyClient,
        organization_id: &str,
        edge_controller_id: &str,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(NotifierInner {
                db,
                proxy,
                organization_id: organization_id.to_string(),
                edge_controller_id: edge_controller_id.to_string(),
                state: Mutex::new(CoalescedState::default()),
                shutdown,
            }),
        }
    }

    /// Record that an agent checked in, tracking IP changes for the next
    /// drain.
    pub async fn agent_alive(&self, asset_id: &str, ip: &str) {
        let mut state = self.inner.state.lock().await;
        debug!(asset_id, ip, "asset is alive");
        state.alive_set.insert(asset_id.to_string(), Utc::now().timestamp());

        let ip_changed = match state.ip_set.get(asset_id) {
            None => true,
            Some(old_ip) => old_ip != ip,
        };
        if ip_changed {
            state.new_ip_set.insert(asset_id.to_string(), ip.to_string());
            state.ip_set.insert(asset_id.to_string(), ip.to_string());
        }
    }

    /// Durably buffer an agent start event for the next drain.
    pub async fn notify_agent_start(&self, info: &AgentStartInfo) -> ApiResult<()> {
        events::add_agent_start(&self.inner.db, &events::AgentStartRecord::from_info(info)).await
    }

    /// Durably buffer an agent operation response for the next drain.
    pub async fn notify_callback(&self, response: &AgentOpResponse) -> ApiResult<()> {
        responses::add_op_response(
            &self.inner.db,
            &responses::AgentOpResponseRecord::from_response(response),
        )
        .await
    }

    /// Durably buffer an EC operation response for the next drain.
    pub async fn notify_ec_op_response(
        &self,
        response: &EdgeControllerOpResponse,
    ) -> ApiResult<()> {
        responses::add_ec_op_response(
            &self.inner.db,
            &responses::EcOpResponseRecord::from_response(response),
        )
        .await
    }

    /// Register an uninstall. Forced uninstalls skip the agent handshake and
    /// go straight to the completed set; the rest wait for the agent's next
    /// check-in. Either way the asset stops being reported alive.
    pub async fn uninstall_agent(&self, request: &UninstallAgentRequest, operation_id: &str) {
        let record = UninstallRecord::from_request(request, operation_id);
        let mut state = self.inner.state.lock().await;

        if request.force {
            state.completed_uninstall.insert(request.asset_id.clone(), record);
        } else {
            state.pending_uninstall.insert(request.asset_id.clone(), record);
        }

        state.alive_set.remove(&request.asset_id);
        state.ip_set.remove(&request.asset_id);
        state.new_ip_set.remove(&request.asset_id);
    }

    /// Whether an uninstall is waiting for this asset's check-in.
    pub async fn pending_uninstall(&self, asset_id: &str) -> Option<UninstallRecord> {
        let state = self.inner.state.lock().await;
        state.pending_uninstall.get(asset_id).cloned()
    }

    /// Move an asset's uninstall from pending to completed once the agent has
    /// been told.
    pub async fn remove_pending_uninstall(&self, asset_id: &str) {
        let mut state = self.inner.state.lock().await;
        match state.pending_uninstall.remove(asset_id) {
            Some(record) => {
                state.completed_uninstall.insert(asset_id.to_string(), record);
            }
            None => warn!(asset_id, "asset not found in pending uninstall set"),
        }
    }

    /// Halt the drain loop.
    pub fn stop(&self) {
        let _ = self.inner.shutdown.send(true);
    }

    /// Run one drain against the central proxy. Failures are logged and the
    /// affected items stay buffered for the next tick.
    pub async fn drain(&self) {
        let mut state = self.inner.state.lock().await;

        if !state.alive_set.is_empty() {
            let message = AgentsAlive {
                organization_id: self.inner.organization_id.clone(),
                edge_controller_id: self.inner.edge_controller_id.clone(),
                agents: state.alive_set.clone(),
                agents_ip: state.new_ip_set.clone(),
            };
            match self.inner.proxy.log_agent_alive(&message).await {
                Ok(()) => {
                    state.alive_set.clear();
                    state.new_ip_set.clear();
                }
                Err(err) => {
                    // Keep both sets; the next tick re-sends the superset.
                    warn!(%err, "cannot send alive messages to management cluster");
                }
            }
        }

        self.drain_agent_starts().await;
        self.drain_agent_responses().await;

        let completed: Vec<UninstallRecord> = state.completed_uninstall.values().cloned().collect();
        for record in completed {
            let message = AssetUninstalledId {
                organization_id: record.organization_id.clone(),
                edge_controller_id: record.edge_controller_id.clone(),
                asset_id: record.asset_id.clone(),
                operation_id: record.operation_id.clone(),
            };
            match self.inner.proxy.agent_uninstalled(&message).await {
                Ok(()) => {
                    state.completed_uninstall.remove(&record.asset_id);
                }
                Err(err) => {
                    warn!(asset_id = %record.asset_id, %err, "cannot send agent uninstalled message");
                }
            }
        }

        self.drain_ec_responses().await;
    }

    async fn drain_agent_starts(&self) {
        let pending = match events::get_pending_agent_starts(&self.inner.db, true).await {
            Ok(pending) => pending,
            Err(err) => {
                warn!(%err, "error getting pending agent start events");
                return;
            }
        };

        for record in pending {
            let info = AgentStartInfo {
                asset_id: record.asset_id.clone(),
                ip: record.ip.clone(),
            };
            if let Err(err) = self.inner.proxy.agent_started(&info).await {
                warn!(asset_id = %record.asset_id, %err, "error sending agent start event");
                if let Err(err) = events::add_agent_start(&self.inner.db, &record).await {
                    warn!(asset_id = %record.asset_id, %err, "re-storing the agent start event");
                }
            }
        }
    }

    async fn drain_agent_responses(&self) {
        let pending = match responses::get_pending_op_responses(&self.inner.db, true).await {
            Ok(pending) => pending,
            Err(err) => {
                warn!(%err, "error getting pending operation responses");
                return;
            }
        };

        for record in pending {
            let response = record.clone().into_response();
            if let Err(err) = self.inner.proxy.callback_agent_operation(&response).await {
                warn!(
                    asset_id = %record.asset_id,
                    operation_id = %record.operation_id,
                    %err,
                    "error sending agent response"
                );
                if let Err(err) = responses::add_op_response(&self.inner.db, &record).await {
                    warn!(operation_id = %record.operation_id, %err, "re-storing the agent response");
                }
            }
        }
    }

    async fn drain_ec_responses(&self) {
        let pending = match responses::get_pending_ec_op_responses(&self.inner.db, true).await {
            Ok(pending) => pending,
            Err(err) => {
                warn!(%err, "error getting pending edge-controller operation responses");
                return;
            }
        };
        debug!(pending = pending.len(), "pending edge-controller responses");

        for record in pending {
            let response = record.clone().into_response();
            if let Err(err) = self.inner.proxy.callback_ec_operation(&response).await {
                warn!(
                    operation_id = %record.operation_id,
                    %err,
                    "error sending edge-controller response"
                );
                if let Err(err) = responses::add_ec_op_response(&self.inner.db, &record).await {
                    warn!(operation_id = %record.operation_id, %err, "re-storing the edge-controller response");
                }
            }
        }
    }

    /// Periodic drain until `stop()` or process shutdown.
    pub async fn run(&self, notify_period: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(period_secs = notify_period.as_secs(), "launching notifier loop");
        let mut own_shutdown = self.inner.shutdown.subscribe();
        let mut interval = tokio::time::interval(notify_period);
        // The first tick of a tokio interval fires immediately; skip it so
        // the first drain happens a full period after startup.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = own_shutdown.changed() => break,
                _ = interval.tick() => self.drain().await,
            }
        }
        info!("notifier loop stopped");
    }
}
