//! Shared API DTOs used by the edge controller, its agents and the central
//! proxy client.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Status of an operation as reported back to the central platform.
///
/// Operations transition through `Scheduled` into zero or more `Inprogress`
/// updates and terminate in `Success`, `Fail` or `Canceled`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpStatus {
    /// Operation accepted and queued.
    Scheduled,
    /// Operation is being executed.
    Inprogress,
    /// Operation finished successfully.
    Success,
    /// Operation failed.
    Fail,
    /// Operation was canceled before completion.
    Canceled,
}

impl OpStatus {
    /// Returns the canonical wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpStatus::Scheduled => "SCHEDULED",
            OpStatus::Inprogress => "INPROGRESS",
            OpStatus::Success => "SUCCESS",
            OpStatus::Fail => "FAIL",
            OpStatus::Canceled => "CANCELED",
        }
    }
}

/// Supported agent binary targets for remote installs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// Linux on x86-64.
    LinuxAmd64,
    /// Linux on 64-bit ARM.
    LinuxArm64,
    /// Linux on 32-bit ARM.
    LinuxArm32,
    /// Windows on x86-64 (no automatic install support).
    WindowsAmd64,
    /// macOS on x86-64 (no automatic install support).
    DarwinAmd64,
}

impl AgentType {
    /// Directory component under the agent binary tree (`<os>_<arch>`).
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::LinuxAmd64 => "linux_amd64",
            AgentType::LinuxArm64 => "linux_arm64",
            AgentType::LinuxArm32 => "linux_arm32",
            AgentType::WindowsAmd64 => "windows_amd64",
            AgentType::DarwinAmd64 => "darwin_amd64",
        }
    }
}

/// Operating system details reported by a joining agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct OsInfo {
    /// OS name, e.g. `linux`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// OS version string.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// CPU architecture as reported by the OS.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub architecture: String,
}

/// Hardware summary reported by a joining agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct HardwareInfo {
    /// CPU model names.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cpus: Vec<String>,
    /// Installed RAM in megabytes.
    #[serde(default)]
    pub installed_ram_mb: u64,
    /// Network interface names.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub net_interfaces: Vec<String>,
}

/// Storage device reported by a joining agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct StorageInfo {
    /// Device type or mount point.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device: String,
    /// Total capacity in megabytes.
    #[serde(default)]
    pub total_capacity_mb: u64,
}

/// Join request sent by an agent to its edge controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct AgentJoinRequest {
    /// Caller-chosen agent identifier (machine id or similar).
    pub agent_id: String,
    /// Labels attached to the asset.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    /// Operating system details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<OsInfo>,
    /// Hardware details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<HardwareInfo>,
    /// Storage details.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub storage: Vec<StorageInfo>,
}

/// Join request as forwarded to the central proxy, carrying the controller
/// identity alongside the agent-reported inventory.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InventoryAgentJoinRequest {
    /// Organization identifier.
    pub organization_id: String,
    /// Edge controller identifier.
    pub edge_controller_id: String,
    /// Caller-chosen agent identifier.
    pub agent_id: String,
    /// Labels attached to the asset.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    /// Operating system details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<OsInfo>,
    /// Hardware details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<HardwareInfo>,
    /// Storage details.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub storage: Vec<StorageInfo>,
}

/// Join response minted centrally and relayed to the agent.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AgentJoinResponse {
    /// Organization identifier.
    pub organization_id: String,
    /// Edge controller identifier.
    pub edge_controller_id: String,
    /// Asset identifier assigned by the central platform.
    pub asset_id: String,
    /// Long-lived bearer token bound to the asset.
    pub token: String,
}

/// Start notification sent by an agent after boot.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AgentStartInfo {
    /// Asset identifier.
    pub asset_id: String,
    /// IP address the agent sees itself reachable at.
    pub ip: String,
}

/// Plugin payload embedded in an agent check.
///
/// `plugin` names the handler; payload fields are optional so the protocol
/// can grow without breaking older controllers.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PluginData {
    /// Plugin name, e.g. `metrics`.
    pub plugin: String,
    /// Metrics payload, present when `plugin == "metrics"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_data: Option<MetricsData>,
}

/// Periodic check (heartbeat) sent by an agent.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AgentCheckRequest {
    /// Asset identifier.
    pub asset_id: String,
    /// Agent-side epoch seconds at send time.
    pub timestamp: i64,
    /// Embedded plugin payloads.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugin_data: Vec<PluginData>,
}

/// Result of an agent check: the pending operations to execute.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct CheckResult {
    /// Operations for the agent, in enqueue order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_requests: Vec<AgentOpRequest>,
}

/// Operation dispatched from the central platform to an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct AgentOpRequest {
    /// Organization identifier.
    pub organization_id: String,
    /// Edge controller identifier.
    pub edge_controller_id: String,
    /// Asset identifier.
    pub asset_id: String,
    /// Operation identifier, unique per asset; the idempotency key.
    pub operation_id: String,
    /// Operation name. Free-form so agents can evolve independently.
    pub operation: String,
    /// Plugin in charge of executing the operation.
    pub plugin: String,
    /// Operation parameters.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub params: HashMap<String, String>,
}

/// Agent-reported outcome of an operation.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AgentOpResponse {
    /// Organization identifier.
    pub organization_id: String,
    /// Edge controller identifier.
    pub edge_controller_id: String,
    /// Asset identifier.
    pub asset_id: String,
    /// Operation identifier.
    pub operation_id: String,
    /// Agent-side epoch seconds of the status change.
    pub timestamp: i64,
    /// Operation status.
    pub status: OpStatus,
    /// Additional information (output, error text).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub info: String,
}

/// Outcome of an operation the edge controller performed itself
/// (install/uninstall progress).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EdgeControllerOpResponse {
    /// Organization identifier.
    pub organization_id: String,
    /// Edge controller identifier.
    pub edge_controller_id: String,
    /// Operation identifier.
    pub operation_id: String,
    /// Epoch seconds of the status change.
    pub timestamp: i64,
    /// Operation status.
    pub status: OpStatus,
    /// Additional information (step output, error text).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub info: String,
}

/// Batched alive report drained to the central proxy.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AgentsAlive {
    /// Organization identifier.
    pub organization_id: String,
    /// Edge controller identifier.
    pub edge_controller_id: String,
    /// Asset id to epoch seconds of the last check.
    pub agents: HashMap<String, i64>,
    /// Asset id to newly observed IP, only for assets whose IP changed.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub agents_ip: HashMap<String, String>,
}

/// Identifies an uninstalled asset towards the central proxy.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AssetUninstalledId {
    /// Organization identifier.
    pub organization_id: String,
    /// Edge controller identifier.
    pub edge_controller_id: String,
    /// Asset identifier.
    pub asset_id: String,
    /// Operation identifier of the uninstall request.
    pub operation_id: String,
}

/// Identity of an edge controller, used on alive pings.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EicId {
    /// Organization identifier.
    pub organization_id: String,
    /// Edge controller identifier.
    pub edge_controller_id: String,
}

/// Operator request for a fresh agent join token.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateJoinTokenRequest {
    /// Organization identifier.
    pub organization_id: String,
    /// Edge controller identifier.
    pub edge_controller_id: String,
}

/// A freshly minted agent join token.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AgentJoinToken {
    /// Organization identifier.
    pub organization_id: String,
    /// Edge controller identifier.
    pub edge_controller_id: String,
    /// The bearer value agents present on join.
    pub token: String,
    /// Epoch seconds after which the token is invalid.
    pub expires_on: i64,
}

/// Request to uninstall an agent.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UninstallAgentRequest {
    /// Organization identifier.
    pub organization_id: String,
    /// Edge controller identifier.
    pub edge_controller_id: String,
    /// Asset identifier.
    pub asset_id: String,
    /// Skip the agent handshake and drop the asset immediately.
    #[serde(default)]
    pub force: bool,
}

/// SSH credentials for a remote agent install.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct SshCredentials {
    /// Login user on the target host.
    pub username: String,
    /// Password, mutually exclusive with `client_certificate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// PEM private key, mutually exclusive with `password`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_certificate: Option<String>,
    /// Whether commands must be prefixed with sudo.
    #[serde(default)]
    pub is_sudoer: bool,
}

/// Request to install an agent on a remote host.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InstallAgentRequest {
    /// Organization identifier.
    pub organization_id: String,
    /// Edge controller identifier.
    pub edge_controller_id: String,
    /// Host to install onto (`host` or `host:port`).
    pub target_host: String,
    /// SSH credentials.
    pub credentials: SshCredentials,
    /// Binary flavor to install.
    pub agent_type: AgentType,
    /// CA certificate (PEM) the agent will trust.
    pub ca_cert: String,
}

/// Configuration update for the controller or its plugins. Accepted and
/// acknowledged; options take effect on the next restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ConfigureRequest {
    /// Plugin options as dotted keys, e.g. `influxdb.address`.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub options: HashMap<String, String>,
}

/// Selects assets for metrics operations. Only asset ids are resolvable at
/// the edge; group and label selection happens centrally.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct AssetSelector {
    /// Organization identifier.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub organization_id: String,
    /// Edge controller identifier.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub edge_controller_id: String,
    /// Explicit asset ids.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub asset_ids: Vec<String>,
    /// Group ids; must be resolved before reaching the edge.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_ids: Vec<String>,
    /// Labels; must be resolved before reaching the edge.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

/// Cross-asset aggregation to apply to a metrics query.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum AggregationType {
    /// No aggregation; only valid for single-asset selections.
    #[default]
    None,
    /// Sum across assets.
    Sum,
    /// Average across assets.
    Avg,
}

/// Time range of a metrics query.
///
/// Either `timestamp` is set (single point in time) and the other fields are
/// zero, or `timestamp` is zero and at least one of `time_start`/`time_end`
/// is set. All values are epoch seconds; `resolution` is in seconds.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, ToSchema)]
pub struct TimeRange {
    /// Single point in time; zero when querying a range.
    #[serde(default)]
    pub timestamp: i64,
    /// Range start; zero means oldest available.
    #[serde(default)]
    pub time_start: i64,
    /// Range end; zero means newest available.
    #[serde(default)]
    pub time_end: i64,
    /// Seconds between returned points; zero aggregates the whole range.
    #[serde(default)]
    pub resolution: i64,
}

/// Metrics query request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct QueryMetricsRequest {
    /// Asset selection.
    pub assets: AssetSelector,
    /// Metrics to query; empty means all available.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<String>,
    /// Time range.
    pub time_range: TimeRange,
    /// Cross-asset aggregation.
    #[serde(default)]
    pub aggregation: AggregationType,
}

/// One data point of a metrics query result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct MetricValue {
    /// Epoch seconds of the window.
    pub timestamp: i64,
    /// Aggregated value.
    pub value: i64,
    /// Number of assets contributing to the window.
    pub asset_count: i64,
}

/// Values for one asset (or one aggregation) of one metric.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct AssetMetricValues {
    /// Asset id, set when the selection was a single asset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
    /// Aggregation, set when values span several assets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<AggregationType>,
    /// The data points.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<MetricValue>,
}

/// All series returned for one metric.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct AssetMetrics {
    /// Series, one per asset or aggregation.
    pub metrics: Vec<AssetMetricValues>,
}

/// Result of a metrics query, keyed by metric name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct QueryMetricsResult {
    /// Metric name to series.
    pub metrics: HashMap<String, AssetMetrics>,
}

/// Names of the metrics available for a selection of assets.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct MetricsList {
    /// Metric names.
    pub metrics: Vec<String>,
}

/// A batch of samples reported by the metrics plugin of one agent.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MetricsData {
    /// Epoch seconds the batch was collected at.
    pub timestamp: i64,
    /// The samples.
    pub metrics: Vec<Metric>,
}

/// One sample of one measurement.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct Metric {
    /// Measurement name, e.g. `cpu`.
    pub name: String,
    /// Tags (sub-dimension identifiers such as `cpu`, `device`).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,
    /// Field name to counter/gauge value.
    pub fields: HashMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_status_round_trips_screaming_case() {
        let json = serde_json::to_string(&OpStatus::Inprogress).expect("serialize");
        assert_eq!(json, "\"INPROGRESS\"");
        let back: OpStatus = serde_json::from_str("\"CANCELED\"").expect("deserialize");
        assert_eq!(back, OpStatus::Canceled);
    }

    #[test]
    fn agent_type_directory_component() {
        assert_eq!(AgentType::LinuxAmd64.as_str(), "linux_amd64");
        let parsed: AgentType = serde_json::from_str("\"linux_arm64\"").expect("deserialize");
        assert_eq!(parsed, AgentType::LinuxArm64);
    }

    #[test]
    fn check_result_omits_empty_pending_list() {
        let value = serde_json::to_value(CheckResult::default()).expect("serialize");
        assert_eq!(value, serde_json::json!({}));
    }

    #[test]
    fn aggregation_defaults_to_none() {
        let req: QueryMetricsRequest = serde_json::from_value(serde_json::json!({
            "assets": {"asset_ids": ["a1"]},
            "time_range": {"timestamp": 100},
        }))
        .expect("deserialize");
        assert_eq!(req.aggregation, AggregationType::None);
        assert!(req.metrics.is_empty());
    }
}
