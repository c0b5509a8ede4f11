use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use common::api::PluginData;

use crate::error::{ApiResult, AppError};
use crate::metrics::{ConnectionConfig, MetricStorageProvider, ProviderRegistry};

use super::{EdgePlugin, FlagDescriptor, PluginDescriptor};

static METRICS_DESCRIPTOR: PluginDescriptor = PluginDescriptor {
    name: "metrics",
    description: "System metrics storage plugin",
    flags: &[
        FlagDescriptor {
            name: "influxdb.address",
            description: "InfluxDB address",
            default: "http://localhost:8086",
        },
        FlagDescriptor {
            name: "influxdb.database",
            description: "InfluxDB database name",
            default: "metrics",
        },
        FlagDescriptor {
            name: "retention",
            description: "Metric retention window (duration or \"inf\")",
            default: "inf",
        },
    ],
};

/// Stores agent-reported metrics into the configured time-series backend.
pub struct MetricsPlugin {
    provider: Arc<dyn MetricStorageProvider>,
    retention_secs: i64,
}

impl MetricsPlugin {
    /// Build the plugin from resolved plugin options.
    pub fn new(
        options: &HashMap<String, String>,
        providers: &ProviderRegistry,
    ) -> ApiResult<Self> {
        let config = ConnectionConfig::from_options(options)?;
        let provider = providers.create(&config)?;
        Ok(Self {
            provider,
            retention_secs: config.retention_secs,
        })
    }

    pub fn provider(&self) -> Arc<dyn MetricStorageProvider> {
        self.provider.clone()
    }
}

#[async_trait]
impl EdgePlugin for MetricsPlugin {
    fn descriptor(&self) -> &'static PluginDescriptor {
        &METRICS_DESCRIPTOR
    }

    async fn start(&self) -> ApiResult<()> {
        self.provider.connect().await?;
        self.provider.create_schema(true).await?;
        self.provider.set_retention(self.retention_secs).await?;
        Ok(())
    }

    async fn stop(&self) {
        let _ = self.provider.disconnect().await;
    }

    async fn handle_agent_data(&self, asset_id: &str, data: &PluginData) -> ApiResult<()> {
        debug!(asset_id, "metrics data received");
        if !self.provider.connected() {
            return Err(AppError::unavailable("metrics plugin not started"));
        }

        let metrics = data
            .metrics_data
            .as_ref()
            .ok_or_else(|| AppError::invalid_argument("invalid plugin data for metrics"))?;

        let extra_tags = HashMap::from([("asset_id".to_string(), asset_id.to_string())]);
        self.provider.store_metrics_data(metrics, &extra_tags).await
    }
}
