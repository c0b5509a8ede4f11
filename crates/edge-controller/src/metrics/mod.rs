use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use common::api::{AggregationType, MetricValue, MetricsData};

use crate::error::{ApiResult, AppError};

pub mod influx;
pub mod query;

pub use query::{QueryRange, TagSelector};

/// Connection parameters for a metric storage backend.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub provider_type: String,
    /// Protocol, hostname and port, e.g. `http://localhost:8086`.
    pub address: String,
    pub database: String,
    /// Retention window in seconds; 0 keeps data forever.
    pub retention_secs: i64,
}

impl ConnectionConfig {
    /// Resolve the configuration from dotted plugin options.
    pub fn from_options(options: &HashMap<String, String>) -> ApiResult<Self> {
        let address = options
            .get("influxdb.address")
            .cloned()
            .unwrap_or_else(|| "http://localhost:8086".to_string());
        let database = options
            .get("influxdb.database")
            .cloned()
            .unwrap_or_else(|| "metrics".to_string());
        let retention_secs = match options.get("retention").map(String::as_str) {
            None | Some("inf") => 0,
            Some(raw) => parse_duration_secs(raw)?,
        };
        Ok(Self {
            provider_type: "influxdb".to_string(),
            address,
            database,
            retention_secs,
        })
    }
}

/// Parse `90s`, `15m`, `48h`, `30d` or a bare number of seconds.
pub fn parse_duration_secs(raw: &str) -> ApiResult<i64> {
    let raw = raw.trim();
    let (digits, multiplier) = match raw.chars().last() {
        Some('s') => (&raw[..raw.len() - 1], 1),
        Some('m') => (&raw[..raw.len() - 1], 60),
        Some('h') => (&raw[..raw.len() - 1], 3600),
        Some('d') => (&raw[..raw.len() - 1], 86_400),
        Some('w') => (&raw[..raw.len() - 1], 604_800),
        _ => (raw, 1),
    };
    let value: i64 = digits
        .parse()
        .map_err(|_| AppError::invalid_argument(format!("cannot parse duration {raw:?}")))?;
    if value < 0 {
        return Err(AppError::invalid_argument(format!(
            "duration {raw:?} cannot be negative"
        )));
    }
    Ok(value * multiplier)
}

/// A metric storage backend.
///
/// Connection lifecycle is explicit: `connect` before anything else, writes
/// and queries fail `unavailable` when disconnected.
#[async_trait]
pub trait MetricStorageProvider: Send + Sync {
    async fn connect(&self) -> ApiResult<()>;
    async fn disconnect(&self) -> ApiResult<()>;
    fn connected(&self) -> bool;

    /// Create the schema. An existing schema fails `invalid_argument` unless
    /// `if_needed` is set, in which case it is a no-op.
    async fn create_schema(&self, if_needed: bool) -> ApiResult<()>;

    /// Alter the retention window; 0 means infinite.
    async fn set_retention(&self, retention_secs: i64) -> ApiResult<()>;

    /// Write a batch of points, merging `extra_tags` into every point.
    async fn store_metrics_data(
        &self,
        data: &MetricsData,
        extra_tags: &HashMap<String, String>,
    ) -> ApiResult<()>;

    /// List metric names available for the selected tags.
    async fn list_metrics(&self, selector: &TagSelector) -> ApiResult<Vec<String>>;

    /// Run the staged query for one metric.
    async fn query_metric(
        &self,
        metric: &str,
        selector: &TagSelector,
        range: &QueryRange,
        aggregation: AggregationType,
    ) -> ApiResult<Vec<MetricValue>>;
}

type ProviderFactory = fn(&ConnectionConfig) -> ApiResult<Arc<dyn MetricStorageProvider>>;

/// Explicit backend registry, built at startup and threaded through
/// construction. No global state, so tests compose their own.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in backend.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("influxdb", influx::new_provider);
        registry
    }

    pub fn register(&mut self, provider_type: &str, factory: ProviderFactory) {
        self.factories.insert(provider_type.to_string(), factory);
    }

    pub fn create(&self, config: &ConnectionConfig) -> ApiResult<Arc<dyn MetricStorageProvider>> {
        let factory = self.factories.get(&config.provider_type).ok_or_else(|| {
            AppError::invalid_argument(format!(
                "metric storage provider {} not available",
                config.provider_type
            ))
        })?;
        factory(config)
    }
}
