use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error};

use common::api::{AggregationType, MetricValue, MetricsData};

use crate::error::{ApiResult, AppError};

use super::{
    query::generate_query, ConnectionConfig, MetricStorageProvider, QueryRange, TagSelector,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Measurements exposed as separate read/write pseudo-metrics.
const RW_METRICS: [&str; 2] = ["diskio", "net"];

/// Metric storage over the InfluxDB 1.x HTTP API.
pub struct InfluxProvider {
    address: String,
    database: String,
    client: RwLock<Option<reqwest::Client>>,
}

pub fn new_provider(config: &ConnectionConfig) -> ApiResult<Arc<dyn MetricStorageProvider>> {
    Ok(Arc::new(InfluxProvider {
        address: config.address.trim_end_matches('/').to_string(),
        database: config.database.clone(),
        client: RwLock::new(None),
    }))
}

impl InfluxProvider {
    fn client(&self) -> ApiResult<reqwest::Client> {
        self.client
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
            .ok_or_else(|| AppError::unavailable("metrics backend not connected"))
    }

    async fn query(&self, q: &str) -> ApiResult<Value> {
        let client = self.client()?;
        let response = client
            .get(format!("{}/query", self.address))
            .query(&[
                ("db", self.database.as_str()),
                ("q", q),
                ("epoch", "s"),
            ])
            .send()
            .await
            .map_err(|err| AppError::unavailable(format!("metrics backend unreachable: {err}")))?;

        let status = response.status();
        let body: Value = response.json().await.map_err(|err| {
            error!(?err, "metrics backend response did not decode");
            AppError::internal("unexpected metrics backend response shape")
        })?;

        if !status.is_success() {
            return Err(AppError::unavailable(format!(
                "metrics backend returned {status}: {body}"
            )));
        }
        if let Some(message) = body
            .pointer("/results/0/error")
            .or_else(|| body.pointer("/error"))
            .and_then(Value::as_str)
        {
            return Err(AppError::internal(format!(
                "metrics backend query error: {message}"
            )));
        }
        Ok(body)
    }
}

fn first_series_values(body: &Value) -> Vec<&Vec<Value>> {
    match body.pointer("/results/0/series/0/values").and_then(Value::as_array) {
        Some(rows) => rows.iter().filter_map(Value::as_array).collect(),
        None => Vec::new(),
    }
}

fn int_from_value(value: &Value) -> ApiResult<i64> {
    if let Some(int) = value.as_i64() {
        return Ok(int);
    }
    if let Some(float) = value.as_f64() {
        return Ok(float as i64);
    }
    Err(AppError::internal(format!(
        "unexpected value in metrics backend response: {value}"
    )))
}

fn escape_tag(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

fn escape_measurement(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace(',', "\\,").replace(' ', "\\ ")
}

fn tags_where(selector: &TagSelector) -> String {
    let mut clauses = Vec::new();
    for (tag, values) in selector {
        if values.is_empty() {
            continue;
        }
        let disjunction: Vec<String> = values
            .iter()
            .map(|value| format!("\"{tag}\"='{value}'"))
            .collect();
        clauses.push(format!("({})", disjunction.join(" OR ")));
    }
    if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    }
}

/// Shard duration appropriate for a retention window.
fn shard_duration(retention_secs: i64) -> &'static str {
    if retention_secs == 0 {
        "1w"
    } else if retention_secs < 48 * 3600 {
        "1h"
    } else if retention_secs < 180 * 86_400 {
        "1d"
    } else {
        "1w"
    }
}

#[async_trait]
impl MetricStorageProvider for InfluxProvider {
    async fn connect(&self) -> ApiResult<()> {
        debug!(address = %self.address, "connecting to influxdb");
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| AppError::unavailable(format!("cannot build influxdb client: {err}")))?;
        *self.client.write().unwrap_or_else(|err| err.into_inner()) = Some(client);
        Ok(())
    }

    async fn disconnect(&self) -> ApiResult<()> {
        *self.client.write().unwrap_or_else(|err| err.into_inner()) = None;
        Ok(())
    }

    fn connected(&self) -> bool {
        self.client
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .is_some()
    }

    async fn create_schema(&self, if_needed: bool) -> ApiResult<()> {
        let body = self.query("SHOW DATABASES").await?;
        let exists = first_series_values(&body)
            .iter()
            .any(|row| row.first().and_then(Value::as_str) == Some(self.database.as_str()));

        if exists {
            if !if_needed {
                return Err(AppError::invalid_argument(format!(
                    "database {} already exists",
                    self.database
                )));
            }
            return Ok(());
        }

        self.query(&format!(
            "CREATE DATABASE \"{0}\" WITH DURATION 0s REPLICATION 1 NAME \"{0}\"",
            self.database
        ))
        .await?;
        Ok(())
    }

    async fn set_retention(&self, retention_secs: i64) -> ApiResult<()> {
        if retention_secs != 0 && retention_secs < 3600 {
            return Err(AppError::invalid_argument(
                "retention must be at least one hour",
            ));
        }

        self.query(&format!(
            "ALTER RETENTION POLICY \"{0}\" ON \"{0}\" DURATION {1}s SHARD DURATION {2}",
            self.database,
            retention_secs,
            shard_duration(retention_secs)
        ))
        .await?;
        Ok(())
    }

    async fn store_metrics_data(
        &self,
        data: &MetricsData,
        extra_tags: &HashMap<String, String>,
    ) -> ApiResult<()> {
        let client = self.client()?;

        let mut lines = Vec::with_capacity(data.metrics.len());
        for metric in &data.metrics {
            let mut tags: BTreeMap<&str, &str> = metric
                .tags
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            for (k, v) in extra_tags {
                tags.insert(k.as_str(), v.as_str());
            }

            let mut line = escape_measurement(&metric.name);
            for (k, v) in tags {
                line.push(',');
                line.push_str(&escape_tag(k));
                line.push('=');
                line.push_str(&escape_tag(v));
            }

            let fields: BTreeMap<&str, u64> = metric
                .fields
                .iter()
                .map(|(k, v)| (k.as_str(), *v))
                .collect();
            let rendered: Vec<String> = fields
                .iter()
                .map(|(k, v)| format!("{}={v}i", escape_tag(k)))
                .collect();
            if rendered.is_empty() {
                continue;
            }
            line.push(' ');
            line.push_str(&rendered.join(","));
            line.push(' ');
            line.push_str(&data.timestamp.to_string());
            lines.push(line);
        }

        if lines.is_empty() {
            return Ok(());
        }

        let response = client
            .post(format!("{}/write", self.address))
            .query(&[("db", self.database.as_str()), ("precision", "s")])
            .body(lines.join("\n"))
            .send()
            .await
            .map_err(|err| AppError::unavailable(format!("metrics backend unreachable: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(%status, error = %body, "error writing to influxdb");
            return Err(AppError::unavailable(format!(
                "error writing to metrics backend: {status}"
            )));
        }
        Ok(())
    }

    async fn list_metrics(&self, selector: &TagSelector) -> ApiResult<Vec<String>> {
        let body = self
            .query(&format!("SHOW MEASUREMENTS{}", tags_where(selector)))
            .await?;

        let mut list = Vec::new();
        for row in first_series_values(&body) {
            let Some(name) = row.first().and_then(Value::as_str) else {
                continue;
            };
            if RW_METRICS.contains(&name) {
                list.push(format!("{name}_read"));
                list.push(format!("{name}_write"));
            } else {
                list.push(name.to_string());
            }
        }
        Ok(list)
    }

    async fn query_metric(
        &self,
        metric: &str,
        selector: &TagSelector,
        range: &QueryRange,
        aggregation: AggregationType,
    ) -> ApiResult<Vec<MetricValue>> {
        let q = generate_query(metric, selector, range, aggregation)?;
        debug!(query = %q, "generated metrics query");

        let body = self.query(&q).await?;

        let mut values = Vec::new();
        for row in first_series_values(&body) {
            if row.len() < 3 {
                return Err(AppError::internal(format!(
                    "unexpected row shape in metrics backend response: {row:?}"
                )));
            }
            if row[1].is_null() {
                continue;
            }
            values.push(MetricValue {
                timestamp: int_from_value(&row[0])?,
                value: int_from_value(&row[1])?,
                asset_count: if row[2].is_null() {
                    0
                } else {
                    int_from_value(&row[2])?
                },
            });
        }
        Ok(values)
    }
}
