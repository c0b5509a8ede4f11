use std::collections::BTreeMap;

use common::api::{AggregationType, TimeRange};

use crate::error::{ApiResult, AppError};

/// Tag name to accepted values. Ordered so generated queries are
/// byte-stable for identical inputs.
pub type TagSelector = BTreeMap<String, Vec<String>>;

/// Inner aggregation window, matching the agents' default reporting cadence.
const INNER_WINDOW_SECS: i64 = 60;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// A resolved query time range. Zero means "unset", mirroring the wire form.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryRange {
    pub timestamp: i64,
    pub start: i64,
    pub end: i64,
    pub resolution_secs: i64,
}

impl QueryRange {
    pub fn from_wire(range: &TimeRange) -> Self {
        Self {
            timestamp: range.timestamp,
            start: range.time_start,
            end: range.time_end,
            resolution_secs: range.resolution,
        }
    }

    fn is_point_in_time(&self) -> bool {
        self.timestamp != 0
    }
}

/// CPU usage in millicores, derived from consecutive tick deltas.
const CPU_SOURCE: &str = "(SELECT round((1-difference_time_idle/(difference_time_user+difference_time_system+difference_time_nice+difference_time_iowait+difference_time_irq+difference_time_softirq+difference_time_steal+difference_time_idle))*1000) AS usage FROM (SELECT difference(*) FROM cpu))";

fn metric_field(metric: &str) -> Option<&'static str> {
    match metric {
        "cpu" => Some("usage"),
        "mem" => Some("used"),
        "disk" => Some("used"),
        "diskio_read" => Some("read_bytes"),
        "diskio_write" => Some("write_bytes"),
        "net_read" => Some("bytes_recv"),
        "net_write" => Some("bytes_sent"),
        _ => None,
    }
}

fn metric_source(metric: &str) -> String {
    match metric {
        "cpu" => CPU_SOURCE.to_string(),
        "diskio_read" | "diskio_write" => "diskio".to_string(),
        "net_read" | "net_write" => "net".to_string(),
        other => other.to_string(),
    }
}

/// Per-asset sub-dimension that must be summed before anything else.
fn sum_tag(metric: &str) -> Option<&'static str> {
    match metric {
        "cpu" => Some("cpu"),
        "disk" => Some("device"),
        "diskio_read" | "diskio_write" => Some("name"),
        "net_read" | "net_write" => Some("interface"),
        _ => None,
    }
}

/// Counter metrics that must be converted to rates.
fn is_rate_metric(metric: &str) -> bool {
    matches!(
        metric,
        "diskio_read" | "diskio_write" | "net_read" | "net_write"
    )
}

fn group_by(window_secs: i64, tags: &[&str]) -> String {
    let mut parts = vec![format!("time({window_secs}s)")];
    for tag in tags {
        parts.push(format!("\"{tag}\""));
    }
    format!("GROUP BY {} fill(none)", parts.join(","))
}

/// Build the WHERE clause: a lower time bound is always present (the backend
/// misbehaves on difference/derivative over unbounded ranges), an upper bound
/// only when one exists, then the tag constraints.
fn where_clause(selector: &TagSelector, range: &QueryRange) -> String {
    let start_ns = range.start.max(0) * NANOS_PER_SEC;
    let mut time_parts = vec![format!("time >= {start_ns}")];

    let end = if range.is_point_in_time() {
        range.timestamp
    } else {
        range.end
    };
    if end != 0 {
        time_parts.push(format!("time <= {}", end * NANOS_PER_SEC));
    }

    let mut clauses = vec![format!("({})", time_parts.join(" AND "))];

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

    format!("WHERE {}", clauses.join(" AND "))
}

/// Generate the staged selection expression for one metric.
///
/// The pipeline always aggregates per asset at a fixed 60 s window before
/// applying the caller's window. Averaging each asset over its whole lifetime
/// first would weight assets with disjoint report spans incorrectly; per
/// window, only the assets alive in that window may contribute.
///
/// Stages, innermost first:
///   1. value extraction per `(time(60s), asset_id[, sub-dimension])`, with
///      rates via `derivative(mean(...),1s)`;
///   2. sum over the sub-dimension per `(time(60s), asset_id)`;
///   3. cross-asset aggregation per `time(60s)`, always carrying
///      `count(asset_id) AS asset_count`;
///   4. the caller's window: `last(...)` for a point in time, a `mean(...)`
///      re-window otherwise. The WHERE clause rides on the outermost stage
///      and propagates into the subqueries.
pub fn generate_query(
    metric: &str,
    selector: &TagSelector,
    range: &QueryRange,
    aggregation: AggregationType,
) -> ApiResult<String> {
    let field = metric_field(metric)
        .ok_or_else(|| AppError::invalid_argument(format!("unsupported metric {metric}")))?;
    let source = metric_source(metric);
    let subtag = sum_tag(metric);

    let value_expr = if is_rate_metric(metric) {
        format!("derivative(mean({field}),1s)")
    } else {
        format!("mean({field})")
    };

    // Stage 1: per-asset (and per-sub-dimension) value at the inner window.
    let inner_alias = if subtag.is_some() { "value" } else { "metric" };
    let inner_tags: Vec<&str> = match subtag {
        Some(tag) => vec!["asset_id", tag],
        None => vec!["asset_id"],
    };
    let mut query = format!(
        "SELECT {value_expr} AS {inner_alias}, count(asset_id) AS asset_count FROM {source} {}",
        group_by(INNER_WINDOW_SECS, &inner_tags)
    );

    // Stage 2: collapse the sub-dimension.
    if subtag.is_some() {
        query = format!(
            "SELECT sum(value) AS metric, count(asset_id) AS asset_count FROM ({query}) {}",
            group_by(INNER_WINDOW_SECS, &["asset_id"])
        );
    }

    // Stage 3: cross-asset aggregation. NONE reaches this point only for
    // single-asset selections, where an average is the identity.
    let aggr_fn = match aggregation {
        AggregationType::Sum => "sum",
        AggregationType::Avg | AggregationType::None => "mean",
    };
    let aggr_stage = format!("SELECT {aggr_fn}(metric) AS aggr_metric, count(asset_id) AS asset_count FROM ({query})");

    let where_part = where_clause(selector, range);

    // Stage 4: the caller's window.
    let query = if range.is_point_in_time() {
        let inner = format!("{aggr_stage} {}", group_by(INNER_WINDOW_SECS, &[]));
        format!(
            "SELECT last(aggr_metric) AS aggr_metric, last(asset_count) AS asset_count FROM ({inner}) {where_part}"
        )
    } else if range.resolution_secs == INNER_WINDOW_SECS {
        format!(
            "{aggr_stage} {where_part} {}",
            group_by(INNER_WINDOW_SECS, &[])
        )
    } else {
        let inner = format!("{aggr_stage} {}", group_by(INNER_WINDOW_SECS, &[]));
        let rewindow =
            "SELECT mean(aggr_metric) AS aggr_metric, mean(asset_count) AS asset_count";
        if range.resolution_secs == 0 {
            format!("{rewindow} FROM ({inner}) {where_part}")
        } else {
            format!(
                "{rewindow} FROM ({inner}) {where_part} {}",
                group_by(range.resolution_secs, &[])
            )
        }
    };

    Ok(query)
}

/// Selector restricted to asset ids, as produced by the wire `AssetSelector`.
pub fn asset_selector(asset_ids: &[String]) -> TagSelector {
    let mut selector = TagSelector::new();
    if !asset_ids.is_empty() {
        selector.insert("asset_id".to_string(), asset_ids.to_vec());
    }
    selector
}
