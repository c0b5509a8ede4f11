use metrics::counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the process-wide Prometheus recorder. Falls back to the already
/// installed handle when called twice (tests boot several controllers).
pub fn init_metrics_recorder() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();
    match builder.install_recorder() {
        Ok(handle) => handle,
        Err(_) => PrometheusBuilder::new()
            .build_recorder()
            .handle(),
    }
}

pub fn record_agent_check() {
    counter!("edge_controller_agent_checks_total").increment(1);
}

pub fn record_agent_join() {
    counter!("edge_controller_agent_joins_total").increment(1);
}

pub fn record_operation_triggered() {
    counter!("edge_controller_operations_triggered_total").increment(1);
}

pub fn record_install_started() {
    counter!("edge_controller_installs_started_total").increment(1);
}
