//! Full process wiring: boot from stored credentials, serve, shut down
//! cleanly.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use httpmock::Method::{GET, POST};
use httpmock::MockServer;
use serde_json::json;

use edge_controller::config::{AppConfig, RunArgs};

fn run_args(plugin_opt: Vec<String>) -> RunArgs {
    RunArgs {
        config_file: PathBuf::from("/nonexistent/config.yaml"),
        // Ephemeral ports; the test only drives the lifecycle.
        port: 0,
        agent_port: 0,
        notify_period: "30s".into(),
        alive_period: "5m".into(),
        use_in_memory_providers: true,
        use_durable_providers: false,
        db_path: None,
        join_token_path: None,
        eic_api_port: 443,
        name: "edge-boot-test".into(),
        labels: String::new(),
        geolocation: String::new(),
        agent_binary_path: PathBuf::from("/opt/agents"),
        debug: false,
        plugin_opt,
    }
}

#[tokio::test]
async fn controller_boots_and_shuts_down_cleanly() {
    let central = MockServer::start();
    central.mock(|when, then| {
        when.method(POST).path("/api/v1/inventory/eic/start");
        then.status(200);
    });
    central.mock(|when, then| {
        when.method(GET)
            .path("/query")
            .query_param("q", "SHOW DATABASES");
        then.status(200).json_body(json!({
            "results": [{"series": [{"name": "databases", "columns": ["name"], "values": [["metrics"]]}]}]
        }));
    });
    central.mock(|when, then| {
        when.method(GET).path("/query");
        then.status(200).json_body(json!({"results": [{}]}));
    });

    let dir = tempfile::tempdir().expect("tempdir");
    let credentials_path = dir.path().join("credentials.json");
    fs::write(
        &credentials_path,
        json!({
            "organization_id": "org",
            "edge_controller_id": "ec-boot",
            "proxy_url": central.url(""),
            "vpn": {"username": "ec-vpn", "password": "pw", "hostname": "vpn.internal"},
            "cacert": "",
            "certificate": "",
            "private_key": "",
        })
        .to_string(),
    )
    .expect("write credentials");
    // SAFETY: this test is the only consumer of the variable in this binary.
    unsafe {
        std::env::set_var("EDGE_CONTROLLER_CREDENTIALS", &credentials_path);
    }

    let config = AppConfig::resolve(run_args(vec![format!(
        "influxdb.address={}",
        central.url("")
    )]))
    .expect("config");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(edge_controller::run_with_shutdown(config, async move {
        let _ = shutdown_rx.await;
    }));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!server.is_finished(), "controller exited prematurely");

    shutdown_tx.send(()).expect("signal shutdown");
    let result = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("shutdown within deadline")
        .expect("join");
    result.expect("clean shutdown");
}
