use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tracing::info;

use crate::config::AppConfig;
use crate::credentials::{self, Credentials};

const JOIN_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
struct EicJoinRequest<'a> {
    organization_id: &'a str,
    token: &'a str,
    name: &'a str,
    labels: &'a HashMap<String, String>,
    geolocation: &'a str,
}

/// Load the controller's credentials, joining the central platform first
/// when this is a fresh install.
///
/// A fresh join needs the operator-provided join token file; the central
/// join endpoint answers with the full credential set (identity, VPN
/// account, certificates), which is persisted for every later boot. The VPN
/// tunnel bring-up itself is handled by the host scripts shipped alongside
/// the controller.
pub async fn ensure_credentials(
    config: &AppConfig,
    credentials_path: &Path,
) -> anyhow::Result<Credentials> {
    if credentials_path.exists() {
        return credentials::load_credentials(credentials_path);
    }

    let token_path = config
        .join_token_path
        .as_ref()
        .context("no stored credentials and no --join-token-path to bootstrap from")?;
    let token_file = credentials::load_join_token_file(token_path)?;

    info!(join_url = %token_file.join_url, "joining the central platform");

    let base = if token_file.join_url.starts_with("http://")
        || token_file.join_url.starts_with("https://")
    {
        token_file.join_url.trim_end_matches('/').to_string()
    } else {
        format!("https://{}:{}", token_file.join_url, config.eic_api_port)
    };

    let mut builder = reqwest::Client::builder().timeout(JOIN_TIMEOUT);
    if !token_file.cacert.is_empty() {
        let cert = reqwest::Certificate::from_pem(token_file.cacert.as_bytes())
            .context("join token file carries an invalid CA certificate")?;
        builder = builder.add_root_certificate(cert);
    }
    let client = builder.build()?;

    let request = EicJoinRequest {
        organization_id: &token_file.organization_id,
        token: &token_file.token,
        name: &config.name,
        labels: &config.labels,
        geolocation: &config.geolocation,
    };
    let response = client
        .post(format!("{base}/api/v1/eic/join"))
        .json(&request)
        .send()
        .await
        .context("cannot reach the central join endpoint")?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("central join endpoint returned {status}: {body}");
    }

    let creds: Credentials = response
        .json()
        .await
        .context("unexpected join response shape")?;

    credentials::save_credentials(credentials_path, &creds)?;
    info!(
        organization_id = %creds.organization_id,
        edge_controller_id = %creds.edge_controller_id,
        "edge controller joined"
    );
    Ok(creds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, RunArgs};
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use std::fs;
    use tempfile::tempdir;

    fn config_with_token_path(path: std::path::PathBuf) -> AppConfig {
        let args = RunArgs {
            config_file: std::path::PathBuf::from("/nonexistent/config.yaml"),
            port: 5577,
            agent_port: 5588,
            notify_period: "30s".into(),
            alive_period: "5m".into(),
            use_in_memory_providers: true,
            use_durable_providers: false,
            db_path: None,
            join_token_path: Some(path),
            eic_api_port: 443,
            name: "edge-1".into(),
            labels: String::new(),
            geolocation: String::new(),
            agent_binary_path: std::path::PathBuf::from("/opt/agents"),
            debug: false,
            plugin_opt: Vec::new(),
        };
        AppConfig::resolve(args).expect("config")
    }

    fn credentials_json(server_url: &str) -> serde_json::Value {
        serde_json::json!({
            "organization_id": "org",
            "edge_controller_id": "ec-77",
            "proxy_url": server_url,
            "vpn": {"username": "ec-vpn", "password": "pw", "hostname": "vpn.internal"},
            "cacert": "",
            "certificate": "",
            "private_key": "",
        })
    }

    #[tokio::test]
    async fn fresh_install_joins_and_persists_credentials() {
        let server = MockServer::start();
        let join = server.mock(|when, then| {
            when.method(POST)
                .path("/api/v1/eic/join")
                .json_body_partial(r#"{"token": "jt-1", "name": "edge-1"}"#);
            then.status(200).json_body(credentials_json(&server.url("")));
        });

        let dir = tempdir().expect("tempdir");
        let token_path = dir.path().join("token.json");
        fs::write(
            &token_path,
            serde_json::json!({
                "organization_id": "org",
                "token": "jt-1",
                "cacert": "",
                "join_url": server.url(""),
                "dns_url": "",
            })
            .to_string(),
        )
        .expect("write token");

        let credentials_path = dir.path().join("credentials.json");
        let config = config_with_token_path(token_path);

        let creds = ensure_credentials(&config, &credentials_path)
            .await
            .expect("join");
        join.assert();
        assert_eq!(creds.edge_controller_id, "ec-77");
        assert!(credentials_path.exists());

        // Second boot loads from disk without calling the join endpoint.
        let again = ensure_credentials(&config, &credentials_path)
            .await
            .expect("reload");
        assert_eq!(again.edge_controller_id, "ec-77");
        assert_eq!(join.hits(), 1);
    }

    #[tokio::test]
    async fn missing_token_file_is_a_configuration_error() {
        let dir = tempdir().expect("tempdir");
        let mut config = config_with_token_path(dir.path().join("absent.json"));
        config.join_token_path = None;

        let err = ensure_credentials(&config, &dir.path().join("credentials.json"))
            .await
            .expect_err("no bootstrap path");
        assert!(err.to_string().contains("join-token-path"));
    }
}
