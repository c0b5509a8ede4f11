use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::info;

const DEFAULT_CREDENTIALS_PATH: &str = "/etc/edge-controller/credentials.json";

/// Where the join credentials live. Overridable for tests and containers.
pub fn credentials_path() -> PathBuf {
    std::env::var("EDGE_CONTROLLER_CREDENTIALS")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CREDENTIALS_PATH))
}

/// VPN account material issued at controller join time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnCredentials {
    pub username: String,
    pub password: String,
    pub hostname: String,
}

/// Everything the controller needs to talk to the central platform,
/// persisted after a successful join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub organization_id: String,
    pub edge_controller_id: String,
    /// Base URL of the edge-inventory proxy, reachable over the VPN.
    pub proxy_url: String,
    pub vpn: VpnCredentials,
    /// CA certificate (PEM) anchoring outbound TLS.
    pub cacert: String,
    /// Per-controller certificate (PEM).
    pub certificate: String,
    /// Private key (PEM) for the controller certificate.
    pub private_key: String,
}

pub fn load_credentials(path: &Path) -> anyhow::Result<Credentials> {
    info!(path = %path.display(), "loading credentials");
    let raw = fs::read_to_string(path)
        .with_context(|| format!("cannot read credentials file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("cannot decode credentials file {}", path.display()))
}

pub fn save_credentials(path: &Path, credentials: &Credentials) -> anyhow::Result<()> {
    info!(path = %path.display(), "saving credentials");
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("cannot create credentials directory {}", parent.display()))?;
    }
    let raw = serde_json::to_string_pretty(credentials)?;
    fs::write(path, raw)
        .with_context(|| format!("cannot write credentials file {}", path.display()))
}

pub fn remove_credentials(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        fs::remove_file(path)
            .with_context(|| format!("cannot remove credentials file {}", path.display()))?;
    }
    Ok(())
}

/// The bootstrap token file handed to operators when registering a new
/// edge controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinTokenFile {
    pub organization_id: String,
    pub token: String,
    pub cacert: String,
    pub join_url: String,
    #[serde(default)]
    pub dns_url: String,
}

pub fn load_join_token_file(path: &Path) -> anyhow::Result<JoinTokenFile> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("cannot read join token file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("cannot decode join token file {}", path.display()))
}
