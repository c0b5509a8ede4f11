use tokio::process::Command;
use tracing::{info, warn};

/// The host VPN client CLI. Bring-up and teardown of the tunnel itself are
/// host-OS scripts; the controller only drives the account lifecycle.
const VPN_CLIENT_CMD: &str = "/usr/bin/vpnclient/vpncmd";
const VPN_CLIENT_ADDRESS: &str = "localhost";

async fn run_vpn_command(args: &[&str]) -> anyhow::Result<()> {
    let output = Command::new(VPN_CLIENT_CMD)
        .arg("/Client")
        .arg(VPN_CLIENT_ADDRESS)
        .arg("/cmd")
        .args(args)
        .output()
        .await?;
    if !output.status.success() {
        anyhow::bail!(
            "vpn command {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr).trim_end()
        );
    }
    Ok(())
}

/// Disconnect and delete the controller's VPN account. Best effort: unlink
/// proceeds even when the local VPN client is already gone.
pub async fn teardown_account(username: &str) {
    info!(username, "tearing down vpn account");

    if let Err(err) = run_vpn_command(&["AccountDisconnect", username]).await {
        warn!(%err, "error disconnecting vpn account");
    }
    if let Err(err) = run_vpn_command(&["AccountDelete", username]).await {
        warn!(%err, "error deleting vpn account");
    }
}
