use std::path::PathBuf;
use std::time::Instant;

use chrono::Utc;
use installer::{SshAuth, SshTarget};
use tracing::{debug, info, warn};

use common::api::{AgentType, EdgeControllerOpResponse, InstallAgentRequest, OpStatus};

use crate::error::{ApiResult, AppError};
use crate::notifier::Notifier;

const AGENT_BINARY: &str = "service-net-agent";
const REMOTE_BINARY_PATH: &str = "service-net-agent";
const CA_CERT_TARGET_PATH: &str = "/opt/nalej/certs/cacert.pem";
const INSTALL_CMD: &str = "./service-net-agent install";
const START_CMD: &str = "/opt/nalej/bin/service-net-agent start";

/// Drives the out-of-band SSH install sequence for one agent.
///
/// Progress is reported exclusively through durable EC op-responses: the
/// triggering RPC already answered `INPROGRESS`, so errors here never become
/// RPC errors and every update survives a WAN outage.
#[derive(Clone)]
pub struct AgentInstaller {
    notifier: Notifier,
    agent_binary_path: PathBuf,
    agent_port: u16,
}

impl AgentInstaller {
    pub fn new(notifier: Notifier, agent_binary_path: PathBuf, agent_port: u16) -> Self {
        Self {
            notifier,
            agent_binary_path,
            agent_port,
        }
    }

    /// Locate the local agent binary for the requested flavor.
    fn agent_binary(&self, agent_type: AgentType) -> ApiResult<PathBuf> {
        match agent_type {
            AgentType::WindowsAmd64 | AgentType::DarwinAmd64 => {
                return Err(AppError::unimplemented(format!(
                    "automatic install is not supported for {}",
                    agent_type.as_str()
                )));
            }
            AgentType::LinuxAmd64 | AgentType::LinuxArm64 | AgentType::LinuxArm32 => {}
        }

        let path = self
            .agent_binary_path
            .join(agent_type.as_str())
            .join(AGENT_BINARY);
        if !path.is_file() {
            return Err(AppError::internal(format!(
                "agent binary is not accessible at {}",
                path.display()
            )));
        }
        Ok(path)
    }

    async fn notify(&self, operation_id: &str, request: &InstallAgentRequest, status: OpStatus, info: String) {
        let update = EdgeControllerOpResponse {
            organization_id: request.organization_id.clone(),
            edge_controller_id: request.edge_controller_id.clone(),
            operation_id: operation_id.to_string(),
            timestamp: Utc::now().timestamp(),
            status,
            info,
        };
        debug!(operation_id, status = status.as_str(), "sending install progress update");
        if let Err(err) = self.notifier.notify_ec_op_response(&update).await {
            warn!(operation_id, %err, "notify install progress failed");
        }
    }

    /// Run the scripted install. Intended to be spawned; the caller has
    /// already responded to the central platform.
    pub async fn install(self, operation_id: String, join_token: String, request: InstallAgentRequest) {
        debug!(target_host = %request.target_host, "triggering agent install");
        let started = Instant::now();

        let binary = match self.agent_binary(request.agent_type) {
            Ok(binary) => binary,
            Err(err) => {
                self.notify(&operation_id, &request, OpStatus::Fail, err.message.clone())
                    .await;
                return;
            }
        };

        let identity_file = match write_identity_file(&operation_id, &request) {
            Ok(identity_file) => identity_file,
            Err(err) => {
                self.notify(&operation_id, &request, OpStatus::Fail, err.to_string())
                    .await;
                return;
            }
        };

        let auth = match (&identity_file, &request.credentials.password) {
            (Some(path), _) => SshAuth::IdentityFile(path.clone()),
            (None, Some(password)) => SshAuth::Password(password.clone()),
            (None, None) => {
                self.notify(
                    &operation_id,
                    &request,
                    OpStatus::Fail,
                    "credentials must carry a password or a client certificate".to_string(),
                )
                .await;
                return;
            }
        };
        let target = SshTarget::new(&request.target_host, &request.credentials.username, auth);
        let sudo = request.credentials.is_sudoer;

        let outcome = self
            .run_sequence(&operation_id, &request, &target, sudo, &binary, &join_token)
            .await;

        if let Some(path) = identity_file {
            let _ = std::fs::remove_file(path);
        }

        if outcome.is_ok() {
            info!(target_host = %request.target_host, "agent has been installed");
            self.notify(
                &operation_id,
                &request,
                OpStatus::Success,
                format!("Agent has been installed, took {:.1?}", started.elapsed()),
            )
            .await;
        }
    }

    /// The install steps proper. The first failing step reports `FAIL` and
    /// aborts the sequence.
    async fn run_sequence(
        &self,
        operation_id: &str,
        request: &InstallAgentRequest,
        target: &SshTarget,
        sudo: bool,
        binary: &PathBuf,
        join_token: &str,
    ) -> Result<(), ()> {
        // The controller's address as the asset sees it comes from the SSH
        // session itself.
        let env_output = self.step(operation_id, request, run_remote(target, false, "env"), None).await?;
        let controller_ip = match controller_ip_from_env(&env_output) {
            Some(ip) => ip,
            None => {
                self.notify(
                    operation_id,
                    request,
                    OpStatus::Fail,
                    "cannot find SSH_CLIENT in remote environment".to_string(),
                )
                .await;
                return Err(());
            }
        };
        debug!(ip = %controller_ip, "edge controller address as seen by the asset");

        let copy_started = Instant::now();
        self.step(
            operation_id,
            request,
            upload_remote(target, sudo, binary.clone(), REMOTE_BINARY_PATH),
            Some(format!("agent binary copied in {:.1?}", copy_started.elapsed())),
        )
        .await?;

        let ca_started = Instant::now();
        let ca_file = std::env::temp_dir().join(format!("ec-cacert-{operation_id}.pem"));
        if let Err(err) = std::fs::write(&ca_file, &request.ca_cert) {
            self.notify(
                operation_id,
                request,
                OpStatus::Fail,
                format!("cannot write CA cert to temp file: {err}"),
            )
            .await;
            return Err(());
        }
        let upload = self
            .step(
                operation_id,
                request,
                upload_remote(target, sudo, ca_file.clone(), CA_CERT_TARGET_PATH),
                Some(format!("CA cert copied in {:.1?}", ca_started.elapsed())),
            )
            .await;
        let _ = std::fs::remove_file(&ca_file);
        upload?;

        for command in [
            format!("chmod +x {REMOTE_BINARY_PATH}"),
            INSTALL_CMD.to_string(),
            format!(
                "/opt/nalej/bin/{AGENT_BINARY} join --token={join_token} --address={controller_ip}:{} --cert={CA_CERT_TARGET_PATH}",
                self.agent_port
            ),
            START_CMD.to_string(),
        ] {
            self.step(operation_id, request, run_remote(target, sudo, &command), None)
                .await?;
        }

        Ok(())
    }

    /// Run one step: success emits `INPROGRESS` with the step output (or the
    /// given message), failure emits `FAIL` and stops the caller.
    async fn step(
        &self,
        operation_id: &str,
        request: &InstallAgentRequest,
        work: impl std::future::Future<Output = anyhow::Result<String>>,
        success_info: Option<String>,
    ) -> Result<String, ()> {
        match work.await {
            Ok(output) => {
                let info = success_info.unwrap_or_else(|| output.clone());
                self.notify(operation_id, request, OpStatus::Inprogress, info).await;
                Ok(output)
            }
            Err(err) => {
                self.notify(operation_id, request, OpStatus::Fail, err.to_string()).await;
                Err(())
            }
        }
    }
}

async fn run_remote(target: &SshTarget, sudo: bool, command: &str) -> anyhow::Result<String> {
    let target = target.clone();
    let command = command.to_string();
    tokio::task::spawn_blocking(move || target.run(sudo, &command))
        .await
        .map_err(|err| anyhow::anyhow!("ssh task panicked: {err}"))?
}

async fn upload_remote(
    target: &SshTarget,
    sudo: bool,
    local: PathBuf,
    remote: &'static str,
) -> anyhow::Result<String> {
    let target = target.clone();
    tokio::task::spawn_blocking(move || {
        target.upload_file(sudo, &local, remote).map(|_| String::new())
    })
        .await
        .map_err(|err| anyhow::anyhow!("ssh task panicked: {err}"))?
}

/// Write the PEM identity to a private temp file when the request carries
/// certificate credentials.
fn write_identity_file(
    operation_id: &str,
    request: &InstallAgentRequest,
) -> anyhow::Result<Option<PathBuf>> {
    let Some(pem) = &request.credentials.client_certificate else {
        return Ok(None);
    };

    let path = std::env::temp_dir().join(format!("ec-identity-{operation_id}"));
    std::fs::write(&path, pem)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(Some(path))
}

fn controller_ip_from_env(env_output: &str) -> Option<String> {
    let line = env_output
        .lines()
        .find(|line| line.starts_with("SSH_CLIENT="))?;
    line.trim_start_matches("SSH_CLIENT=")
        .split_whitespace()
        .next()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{responses, store};
    use crate::proxy::CentralProxyClient;
    use common::api::SshCredentials;
    use httpmock::MockServer;

    fn install_request(agent_type: AgentType) -> InstallAgentRequest {
        InstallAgentRequest {
            organization_id: "org".into(),
            edge_controller_id: "ec".into(),
            target_host: "asset-1.local".into(),
            credentials: SshCredentials {
                username: "ops".into(),
                password: Some("secret".into()),
                client_certificate: None,
                is_sudoer: false,
            },
            agent_type,
            ca_cert: "-----BEGIN CERTIFICATE-----".into(),
        }
    }

    async fn installer_with(server: &MockServer, binary_path: PathBuf) -> (AgentInstaller, crate::persistence::Db) {
        let db = store::open_in_memory().await.expect("open store");
        let proxy = CentralProxyClient::new(&server.url(""), None).expect("client");
        let notifier = Notifier::new(db.clone(), proxy, "org", "ec");
        (AgentInstaller::new(notifier, binary_path, 5588), db)
    }

    #[test]
    fn controller_ip_is_parsed_from_ssh_client() {
        let env = "LANG=C\nSSH_CLIENT=172.16.17.93 53122 22\nHOME=/root\n";
        assert_eq!(
            controller_ip_from_env(env).as_deref(),
            Some("172.16.17.93")
        );
        assert!(controller_ip_from_env("HOME=/root\n").is_none());
    }

    #[tokio::test]
    async fn unsupported_agent_type_fails_durably() {
        let server = MockServer::start();
        let (installer, db) = installer_with(&server, PathBuf::from("/nonexistent")).await;

        installer
            .install(
                "op-1".into(),
                "join-token".into(),
                install_request(AgentType::WindowsAmd64),
            )
            .await;

        let pending = responses::get_pending_ec_op_responses(&db, false)
            .await
            .expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, OpStatus::Fail);
        assert!(pending[0].info.contains("not supported"));
    }

    #[tokio::test]
    async fn missing_binary_fails_durably() {
        let server = MockServer::start();
        let (installer, db) = installer_with(&server, PathBuf::from("/nonexistent")).await;

        installer
            .install(
                "op-2".into(),
                "join-token".into(),
                install_request(AgentType::LinuxAmd64),
            )
            .await;

        let pending = responses::get_pending_ec_op_responses(&db, false)
            .await
            .expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, OpStatus::Fail);
        assert!(pending[0].info.contains("not accessible"));
    }
}
