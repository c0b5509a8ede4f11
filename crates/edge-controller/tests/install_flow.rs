//! Drives the whole install orchestration against a fake `ssh` binary on
//! PATH, the way a provisioning run looks from the controller's side.

use std::fs;
use std::path::{Path, PathBuf};

use httpmock::MockServer;

use common::api::{AgentType, InstallAgentRequest, OpStatus, SshCredentials};
use edge_controller::notifier::Notifier;
use edge_controller::persistence::{responses, store};
use edge_controller::proxy::CentralProxyClient;
use edge_controller::services::install::AgentInstaller;

#[cfg(unix)]
fn make_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("set perms");
}

/// Fake ssh/sshpass: swallow stdin, log the invocation, answer `env` probes
/// with an SSH_CLIENT line.
fn write_fake_ssh(dir: &Path) {
    let script = "\
#!/bin/sh\n\
cat >/dev/null\n\
echo \"$@\" >> \"$FAKE_SSH_LOG\"\n\
case \"$*\" in\n\
  *\"'env'\"*) printf 'LANG=C\\nSSH_CLIENT=172.16.0.9 53122 22\\nHOME=/root\\n' ;;\n\
  *) printf 'ok\\n' ;;\n\
esac\n\
exit 0\n";
    for name in ["ssh", "sshpass"] {
        let path = dir.join(name);
        fs::write(&path, script).expect("write fake binary");
        make_executable(&path);
    }
}

#[tokio::test]
async fn install_sequence_reports_progress_and_success() {
    let fake_dir = tempfile::tempdir().expect("fake bin dir");
    write_fake_ssh(fake_dir.path());
    let log_path = fake_dir.path().join("invocations.log");
    fs::write(&log_path, "").expect("seed log");

    let binaries = tempfile::tempdir().expect("binary dir");
    let flavor_dir = binaries.path().join("linux_amd64");
    fs::create_dir_all(&flavor_dir).expect("flavor dir");
    fs::write(flavor_dir.join("service-net-agent"), "#!/bin/sh\n").expect("agent binary");

    // SAFETY: this test is the only one in this binary touching the
    // environment.
    unsafe {
        let old_path = std::env::var("PATH").unwrap_or_default();
        std::env::set_var("PATH", format!("{}:{old_path}", fake_dir.path().display()));
        std::env::set_var("FAKE_SSH_LOG", &log_path);
    }

    let central = MockServer::start();
    let db = store::open_in_memory().await.expect("open store");
    let proxy = CentralProxyClient::new(&central.url(""), None).expect("proxy");
    let notifier = Notifier::new(db.clone(), proxy, "org", "ec");
    let installer = AgentInstaller::new(
        notifier,
        PathBuf::from(binaries.path()),
        5588,
    );

    installer
        .install(
            "op-install-1".into(),
            "join-token-1".into(),
            InstallAgentRequest {
                organization_id: "org".into(),
                edge_controller_id: "ec".into(),
                target_host: "asset-1.local".into(),
                credentials: SshCredentials {
                    username: "ops".into(),
                    password: Some("secret".into()),
                    client_certificate: None,
                    is_sudoer: true,
                },
                agent_type: AgentType::LinuxAmd64,
                ca_cert: "-----BEGIN CERTIFICATE-----\n-----END CERTIFICATE-----\n".into(),
            },
        )
        .await;

    // Progress updates share the operation id, so between drains the buffer
    // holds the latest state only; after a full run that is the SUCCESS.
    let updates = responses::get_pending_ec_op_responses(&db, false)
        .await
        .expect("progress updates");
    assert_eq!(updates.len(), 1, "updates: {updates:#?}");
    assert_eq!(updates[0].operation_id, "op-install-1");
    assert_eq!(updates[0].status, OpStatus::Success);
    assert!(updates[0].info.contains("Agent has been installed"));

    let log = fs::read_to_string(&log_path).expect("read log");
    assert!(
        log.contains("join --token=join-token-1 --address=172.16.0.9:5588 --cert=/opt/nalej/certs/cacert.pem"),
        "join command missing from:\n{log}"
    );
    assert!(log.contains("sudo"), "sudo prefix missing from:\n{log}");
    assert!(
        log.contains("service-net-agent install"),
        "install step missing from:\n{log}"
    );
    assert!(
        log.contains("service-net-agent start"),
        "start step missing from:\n{log}"
    );
}
