use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use anyhow::Context;

const DEFAULT_SSH_PORT: u16 = 22;

/// How the install session authenticates against the target host.
#[derive(Debug, Clone)]
pub enum SshAuth {
    /// Password authentication, delegated to `sshpass -e` so the secret never
    /// appears on a command line.
    Password(String),
    /// Private key in a file readable by the controller process.
    IdentityFile(PathBuf),
}

/// A remote host the installer runs commands on.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: SshAuth,
    pub connect_timeout_secs: u16,
}

#[derive(Debug)]
struct CapturedOutput {
    stdout: String,
    stderr: String,
    status: ExitStatus,
}

impl SshTarget {
    /// Build a target from `host` or `host:port` plus credentials.
    pub fn new(raw_host: &str, user: &str, auth: SshAuth) -> Self {
        let (host, port) = match raw_host.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => (host.to_string(), port),
                Err(_) => (raw_host.to_string(), DEFAULT_SSH_PORT),
            },
            None => (raw_host.to_string(), DEFAULT_SSH_PORT),
        };
        Self {
            host,
            port,
            user: user.to_string(),
            auth,
            connect_timeout_secs: 10,
        }
    }

    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn base_command(&self, program: &str) -> Command {
        match &self.auth {
            SshAuth::Password(password) => {
                // sshpass reads the password from SSHPASS with -e; host key
                // prompts would hang a server, so they are disabled for
                // password sessions (the host is operator-supplied).
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e");
                cmd.env("SSHPASS", password);
                cmd.arg(program);
                cmd.arg("-o").arg("StrictHostKeyChecking=no");
                cmd.arg("-o").arg("UserKnownHostsFile=/dev/null");
                cmd
            }
            SshAuth::IdentityFile(key) => {
                let mut cmd = Command::new(program);
                cmd.arg("-i").arg(key);
                cmd.arg("-o").arg("IdentitiesOnly=yes");
                cmd.arg("-o").arg("BatchMode=yes");
                cmd.arg("-o").arg("StrictHostKeyChecking=accept-new");
                cmd
            }
        }
    }

    fn ssh_command(&self) -> Command {
        let mut cmd = self.base_command("ssh");
        cmd.arg("-p").arg(self.port.to_string());
        cmd.arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout_secs));
        cmd.arg("-o").arg("ConnectionAttempts=1");
        cmd
    }

    /// Run a shell script remotely and return its trimmed stdout.
    ///
    /// With `sudo` the script runs under `sudo -n sh -c ...`; a password
    /// prompt from sudo is reported as a distinct error so the operator can
    /// fix the account instead of staring at a timeout.
    pub fn run(&self, sudo: bool, script: &str) -> anyhow::Result<String> {
        let mut cmd = self.ssh_command();
        cmd.arg("--");
        cmd.arg(self.destination());
        if sudo {
            cmd.arg("sudo").arg("-n");
        }
        cmd.arg("sh").arg("-c").arg(sh_quote(script));

        let output = run_capture(cmd)?;
        if output.status.success() {
            return Ok(output.stdout.trim().to_string());
        }

        if sudo && looks_like_noninteractive_sudo_failure(&output.stderr) {
            anyhow::bail!(
                "sudo requires a password on {}; configure passwordless sudo (NOPASSWD) \
for the install user.\nstderr:\n{}",
                self.destination(),
                output.stderr.trim_end()
            );
        }

        anyhow::bail!(
            "command failed on {} (status {}):\nstdout:\n{}\nstderr:\n{}",
            self.destination(),
            output.status,
            output.stdout.trim_end(),
            output.stderr.trim_end()
        );
    }

    /// Upload a local file by streaming it over an ssh session into `cat`.
    ///
    /// Avoids scp/sftp so the only remote dependency is a POSIX shell. The
    /// parent directory is created first; `sudo` applies to both steps so
    /// uploads into root-owned trees work.
    pub fn upload_file(&self, sudo: bool, local: &Path, remote: &str) -> anyhow::Result<()> {
        let local_file = fs::File::open(local)
            .with_context(|| format!("failed to open upload source {}", local.display()))?;

        let parent = match remote.rsplit_once('/') {
            Some((parent, _)) if !parent.is_empty() => parent,
            _ => ".",
        };
        let script = format!(
            "mkdir -p -- {} && cat > {}",
            sh_quote(parent),
            sh_quote(remote)
        );

        let mut cmd = self.ssh_command();
        cmd.arg("--");
        cmd.arg(self.destination());
        if sudo {
            cmd.arg("sudo").arg("-n");
        }
        cmd.arg("sh").arg("-c").arg(sh_quote(&script));
        cmd.stdin(Stdio::from(local_file));

        let output = run_capture(cmd)?;
        if output.status.success() {
            return Ok(());
        }

        anyhow::bail!(
            "failed to upload {} to {}:{} (status {}):\nstderr:\n{}",
            local.display(),
            self.destination(),
            remote,
            output.status,
            output.stderr.trim_end()
        );
    }
}

fn looks_like_noninteractive_sudo_failure(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    if !lower.contains("sudo") {
        return false;
    }
    lower.contains("a password is required")
        || lower.contains("no tty present")
        || lower.contains("a terminal is required")
        || lower.contains("askpass")
}

fn run_capture(mut cmd: Command) -> anyhow::Result<CapturedOutput> {
    let output = cmd
        .output()
        .with_context(|| format!("failed to run {:?}", cmd))?;
    Ok(CapturedOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        status: output.status,
    })
}

fn sh_quote(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push_str("'\"'\"'");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}
