use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use figment::providers::{Format, Yaml};
use figment::Figment;
use serde::Deserialize;

use crate::metrics::parse_duration_secs;

/// Edge controller in charge of managing a set of agents.
#[derive(Debug, Parser)]
#[command(name = "edge-controller", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Launch the edge controller API.
    Run(RunArgs),
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Optional YAML configuration overlay.
    #[arg(long, default_value = "config.yaml")]
    pub config_file: PathBuf,

    /// Port for management cluster communications.
    #[arg(long, default_value_t = 5577)]
    pub port: u16,

    /// Port for agent messages.
    #[arg(long, default_value_t = 5588)]
    pub agent_port: u16,

    /// Notification period to the management cluster.
    #[arg(long, default_value = "30s")]
    pub notify_period: String,

    /// Alive ping period to the management cluster.
    #[arg(long, default_value = "5m")]
    pub alive_period: String,

    /// Use in-memory providers.
    #[arg(long)]
    pub use_in_memory_providers: bool,

    /// Use durable file-backed providers.
    #[arg(long)]
    pub use_durable_providers: bool,

    /// Store file path, required with durable providers.
    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// Bootstrap join token file.
    #[arg(long)]
    pub join_token_path: Option<PathBuf>,

    /// Port of the central join endpoint.
    #[arg(long, default_value_t = 443)]
    pub eic_api_port: u16,

    /// Edge controller display name.
    #[arg(long, default_value = "")]
    pub name: String,

    /// Edge controller labels as k1:v1,k2:v2.
    #[arg(long, default_value = "")]
    pub labels: String,

    /// Edge controller geolocation.
    #[arg(long, default_value = "")]
    pub geolocation: String,

    /// Base path containing <os>_<arch>/service-net-agent binaries.
    #[arg(long, default_value = "/opt/agents")]
    pub agent_binary_path: PathBuf,

    /// Debug logging and the OpenAPI document route.
    #[arg(long)]
    pub debug: bool,

    /// Plugin option as key=value, e.g. influxdb.address=http://influx:8086.
    #[arg(long = "plugin-opt", value_name = "KEY=VALUE")]
    pub plugin_opt: Vec<String>,
}

/// Values the YAML overlay may set; anything present overrides the flags,
/// matching the original file-over-flag semantics.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileOverlay {
    port: Option<u16>,
    #[serde(rename = "agentPort")]
    agent_port: Option<u16>,
    #[serde(rename = "notifyPeriod")]
    notify_period: Option<String>,
    #[serde(rename = "alivePeriod")]
    alive_period: Option<String>,
    #[serde(rename = "useInMemoryProviders")]
    use_in_memory_providers: Option<bool>,
    #[serde(rename = "useDurableProviders")]
    use_durable_providers: Option<bool>,
    #[serde(rename = "dbPath")]
    db_path: Option<PathBuf>,
    #[serde(rename = "joinTokenPath")]
    join_token_path: Option<PathBuf>,
    #[serde(rename = "eicApiPort")]
    eic_api_port: Option<u16>,
    name: Option<String>,
    labels: Option<String>,
    geolocation: Option<String>,
    #[serde(rename = "agentBinaryPath")]
    agent_binary_path: Option<PathBuf>,
    plugins: Option<HashMap<String, String>>,
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub agent_port: u16,
    pub notify_period: Duration,
    pub alive_period: Duration,
    pub use_in_memory_providers: bool,
    pub use_durable_providers: bool,
    pub db_path: Option<PathBuf>,
    pub join_token_path: Option<PathBuf>,
    pub eic_api_port: u16,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub geolocation: String,
    pub agent_binary_path: PathBuf,
    pub debug: bool,
    pub plugin_options: HashMap<String, String>,
}

impl AppConfig {
    /// Merge flags with the optional YAML overlay and validate the result.
    pub fn resolve(args: RunArgs) -> anyhow::Result<Self> {
        let overlay = if args.config_file.exists() {
            Figment::new()
                .merge(Yaml::file(&args.config_file))
                .extract::<FileOverlay>()
                .map_err(|err| {
                    anyhow::anyhow!(
                        "cannot read config file {}: {err}",
                        args.config_file.display()
                    )
                })?
        } else {
            FileOverlay::default()
        };

        let notify_period = overlay.notify_period.unwrap_or(args.notify_period);
        let alive_period = overlay.alive_period.unwrap_or(args.alive_period);

        let mut plugin_options = HashMap::new();
        if let Some(from_file) = overlay.plugins {
            plugin_options.extend(from_file);
        }
        for entry in &args.plugin_opt {
            let (key, value) = entry.split_once('=').ok_or_else(|| {
                anyhow::anyhow!("invalid plugin option {entry:?}; expected key=value")
            })?;
            plugin_options.insert(key.to_string(), value.to_string());
        }

        let config = Self {
            port: overlay.port.unwrap_or(args.port),
            agent_port: overlay.agent_port.unwrap_or(args.agent_port),
            notify_period: duration_flag(&notify_period)?,
            alive_period: duration_flag(&alive_period)?,
            use_in_memory_providers: overlay
                .use_in_memory_providers
                .unwrap_or(args.use_in_memory_providers),
            use_durable_providers: overlay
                .use_durable_providers
                .unwrap_or(args.use_durable_providers),
            db_path: overlay.db_path.or(args.db_path),
            join_token_path: overlay.join_token_path.or(args.join_token_path),
            eic_api_port: overlay.eic_api_port.unwrap_or(args.eic_api_port),
            name: overlay.name.unwrap_or(args.name),
            labels: parse_labels(&overlay.labels.unwrap_or(args.labels))?,
            geolocation: overlay.geolocation.unwrap_or(args.geolocation),
            agent_binary_path: overlay.agent_binary_path.unwrap_or(args.agent_binary_path),
            debug: args.debug,
            plugin_options,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("name cannot be empty");
        }
        if self.use_in_memory_providers == self.use_durable_providers {
            anyhow::bail!(
                "exactly one of --use-in-memory-providers and --use-durable-providers must be set"
            );
        }
        if self.use_durable_providers && self.db_path.is_none() {
            anyhow::bail!("--db-path is required with durable providers");
        }
        Ok(())
    }
}

fn duration_flag(raw: &str) -> anyhow::Result<Duration> {
    let secs = parse_duration_secs(raw)
        .map_err(|err| anyhow::anyhow!("invalid duration {raw:?}: {}", err.message))?;
    Ok(Duration::from_secs(secs as u64))
}

/// Parse `k1:v1,k2:v2` into a label map.
fn parse_labels(raw: &str) -> anyhow::Result<HashMap<String, String>> {
    let mut labels = HashMap::new();
    if raw.is_empty() {
        return Ok(labels);
    }
    for pair in raw.split(',') {
        let (key, value) = pair
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("invalid labels format: {raw:?}"))?;
        labels.insert(key.to_string(), value.to_string());
    }
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn base_args() -> RunArgs {
        RunArgs {
            config_file: PathBuf::from("/nonexistent/config.yaml"),
            port: 5577,
            agent_port: 5588,
            notify_period: "30s".into(),
            alive_period: "5m".into(),
            use_in_memory_providers: true,
            use_durable_providers: false,
            db_path: None,
            join_token_path: None,
            eic_api_port: 443,
            name: "edge-1".into(),
            labels: String::new(),
            geolocation: String::new(),
            agent_binary_path: PathBuf::from("/opt/agents"),
            debug: false,
            plugin_opt: Vec::new(),
        }
    }

    #[test]
    fn defaults_resolve() {
        let config = AppConfig::resolve(base_args()).expect("resolve");
        assert_eq!(config.port, 5577);
        assert_eq!(config.agent_port, 5588);
        assert_eq!(config.notify_period, Duration::from_secs(30));
        assert_eq!(config.alive_period, Duration::from_secs(300));
        assert!(config.labels.is_empty());
    }

    #[test]
    fn file_overlay_overrides_flags() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "agentPort: 6699\nnotifyPeriod: 10s\nplugins:\n  influxdb.database: edge\n",
        )
        .expect("write");

        let mut args = base_args();
        args.config_file = path;
        let config = AppConfig::resolve(args).expect("resolve");

        assert_eq!(config.agent_port, 6699);
        assert_eq!(config.notify_period, Duration::from_secs(10));
        assert_eq!(
            config.plugin_options.get("influxdb.database").map(String::as_str),
            Some("edge")
        );
    }

    #[test]
    fn cli_plugin_options_override_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        fs::write(&path, "plugins:\n  influxdb.database: from-file\n").expect("write");

        let mut args = base_args();
        args.config_file = path;
        args.plugin_opt = vec!["influxdb.database=from-cli".into()];
        let config = AppConfig::resolve(args).expect("resolve");

        assert_eq!(
            config.plugin_options.get("influxdb.database").map(String::as_str),
            Some("from-cli")
        );
    }

    #[test]
    fn labels_parse_and_reject_garbage() {
        let mut args = base_args();
        args.labels = "site:berlin,rack:b2".into();
        let config = AppConfig::resolve(args).expect("resolve");
        assert_eq!(config.labels.get("site").map(String::as_str), Some("berlin"));
        assert_eq!(config.labels.get("rack").map(String::as_str), Some("b2"));

        let mut args = base_args();
        args.labels = "nonsense".into();
        assert!(AppConfig::resolve(args).is_err());
    }

    #[test]
    fn provider_flags_are_mutually_exclusive_and_required() {
        let mut args = base_args();
        args.use_in_memory_providers = false;
        assert!(AppConfig::resolve(args).is_err());

        let mut args = base_args();
        args.use_in_memory_providers = true;
        args.use_durable_providers = true;
        assert!(AppConfig::resolve(args).is_err());

        let mut args = base_args();
        args.use_in_memory_providers = false;
        args.use_durable_providers = true;
        assert!(AppConfig::resolve(args.clone()).is_err());
        args.db_path = Some(PathBuf::from("/tmp/edge.db"));
        assert!(AppConfig::resolve(args).is_ok());
    }

    #[test]
    fn name_is_required() {
        let mut args = base_args();
        args.name = String::new();
        assert!(AppConfig::resolve(args).is_err());
    }
}
