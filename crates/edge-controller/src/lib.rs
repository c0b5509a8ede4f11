pub mod app_state;
pub mod auth;
pub mod bootstrap;
pub mod config;
pub mod credentials;
pub mod error;
pub mod http;
pub mod metrics;
pub mod notifier;
pub mod persistence;
pub mod plugins;
pub mod proxy;
pub mod services;
pub mod tasks;
pub mod telemetry;
pub mod tokens;
pub mod vpn;

pub type Result<T> = std::result::Result<T, anyhow::Error>;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use common::api::EicId;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::app_state::AppState;
use crate::config::AppConfig;
use crate::notifier::Notifier;
use crate::persistence::store;
use crate::plugins::metrics::MetricsPlugin;
use crate::plugins::PluginRegistry;
use crate::proxy::CentralProxyClient;
use crate::services::agents::AgentManager;
use crate::services::control::ControlManager;
use crate::services::install::AgentInstaller;

pub fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();
}

/// Boot the edge controller and serve until SIGINT/SIGTERM.
pub async fn run(config: AppConfig) -> Result<()> {
    run_with_shutdown(config, shutdown_signal()).await
}

/// Boot the edge controller and serve until `shutdown` resolves.
pub async fn run_with_shutdown<S>(config: AppConfig, shutdown: S) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let db = if config.use_in_memory_providers {
        store::open_in_memory().await?
    } else {
        let path = config
            .db_path
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("durable providers need --db-path"))?;
        store::open(path).await?
    };

    let credentials_path = credentials::credentials_path();
    let creds = bootstrap::ensure_credentials(&config, &credentials_path).await?;
    let eic = EicId {
        organization_id: creds.organization_id.clone(),
        edge_controller_id: creds.edge_controller_id.clone(),
    };

    let ca = (!creds.cacert.is_empty()).then_some(creds.cacert.as_str());
    let proxy = CentralProxyClient::new(&creds.proxy_url, ca)?;

    let notifier = Notifier::new(
        db.clone(),
        proxy.clone(),
        &creds.organization_id,
        &creds.edge_controller_id,
    );

    let providers = crate::metrics::ProviderRegistry::with_defaults();
    let metrics_plugin = MetricsPlugin::new(&config.plugin_options, &providers)?;
    let metrics_provider = metrics_plugin.provider();
    let mut plugins = PluginRegistry::new();
    plugins.register(Arc::new(metrics_plugin));
    plugins.start_all().await?;

    let installer = AgentInstaller::new(
        notifier.clone(),
        config.agent_binary_path.clone(),
        config.agent_port,
    );

    let agents = AgentManager::new(
        db.clone(),
        notifier.clone(),
        proxy.clone(),
        plugins.clone(),
        &creds.organization_id,
        &creds.edge_controller_id,
    );
    let control = ControlManager::new(
        db.clone(),
        notifier.clone(),
        metrics_provider,
        installer,
        credentials_path,
        Some(creds.vpn.username.clone()),
        &creds.edge_controller_id,
    );

    let state = AppState {
        db,
        agents,
        control,
        notifier: notifier.clone(),
        metrics_handle: telemetry::init_metrics_recorder(),
        debug: config.debug,
    };

    // Tell the center this controller is up; a failure is not fatal, the
    // alive ping loop keeps retrying.
    if let Err(err) = proxy.eic_start(&eic).await {
        warn!(%err, "cannot send start message to management cluster");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx_for_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown.await;
        let _ = shutdown_tx_for_signal.send(true);
    });

    {
        let notifier = notifier.clone();
        let notify_period = config.notify_period;
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { notifier.run(notify_period, rx).await });
    }
    tokio::spawn(tasks::alive::alive_loop(
        proxy.clone(),
        eic,
        config.alive_period,
        shutdown_rx.clone(),
    ));

    let central_addr: SocketAddr = format!("0.0.0.0:{}", config.port)
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid central listen address: {err}"))?;
    let agent_addr: SocketAddr = format!("0.0.0.0:{}", config.agent_port)
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid agent listen address: {err}"))?;

    let central_app = http::build_central_router(state.clone()).with_state(state.clone());
    let agent_app = http::build_agent_router(state.clone()).with_state(state.clone());

    let central_listener = tokio::net::TcpListener::bind(central_addr).await?;
    let agent_listener = tokio::net::TcpListener::bind(agent_addr).await?;
    info!(%central_addr, "central-facing listener up");
    info!(%agent_addr, "agent-facing listener up");

    let mut central_shutdown = shutdown_rx.clone();
    let mut agent_shutdown = shutdown_rx.clone();

    let mut central_task = tokio::spawn(async move {
        axum::serve(
            central_listener,
            central_app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = central_shutdown.changed().await;
        })
        .await
    });

    let mut agent_task = tokio::spawn(async move {
        axum::serve(
            agent_listener,
            agent_app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = agent_shutdown.changed().await;
        })
        .await
    });

    tokio::select! {
        res = &mut central_task => {
            let _ = shutdown_tx.send(true);
            res.map_err(|err| anyhow::anyhow!("central listener task failed: {err}"))?
                .map_err(|err| anyhow::anyhow!("central listener failed: {err}"))?;
            agent_task
                .await
                .map_err(|err| anyhow::anyhow!("agent listener task failed: {err}"))?
                .map_err(|err| anyhow::anyhow!("agent listener failed: {err}"))?;
        }
        res = &mut agent_task => {
            let _ = shutdown_tx.send(true);
            res.map_err(|err| anyhow::anyhow!("agent listener task failed: {err}"))?
                .map_err(|err| anyhow::anyhow!("agent listener failed: {err}"))?;
            central_task
                .await
                .map_err(|err| anyhow::anyhow!("central listener task failed: {err}"))?
                .map_err(|err| anyhow::anyhow!("central listener failed: {err}"))?;
        }
    }

    notifier.stop();
    plugins.stop_all().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => stream.recv().await,
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                None
            }
        };
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("received SIGTERM, shutting down");
        },
    }
}
