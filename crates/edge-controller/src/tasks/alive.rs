use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use common::api::EicId;

use crate::proxy::CentralProxyClient;

/// Periodically tell the central proxy this edge controller is alive.
///
/// A missed ping is just logged; the central platform derives controller
/// health from ping absence, not from this task's error handling.
pub async fn alive_loop(
    proxy: CentralProxyClient,
    eic: EicId,
    alive_period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(period_secs = alive_period.as_secs(), "launching alive ping loop");
    let mut interval = tokio::time::interval(alive_period);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                if let Err(err) = proxy.eic_alive(&eic).await {
                    warn!(%err, "cannot send alive ping to management cluster");
                }
            }
        }
    }
    info!("alive ping loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::POST;
    use httpmock::MockServer;

    #[tokio::test]
    async fn loop_pings_until_shutdown() {
        let server = MockServer::start();
        let alive = server.mock(|when, then| {
            when.method(POST)
                .path("/api/v1/inventory/eic/alive")
                .json_body_partial(r#"{"edge_controller_id": "ec"}"#);
            then.status(200);
        });

        let proxy = CentralProxyClient::new(&server.url(""), None).expect("client");
        let eic = EicId {
            organization_id: "org".into(),
            edge_controller_id: "ec".into(),
        };
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(alive_loop(proxy, eic, Duration::from_millis(50), rx));
        tokio::time::sleep(Duration::from_millis(140)).await;
        let _ = tx.send(true);
        task.await.expect("join");

        assert!(alive.hits() >= 2, "expected at least two pings");
    }
}
