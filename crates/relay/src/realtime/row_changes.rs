// Postgres LISTEN/NOTIFY bridge.
//
// The `scrumflow_notify_row_change` trigger publishes every change to the
// watched tables on one notification channel; each payload is decoded and
// routed through the hub to the topics it belongs to.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use scrumflow_common::channel::RowChange;
use scrumflow_common::realtime::RealtimeHub;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::metrics::RelayMetrics;

pub const ROW_CHANGE_CHANNEL: &str = "scrumflow_row_changes";
const RESTART_DELAY: Duration = Duration::from_secs(5);

pub fn spawn_row_change_listener(pool: PgPool, hub: RealtimeHub, metrics: Arc<RelayMetrics>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(error) = listen(&pool, &hub, &metrics).await {
                error!(error = ?error, "row change listener stopped; restarting");
            }
            tokio::time::sleep(RESTART_DELAY).await;
        }
    })
}

async fn listen(pool: &PgPool, hub: &RealtimeHub, metrics: &RelayMetrics) -> Result<()> {
    let mut listener =
        PgListener::connect_with(pool).await.context("failed to open row change listener")?;
    listener
        .listen(ROW_CHANGE_CHANNEL)
        .await
        .with_context(|| format!("failed to LISTEN on {ROW_CHANGE_CHANNEL}"))?;
    info!(channel = ROW_CHANGE_CHANNEL, "listening for row changes");

    loop {
        let notification =
            listener.recv().await.context("row change listener lost its connection")?;
        dispatch_notification(hub, metrics, notification.payload()).await;
    }
}

/// Decode one notification payload and fan it out. Returns the number of
/// connections the change was queued for.
pub async fn dispatch_notification(hub: &RealtimeHub, metrics: &RelayMetrics, payload: &str) -> usize {
    let change = match serde_json::from_str::<RowChange>(payload) {
        Ok(change) => change,
        Err(error) => {
            warn!(error = %error, "discarding undecodable row change notification");
            return 0;
        }
    };

    metrics.record_row_change(&change.table);
    let delivered = hub.publish_row_change(&change).await;
    debug!(table = %change.table, delivered, "row change dispatched");
    delivered
}
