//! Hourly persistence of per-server transfer deltas.

use crate::db::{DbError, Store, Transfer};
use crate::server::ServerRegistry;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const RECORD_INTERVAL: Duration = Duration::from_secs(3600);

/// Write one row per server with traffic since the previous record. Returns rows written.
pub async fn record_transfers(store: &Store, servers: &ServerRegistry) -> Result<usize, DbError> {
    let now = Utc::now();
    let rows: Vec<Transfer> = servers
        .take_transfer_deltas()
        .await
        .into_iter()
        .filter(|(_, bytes_in, bytes_out)| *bytes_in > 0 || *bytes_out > 0)
        .map(|(server_id, bytes_in, bytes_out)| Transfer {
            id: 0,
            created_at: now,
            server_id,
            bytes_in,
            bytes_out,
        })
        .collect();

    store.add_transfers(&rows)?;
    Ok(rows.len())
}

pub async fn run_transfer_recorder(
    store: Arc<Store>,
    servers: Arc<ServerRegistry>,
    mut stop: broadcast::Receiver<()>,
) {
    let start = tokio::time::Instant::now() + RECORD_INTERVAL;
    let mut interval = tokio::time::interval_at(start, RECORD_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop.recv() => break,
            _ = interval.tick() => {
                match record_transfers(&store, &servers).await {
                    Ok(n) => tracing::debug!("TransferRecorder: recorded {} servers", n),
                    Err(e) => tracing::error!("TransferRecorder: Failed to record transfers: {}", e),
                }
            }
        }
    }

    // flush what accumulated since the last tick
    if let Err(e) = record_transfers(&store, &servers).await {
        tracing::error!("TransferRecorder: Failed to flush transfers on shutdown: {}", e);
    }
    tracing::info!("TransferRecorder: stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{HostInfo, HostState};
    use chrono::Duration as ChronoDuration;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_record_transfers() {
        let file = NamedTempFile::new().unwrap();
        let store = Store::new(file.path()).unwrap();
        let servers = ServerRegistry::new();
        servers.upsert(1, "edge-1", HostInfo::default()).await;
        servers.upsert(2, "idle", HostInfo::default()).await;

        let state = HostState {
            net_in_transfer: 700,
            net_out_transfer: 300,
            ..Default::default()
        };
        servers.report_state(1, state, Utc::now()).await;

        assert_eq!(record_transfers(&store, &servers).await.unwrap(), 1);
        // nothing new since the last record
        assert_eq!(record_transfers(&store, &servers).await.unwrap(), 0);

        let since = Utc::now() - ChronoDuration::hours(1);
        assert_eq!(store.sum_transfer_since(1, since).unwrap(), (700, 300));
        assert_eq!(store.sum_transfer_since(2, since).unwrap(), (0, 0));
    }
}
