//! Retention manager for cleaning up old data.

use crate::alert::AlertSentinel;
use crate::db::Store;
use crate::mute::MuteStore;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// How long service history is kept, and transfer rows when no cycle needs them.
pub const RETENTION_DAYS: i64 = 30;

const RETENTION_INTERVAL: Duration = Duration::from_secs(3600);

/// Manager for deleting data past its retention period.
pub struct RetentionManager {
    store: Arc<Store>,
    alerts: Arc<AlertSentinel>,
    mute: Arc<MuteStore>,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>, alerts: Arc<AlertSentinel>, mute: Arc<MuteStore>) -> Self {
        Self { store, alerts, mute }
    }

    pub async fn run(self: Arc<Self>, mut stop: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(RETENTION_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop.recv() => break,
                _ = interval.tick() => {
                    let earliest = self.alerts.earliest_cycle_start().await;
                    process_retention(&self.store, &self.mute, earliest, Utc::now());
                }
            }
        }
        tracing::info!("RetentionManager: stopped");
    }
}

/// Cutoff for transfer rows: the oldest active cycle start, else the retention window.
pub fn transfer_cutoff(earliest_cycle: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    earliest_cycle.unwrap_or(now - ChronoDuration::days(RETENTION_DAYS))
}

pub fn process_retention(
    store: &Store,
    mute: &MuteStore,
    earliest_cycle: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) {
    match store.delete_stale_monitor_history(now - ChronoDuration::days(RETENTION_DAYS)) {
        Ok(0) => {}
        Ok(n) => tracing::info!("RetentionManager: deleted {} monitor history rows", n),
        Err(e) => tracing::error!("RetentionManager: Failed to delete monitor history: {}", e),
    }

    match store.delete_transfers_before(transfer_cutoff(earliest_cycle, now)) {
        Ok(0) => {}
        Ok(n) => tracing::info!("RetentionManager: deleted {} transfer rows", n),
        Err(e) => tracing::error!("RetentionManager: Failed to delete transfers: {}", e),
    }

    let purged = mute.purge_expired(now);
    if purged > 0 {
        tracing::debug!("RetentionManager: purged {} mute entries", purged);
    }
}
