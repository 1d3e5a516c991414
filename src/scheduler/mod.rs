//! Background loops: probe schedules, daily rollover, transfer recording and retention.

mod daily;
mod retention;
mod transfer;

pub use daily::*;
pub use retention::*;
pub use transfer::*;

use crate::db::Monitor;
use crate::sentinel::{ProbeSchedule, SentinelError};
use crate::server::ServerRegistry;
use crate::task::TaskSink;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};

/// Capacity of the bus carrying due probes to the relay.
pub const PROBE_BUS_CAPACITY: usize = 1000;

/// Runs one periodic loop per monitor, each pushing the monitor onto the probe bus when due.
pub struct ProbeScheduler {
    stop_chans: Arc<RwLock<HashMap<u64, broadcast::Sender<()>>>>,
    bus: mpsc::Sender<Monitor>,
}

impl ProbeScheduler {
    /// Returns the scheduler and the receiving end of its probe bus.
    pub fn new() -> (Self, mpsc::Receiver<Monitor>) {
        let (bus, rx) = mpsc::channel(PROBE_BUS_CAPACITY);
        (
            Self {
                stop_chans: Arc::new(RwLock::new(HashMap::new())),
                bus,
            },
            rx,
        )
    }

    pub async fn len(&self) -> usize {
        self.stop_chans.read().await.len()
    }

    /// Stop every schedule.
    pub async fn stop_all(&self) {
        let mut stop_chans = self.stop_chans.write().await;
        for (_, stop_tx) in stop_chans.drain() {
            let _ = stop_tx.send(());
        }
    }
}

#[async_trait]
impl ProbeSchedule for ProbeScheduler {
    async fn register(&self, monitor: &Monitor) -> Result<(), SentinelError> {
        let secs = monitor.interval_secs();
        if secs == 0 {
            return Err(SentinelError::InvalidSchedule(format!(
                "monitor {} has a zero interval",
                monitor.id
            )));
        }

        let mut stop_chans = self.stop_chans.write().await;

        if let Some(old) = stop_chans.remove(&monitor.id) {
            let _ = old.send(());
        }

        let (stop_tx, stop_rx) = broadcast::channel(1);
        stop_chans.insert(monitor.id, stop_tx);
        drop(stop_chans);

        tracing::info!(
            "ProbeScheduler: scheduling monitor {} every {}s",
            monitor.id,
            secs
        );

        tokio::spawn(run_schedule_loop(
            monitor.clone(),
            Duration::from_secs(secs),
            self.bus.clone(),
            stop_rx,
        ));
        Ok(())
    }

    async fn unregister(&self, monitor_id: u64) {
        let mut stop_chans = self.stop_chans.write().await;

        if let Some(stop_tx) = stop_chans.remove(&monitor_id) {
            let _ = stop_tx.send(());
            tracing::info!("ProbeScheduler: removed monitor {}", monitor_id);
        }
    }
}

/// Push the monitor onto the bus every `period`, first after one full period.
async fn run_schedule_loop(
    monitor: Monitor,
    period: Duration,
    bus: mpsc::Sender<Monitor>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = interval.tick() => {
                if bus.send(monitor.clone()).await.is_err() {
                    tracing::warn!("ProbeScheduler: probe bus closed, stopping monitor {}", monitor.id);
                    break;
                }
            }
        }
    }
}

/// Fan each due monitor out to the servers it covers.
pub async fn run_probe_relay(
    mut bus: mpsc::Receiver<Monitor>,
    servers: Arc<ServerRegistry>,
    sink: Arc<dyn TaskSink>,
    mut stop: broadcast::Receiver<()>,
) {
    loop {
        let monitor = tokio::select! {
            _ = stop.recv() => break,
            m = bus.recv() => match m {
                Some(m) => m,
                None => break,
            },
        };

        for server in servers.snapshot().await {
            if !monitor.covers(server.id) {
                continue;
            }
            if let Err(e) = sink.send_probe(&monitor, server.id).await {
                tracing::error!(
                    "ProbeScheduler: failed to send monitor {} to server {}: {}",
                    monitor.id,
                    server.id,
                    e
                );
            }
        }
    }
    tracing::info!("ProbeScheduler: probe relay stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotifyError;
    use crate::server::HostInfo;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ProbeLog {
        probes: Mutex<Vec<(u64, u64)>>,
    }

    #[async_trait]
    impl TaskSink for ProbeLog {
        async fn send_probe(&self, monitor: &Monitor, server_id: u64) -> Result<(), NotifyError> {
            self.probes.lock().unwrap().push((monitor.id, server_id));
            Ok(())
        }

        async fn send_trigger_tasks(&self, _task_ids: &[u64], _server_id: u64) -> Result<(), NotifyError> {
            Ok(())
        }
    }

    fn monitor(id: u64, duration: u64) -> Monitor {
        Monitor {
            id,
            name: format!("svc-{}", id),
            target: "10.0.0.9:22".to_string(),
            duration,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_schedule_pushes_and_stops() {
        let (scheduler, mut rx) = ProbeScheduler::new();
        tokio_test::assert_ok!(scheduler.register(&monitor(3, 1)).await);
        assert_eq!(scheduler.len().await, 1);

        let due = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(due.id, 3);

        scheduler.unregister(3).await;
        assert_eq!(scheduler.len().await, 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        while rx.try_recv().is_ok() {}

        tokio_test::assert_err!(tokio::time::timeout(Duration::from_millis(1500), rx.recv()).await);
    }

    #[tokio::test]
    async fn test_register_replaces_schedule() {
        let (scheduler, _rx) = ProbeScheduler::new();
        scheduler.register(&monitor(1, 60)).await.unwrap();
        scheduler.register(&monitor(1, 30)).await.unwrap();
        scheduler.register(&monitor(2, 30)).await.unwrap();
        assert_eq!(scheduler.len().await, 2);

        scheduler.stop_all().await;
        assert_eq!(scheduler.len().await, 0);
    }

    #[tokio::test]
    async fn test_relay_respects_cover() {
        let servers = Arc::new(ServerRegistry::new());
        servers.upsert(1, "edge-1", HostInfo::default()).await;
        servers.upsert(2, "edge-2", HostInfo::default()).await;

        let sink = Arc::new(ProbeLog::default());
        let (tx, rx) = mpsc::channel(4);
        let (_stop_tx, stop_rx) = broadcast::channel(1);

        let mut m = monitor(5, 30);
        m.skip_servers.insert(2);
        tx.send(m).await.unwrap();
        drop(tx);

        run_probe_relay(rx, servers, sink.clone(), stop_rx).await;
        assert_eq!(sink.probes.lock().unwrap().clone(), vec![(5, 1)]);
    }
}
