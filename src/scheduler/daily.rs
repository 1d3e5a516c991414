//! Daily rollover of service statistics at local midnight.

use crate::sentinel::ServiceSentinel;

use chrono::Local;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};

/// Every day at 00:00:00 local time.
pub const ROLLOVER_CRON: &str = "0 0 0 * * *";

fn rollover_job(sentinel: Arc<ServiceSentinel>) -> Result<Job, JobSchedulerError> {
    Job::new_async_tz(ROLLOVER_CRON, Local, move |_uuid, _lock| {
        let sentinel = sentinel.clone();
        Box::pin(async move {
            sentinel.rollover(Local::now().date_naive()).await;
        })
    })
}

async fn start_rollover_scheduler(sentinel: Arc<ServiceSentinel>) -> Result<JobScheduler, JobSchedulerError> {
    let scheduler = JobScheduler::new().await?;
    scheduler.add(rollover_job(sentinel)?).await?;
    scheduler.start().await?;
    Ok(scheduler)
}

/// Roll the sentinel's day window forward on every local midnight until stopped.
pub async fn run_daily_rollover(sentinel: Arc<ServiceSentinel>, mut stop: broadcast::Receiver<()>) {
    let mut scheduler = match start_rollover_scheduler(sentinel).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("DailyRollover: failed to start scheduler: {}", e);
            return;
        }
    };
    tracing::info!("DailyRollover: scheduled on {}", ROLLOVER_CRON);

    let _ = stop.recv().await;

    if let Err(e) = scheduler.shutdown().await {
        tracing::error!("DailyRollover: failed to stop scheduler: {}", e);
    }
    tracing::info!("DailyRollover: stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::db::Store;
    use crate::mute::MuteStore;
    use crate::notify::testing::RecordingTasks;
    use crate::notify::{Dispatcher, NotificationCenter};
    use crate::scheduler::ProbeScheduler;
    use crate::server::ServerRegistry;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    async fn sentinel(store: Arc<Store>) -> Arc<ServiceSentinel> {
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(NotificationCenter::new()),
            Arc::new(RecordingTasks::default()),
            Arc::new(MuteStore::new()),
            4,
        ));
        let (schedule, _bus) = ProbeScheduler::new();
        let (sentinel, _rx) = ServiceSentinel::new(
            store,
            Arc::new(schedule),
            Arc::new(ServerRegistry::new()),
            dispatcher,
            &ServerConfig::default(),
        )
        .await
        .unwrap();
        Arc::new(sentinel)
    }

    #[tokio::test]
    async fn test_rollover_job_parses() {
        let file = NamedTempFile::new().unwrap();
        let s = sentinel(Arc::new(Store::new(file.path()).unwrap())).await;
        tokio_test::assert_ok!(rollover_job(s));
    }

    #[tokio::test]
    async fn test_run_stops_on_signal() {
        let file = NamedTempFile::new().unwrap();
        let s = sentinel(Arc::new(Store::new(file.path()).unwrap())).await;

        let (stop_tx, stop_rx) = broadcast::channel(1);
        let handle = tokio::spawn(run_daily_rollover(s, stop_rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop_tx.send(()).unwrap();

        tokio_test::assert_ok!(tokio::time::timeout(Duration::from_secs(5), handle).await);
    }
}
