//! FleetWatch - service monitoring and alerting engine.

use fleetwatch::alert::AlertSentinel;
use fleetwatch::config::{self, ServerConfig};
use fleetwatch::db::Store;
use fleetwatch::mute::MuteStore;
use fleetwatch::notify::{Dispatcher, NotificationCenter, WebhookNotifier};
use fleetwatch::scheduler::{
    run_daily_rollover, run_probe_relay, run_transfer_recorder, ProbeScheduler, RetentionManager,
};
use fleetwatch::sentinel::ServiceSentinel;
use fleetwatch::server::ServerRegistry;
use fleetwatch::task::{LogTaskSink, TaskSink};
use fleetwatch::web::WebServer;

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn load_notifiers(cfg: &ServerConfig) -> Result<NotificationCenter, Box<dyn std::error::Error + Send + Sync>> {
    let center = NotificationCenter::new();
    let Some(path) = cfg.notifiers_path.as_deref() else {
        tracing::warn!("No notification channels configured, notifications will be dropped");
        return Ok(center);
    };

    for channel in config::load_notifier_channels(path)? {
        let tag = channel.tag.clone();
        let name = channel.name.clone();
        match WebhookNotifier::new(channel) {
            Ok(notifier) => {
                center.add(tag.clone(), Arc::new(notifier));
                tracing::info!("Loaded notification channel {} for group {}", name, tag);
            }
            Err(e) => tracing::error!("Skipping notification channel {}: {}", name, e),
        }
    }
    Ok(center)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("fleetwatch=info".parse()?))
        .init();

    let cfg = ServerConfig::load();
    tracing::info!("Starting FleetWatch on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let center = Arc::new(load_notifiers(&cfg)?);
    let tasks: Arc<dyn TaskSink> = Arc::new(LogTaskSink);
    let mute = Arc::new(MuteStore::new());
    let dispatcher = Arc::new(Dispatcher::new(center, tasks.clone(), mute.clone(), cfg.notify_concurrency));
    let servers = Arc::new(ServerRegistry::new());

    let (probe_scheduler, probe_bus) = ProbeScheduler::new();
    let probe_scheduler = Arc::new(probe_scheduler);

    let (sentinel, reports) = ServiceSentinel::new(
        store.clone(),
        probe_scheduler.clone(),
        servers.clone(),
        dispatcher.clone(),
        &cfg,
    )
    .await?;
    let sentinel = Arc::new(sentinel);
    let alerts = Arc::new(AlertSentinel::new(store.clone(), servers.clone(), dispatcher, &cfg)?);
    let retention = Arc::new(RetentionManager::new(store.clone(), alerts.clone(), mute));

    let (stop_tx, _) = broadcast::channel(1);
    let mut loops = vec![
        tokio::spawn(sentinel.clone().run(reports, stop_tx.subscribe())),
        tokio::spawn(run_probe_relay(probe_bus, servers.clone(), tasks, stop_tx.subscribe())),
        tokio::spawn(run_daily_rollover(sentinel.clone(), stop_tx.subscribe())),
        tokio::spawn(alerts.clone().run(stop_tx.subscribe())),
        tokio::spawn(retention.run(stop_tx.subscribe())),
        tokio::spawn(run_transfer_recorder(store, servers.clone(), stop_tx.subscribe())),
    ];

    let web = WebServer::new(cfg, sentinel, alerts, servers);
    let server_stop = stop_tx.subscribe();
    loops.push(tokio::spawn(async move {
        if let Err(e) = web.start(server_stop).await {
            tracing::error!("Web server failed: {}", e);
        }
    }));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    probe_scheduler.stop_all().await;
    let _ = stop_tx.send(());
    for handle in loops {
        let _ = handle.await;
    }

    Ok(())
}
