//! Service sentinel.
//!
//! Probe reports flow through a bounded queue into a single worker, which
//! folds each one into the monitor's rolling statistics, derives its health
//! and emits notification and trigger actions. Monitor definitions and
//! rolling state live in one [`SentinelState`] behind one lock, so admin
//! mutations, dashboard reads, the worker and the daily rollover always see
//! a consistent view.

mod cert;
mod registry;
mod ring;
mod stats;
mod status;

pub use cert::*;
pub use registry::*;
pub use ring::RingBuffer;
pub use stats::*;
pub use status::*;

use crate::config::ServerConfig;
use crate::db::{DbError, Monitor, MonitorHistory, ProbeType, Store};
use crate::mute::MuteLabel;
use crate::notify::{Action, Dispatcher, Notification, ServerContext};
use crate::server::ServerRegistry;

use chrono::{DateTime, Duration, Local, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, RwLock};

/// Capacity of the report queue. A full queue blocks `dispatch`.
pub const REPORT_QUEUE_CAPACITY: usize = 200;

const CERT_EXPIRY_WARNING_DAYS: i64 = 7;

#[derive(Error, Debug)]
pub enum SentinelError {
    #[error("unknown monitor {0}")]
    UnknownMonitor(u64),
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    #[error("storage error: {0}")]
    Storage(#[from] DbError),
    #[error("report queue closed")]
    Closed,
}

/// One probe outcome from one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportData {
    pub monitor_id: u64,
    pub reporter_server_id: u64,
    pub successful: bool,
    /// Milliseconds.
    pub delay: f32,
    pub payload: String,
    pub probe_type: ProbeType,
}

/// Dashboard view of one monitor.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub monitor: Monitor,
    pub current: CurrentStats,
    pub status: StatusCode,
    pub today: TodayStats,
    pub monthly: MonthlyStats,
    /// 30-day availability in percent.
    pub uptime: f32,
}

/// Side effects of ingesting one report.
#[derive(Debug, Default)]
pub struct Ingested {
    pub actions: Vec<Action>,
    pub history: Vec<MonitorHistory>,
}

/// UTC instant of local midnight starting `day`.
pub fn local_midnight(day: NaiveDate) -> DateTime<Utc> {
    let naive = day.and_time(NaiveTime::default());
    naive
        .and_local_timezone(Local)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|| naive.and_utc())
}

/// Monitor definitions plus their rolling state.
#[derive(Debug)]
pub struct SentinelState {
    registry: MonitorRegistry,
    stats: HashMap<u64, MonitorStats>,
    last_rollover: NaiveDate,
}

impl SentinelState {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            registry: MonitorRegistry::new(),
            stats: HashMap::new(),
            last_rollover: today,
        }
    }

    /// Insert or replace a monitor. New monitors get fresh rolling state;
    /// existing ones keep theirs.
    pub fn upsert_monitor(&mut self, monitor: Monitor) -> bool {
        let id = monitor.id;
        let created = self.registry.upsert(monitor);
        self.stats.entry(id).or_default();
        created
    }

    pub fn remove_monitor(&mut self, id: u64) -> bool {
        self.stats.remove(&id);
        self.registry.remove(id).is_some()
    }

    pub fn monitors(&self) -> Vec<Monitor> {
        self.registry.list()
    }

    pub fn stats(&self, id: u64) -> Option<&MonitorStats> {
        self.stats.get(&id)
    }

    /// Rebuild the monthly arrays and today's counters from aggregate history rows.
    pub fn load_history(&mut self, rows: &[MonitorHistory], today_start: DateTime<Utc>) {
        let mut day_delays: HashMap<(u64, usize), (f32, u32)> = HashMap::new();
        let mut today_delays: HashMap<u64, (f32, u32)> = HashMap::new();

        for row in rows.iter().filter(|r| r.server_id.is_none()) {
            let Some(stats) = self.stats.get_mut(&row.monitor_id) else {
                continue;
            };

            if row.created_at >= today_start {
                stats.today.up += row.up;
                stats.today.down += row.down;
                let d = today_delays.entry(row.monitor_id).or_default();
                d.0 += row.avg_delay;
                d.1 += 1;
                continue;
            }

            let days_before = (today_start - row.created_at).num_hours() / 24;
            let slot = (MONTH_DAYS as i64 - 2) - days_before;
            if slot < 0 {
                continue;
            }
            let slot = slot as usize;

            let d = day_delays.entry((row.monitor_id, slot)).or_default();
            d.0 += row.avg_delay;
            d.1 += 1;
            stats.monthly.add_day(slot, row.up, row.down, d.0 / d.1 as f32);
        }

        for (id, (sum, count)) in today_delays {
            if let Some(stats) = self.stats.get_mut(&id) {
                stats.today.delay = sum / count as f32;
            }
        }

        for stats in self.stats.values_mut() {
            stats.monthly.sync_today(&stats.today);
        }
    }

    /// Fold one report into its monitor's state. Unknown monitors yield `None`.
    pub fn ingest(
        &mut self,
        report: &ReportData,
        reporter: &ServerContext,
        now: DateTime<Utc>,
        ping_batch: usize,
    ) -> Option<Ingested> {
        let Some(monitor) = self.registry.get(report.monitor_id) else {
            tracing::warn!(
                "ServiceSentinel: dropping report for unknown monitor {} from server {}",
                report.monitor_id,
                report.reporter_server_id
            );
            return None;
        };
        let stats = self.stats.entry(monitor.id).or_default();

        let mut out = Ingested::default();
        let sample = Sample {
            successful: report.successful,
            delay: report.delay,
        };

        if report.probe_type.is_ping() {
            if let Some(flush) = stats.record_ping(report.reporter_server_id, sample, ping_batch) {
                out.history.push(MonitorHistory {
                    id: 0,
                    created_at: now,
                    monitor_id: monitor.id,
                    server_id: Some(report.reporter_server_id),
                    avg_delay: flush.avg_delay,
                    up: flush.up,
                    down: flush.down,
                    data: report.payload.clone(),
                });
            }
        }

        if stats.record(sample) {
            out.history.push(MonitorHistory {
                id: 0,
                created_at: now,
                monitor_id: monitor.id,
                server_id: None,
                avg_delay: stats.current.avg_delay,
                up: stats.current.up,
                down: stats.current.down,
                data: report.payload.clone(),
            });
        }

        let status = stats.current.status();

        latency_actions(monitor, report, reporter, &mut out.actions);
        state_actions(monitor, stats, status, report, reporter, &mut out.actions);
        cert_actions(monitor, stats, &report.payload, now, &mut out.actions);

        Some(out)
    }

    /// Advance the day window to `today`. Repeated calls for the same day are no-ops.
    pub fn rollover(&mut self, today: NaiveDate) -> bool {
        if today <= self.last_rollover {
            return false;
        }

        let days = (today - self.last_rollover).num_days().min(MONTH_DAYS as i64);
        for stats in self.stats.values_mut() {
            for _ in 0..days {
                stats.roll_day();
            }
        }
        self.last_rollover = today;
        true
    }

    pub fn snapshots(&self) -> BTreeMap<u64, StatsSnapshot> {
        self.registry
            .list()
            .into_iter()
            .filter_map(|monitor| {
                let stats = self.stats.get(&monitor.id)?;
                Some((
                    monitor.id,
                    StatsSnapshot {
                        current: stats.current,
                        status: stats.current.status(),
                        today: stats.today,
                        monthly: stats.monthly.clone(),
                        uptime: stats.monthly.uptime(),
                        monitor,
                    },
                ))
            })
            .collect()
    }
}

fn notify_action(monitor: &Monitor, message: String, reporter: Option<&ServerContext>, label: Option<MuteLabel>) -> Action {
    let mut notification = Notification::new(message);
    if let Some(r) = reporter {
        notification = notification.with_server(r.clone());
    }
    Action::Notify {
        tag: monitor.notification_tag.clone(),
        notification,
        label,
    }
}

fn unmute_action(monitor: &Monitor, label: MuteLabel) -> Action {
    Action::Unmute {
        tag: monitor.notification_tag.clone(),
        label,
    }
}

fn latency_actions(monitor: &Monitor, report: &ReportData, reporter: &ServerContext, actions: &mut Vec<Action>) {
    if report.delay <= 0.0 || !monitor.latency_notify {
        return;
    }

    let min_label = MuteLabel::latency_min(monitor.id);
    let max_label = MuteLabel::latency_max(monitor.id);

    if monitor.max_latency > 0.0 && report.delay > monitor.max_latency {
        let msg = format!(
            "[Latency] {} {:.2} > {:.2}, Reporter: {}",
            monitor.name, report.delay, monitor.max_latency, reporter.name
        );
        actions.push(notify_action(monitor, msg, Some(reporter), Some(max_label)));
    } else if report.delay < monitor.min_latency {
        let msg = format!(
            "[Latency] {} {:.2} < {:.2}, Reporter: {}",
            monitor.name, report.delay, monitor.min_latency, reporter.name
        );
        actions.push(notify_action(monitor, msg, Some(reporter), Some(min_label)));
    } else {
        actions.push(unmute_action(monitor, min_label));
        actions.push(unmute_action(monitor, max_label));
    }
}

fn state_actions(
    monitor: &Monitor,
    stats: &mut MonitorStats,
    status: StatusCode,
    report: &ReportData,
    reporter: &ServerContext,
    actions: &mut Vec<Action>,
) {
    let previous = stats.last_status;
    if status != StatusCode::Down && previous == Some(status) {
        return;
    }
    stats.last_status = Some(status);

    // first sample only seeds the state
    let Some(previous) = previous else {
        return;
    };

    if monitor.notify {
        let label = MuteLabel::state_changed(monitor.id);
        if status != previous {
            actions.push(unmute_action(monitor, label.clone()));
        }
        let msg = format!(
            "[{}] {} Reporter: {}, Error: {}",
            status, monitor.name, reporter.name, report.payload
        );
        actions.push(notify_action(monitor, msg, Some(reporter), Some(label)));
    }

    if monitor.enable_trigger_task {
        let tasks = if status == StatusCode::Good && previous != StatusCode::Good {
            &monitor.recover_trigger_tasks
        } else if previous == StatusCode::Good && status != StatusCode::Good {
            &monitor.fail_trigger_tasks
        } else {
            return;
        };

        if !tasks.is_empty() {
            actions.push(Action::Trigger {
                task_ids: tasks.clone(),
                server_id: report.reporter_server_id,
            });
        }
    }
}

fn format_expiry(expires_at: Option<DateTime<Utc>>) -> String {
    expires_at.map_or_else(
        || "unknown".to_string(),
        |t| t.format(EXPIRY_DISPLAY_FORMAT).to_string(),
    )
}

fn cert_actions(
    monitor: &Monitor,
    stats: &mut MonitorStats,
    payload: &str,
    now: DateTime<Utc>,
    actions: &mut Vec<Action>,
) {
    let network_label = MuteLabel::tls(monitor.id, "network");

    let info = match classify(payload) {
        CertPayload::FetchFailed { transient: true, .. } => return,
        CertPayload::FetchFailed { message, .. } => {
            if monitor.notify {
                let msg = format!("[TLS] {} fetch cert info failed, Error: {}", monitor.name, message);
                actions.push(notify_action(monitor, msg, None, Some(network_label)));
            }
            return;
        }
        CertPayload::Other => {
            actions.push(unmute_action(monitor, network_label));
            return;
        }
        CertPayload::Cert(info) => {
            actions.push(unmute_action(monitor, network_label));
            info
        }
    };

    let cached = stats
        .cert_cache
        .get_or_insert_with(|| payload.to_string())
        .clone();
    let old = parse_cert(&cached);
    let rotated = old.as_ref().is_some_and(|o| info.rotated_from(o));
    if rotated {
        stats.cert_cache = Some(payload.to_string());
    }

    if !monitor.notify {
        return;
    }

    if let Some(expires_at) = info.expires_at {
        if expires_at < now + Duration::days(CERT_EXPIRY_WARNING_DAYS) {
            let shown = format_expiry(Some(expires_at));
            let msg = format!(
                "[TLS] {} The TLS certificate will expire within seven days. Expiration time: {}",
                monitor.name, shown
            );
            let label = MuteLabel::tls(monitor.id, &format!("expire_{}", shown));
            actions.push(notify_action(monitor, msg, None, Some(label)));
        }
    }

    if let (true, Some(old)) = (rotated, old) {
        let msg = format!(
            "[TLS] {} TLS certificate changed, old: issuer {}, expires at {}; new: issuer {}, expires at {}",
            monitor.name,
            old.fingerprint,
            format_expiry(old.expires_at),
            info.fingerprint,
            format_expiry(info.expires_at)
        );
        actions.push(notify_action(monitor, msg, None, None));
    }
}

/// Owner of monitor state and the report ingestion worker.
pub struct ServiceSentinel {
    state: RwLock<SentinelState>,
    report_tx: mpsc::Sender<ReportData>,
    store: Arc<Store>,
    schedule: Arc<dyn ProbeSchedule>,
    servers: Arc<ServerRegistry>,
    dispatcher: Arc<Dispatcher>,
    avg_ping_count: usize,
    plain_ip: bool,
}

impl ServiceSentinel {
    /// Load monitors and their history from the store and register their schedules.
    ///
    /// Returns the sentinel and the receiving end of its report queue, which
    /// must be handed to [`ServiceSentinel::run`].
    pub async fn new(
        store: Arc<Store>,
        schedule: Arc<dyn ProbeSchedule>,
        servers: Arc<ServerRegistry>,
        dispatcher: Arc<Dispatcher>,
        config: &ServerConfig,
    ) -> Result<(Self, mpsc::Receiver<ReportData>), SentinelError> {
        let monitors = store.get_monitors()?;

        let today = Local::now().date_naive();
        let today_start = local_midnight(today);
        let mut state = SentinelState::new(today);

        for monitor in monitors {
            if let Err(e) = MonitorRegistry::validate(&monitor) {
                tracing::warn!("ServiceSentinel: skipping monitor {}: {}", monitor.id, e);
                continue;
            }
            schedule.register(&monitor).await?;
            state.upsert_monitor(monitor);
        }

        let rows = store.get_monitor_history_since(today_start - Duration::days(MONTH_DAYS as i64 - 1))?;
        state.load_history(&rows, today_start);

        tracing::info!(
            "ServiceSentinel: loaded {} monitors and {} history rows",
            state.registry.len(),
            rows.len()
        );

        let (report_tx, report_rx) = mpsc::channel(REPORT_QUEUE_CAPACITY);

        Ok((
            Self {
                state: RwLock::new(state),
                report_tx,
                store,
                schedule,
                servers,
                dispatcher,
                avg_ping_count: config.avg_ping_count,
                plain_ip: config.plain_ip,
            },
            report_rx,
        ))
    }

    /// Queue a report. Waits while the queue is full.
    pub async fn dispatch(&self, report: ReportData) -> Result<(), SentinelError> {
        self.report_tx
            .send(report)
            .await
            .map_err(|_| SentinelError::Closed)
    }

    /// Add or replace a monitor and restart its schedule.
    pub async fn on_monitor_update(&self, monitor: Monitor) -> Result<(), SentinelError> {
        MonitorRegistry::validate(&monitor)?;

        let mut state = self.state.write().await;
        self.schedule.register(&monitor).await?;

        let id = monitor.id;
        if state.upsert_monitor(monitor) {
            tracing::info!("ServiceSentinel: added monitor {}", id);
        } else {
            tracing::info!("ServiceSentinel: updated monitor {}", id);
        }
        Ok(())
    }

    /// Drop monitors together with their rolling state and schedules.
    pub async fn on_monitor_delete(&self, ids: &[u64]) {
        let mut state = self.state.write().await;
        for &id in ids {
            self.schedule.unregister(id).await;
            if state.remove_monitor(id) {
                tracing::info!("ServiceSentinel: removed monitor {}", id);
            }
        }
    }

    pub async fn load_stats(&self) -> BTreeMap<u64, StatsSnapshot> {
        self.state.read().await.snapshots()
    }

    /// Snapshots of the monitors shown on the public service page.
    pub async fn service_stats(&self) -> BTreeMap<u64, StatsSnapshot> {
        let mut stats = self.load_stats().await;
        stats.retain(|_, s| s.monitor.enable_show_in_service);
        stats
    }

    pub async fn monitors(&self) -> Vec<Monitor> {
        self.state.read().await.monitors()
    }

    pub async fn get_monitor(&self, id: u64) -> Result<Monitor, SentinelError> {
        self.state
            .read()
            .await
            .registry
            .get(id)
            .cloned()
            .ok_or(SentinelError::UnknownMonitor(id))
    }

    pub async fn rollover(&self, today: NaiveDate) -> bool {
        let rolled = self.state.write().await.rollover(today);
        if rolled {
            tracing::info!("ServiceSentinel: rolled statistics over to {}", today);
        }
        rolled
    }

    /// Ingest one report, persist its history rows and hand off its actions.
    pub async fn process(&self, report: ReportData) {
        let reporter = self
            .servers
            .context_of(report.reporter_server_id, self.plain_ip)
            .await;

        let ingested = {
            let mut state = self.state.write().await;
            state.ingest(&report, &reporter, Utc::now(), self.avg_ping_count)
        };
        let Some(ingested) = ingested else {
            return;
        };

        if !ingested.history.is_empty() {
            if let Err(e) = self.store.add_monitor_histories(&ingested.history) {
                tracing::error!(
                    "ServiceSentinel: failed to persist history for monitor {}: {}",
                    report.monitor_id,
                    e
                );
            }
        }

        self.dispatcher.apply(ingested.actions);
    }

    /// Drain the report queue until it closes or a stop signal arrives.
    pub async fn run(self: Arc<Self>, mut reports: mpsc::Receiver<ReportData>, mut stop: broadcast::Receiver<()>) {
        tracing::info!("ServiceSentinel: worker started");
        loop {
            tokio::select! {
                _ = stop.recv() => break,
                report = reports.recv() => match report {
                    Some(r) => self.process(r).await,
                    None => break,
                },
            }
        }
        tracing::info!("ServiceSentinel: worker stopped");
    }
}
