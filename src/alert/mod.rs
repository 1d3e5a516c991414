//! Alert rule evaluator.
//!
//! A fixed ticker snapshots every enabled alert rule against every live
//! server, keeps a bounded history per (alert, server) pair and raises
//! incident and recovery notifications on the shared mute path.

mod cycle;
mod rule;

pub use cycle::*;
pub use rule::*;

use crate::config::ServerConfig;
use crate::db::{AlertRule, DbError, Store};
use crate::mute::MuteLabel;
use crate::notify::{Action, Dispatcher, Notification};
use crate::server::{Server, ServerRegistry};

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckState {
    Pass,
    Fail,
}

/// Alert rules with their per-server history and cycle windows.
#[derive(Debug, Default)]
pub struct AlertState {
    alerts: BTreeMap<u64, AlertRule>,
    history: HashMap<(u64, u64), Vec<Point>>,
    states: HashMap<(u64, u64), CheckState>,
    /// Keyed by (alert id, rule index).
    cycles: BTreeMap<(u64, usize), CycleTransferStats>,
}

impl AlertState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an alert. Its history, pass/fail state and cycle windows start over.
    pub fn upsert(&mut self, alert: AlertRule, now: DateTime<Utc>) {
        let id = alert.id;
        self.history.retain(|(alert_id, _), _| *alert_id != id);
        self.states.retain(|(alert_id, _), _| *alert_id != id);
        self.cycles.retain(|(alert_id, _), _| *alert_id != id);

        for (i, rule) in alert.rules.iter().enumerate() {
            if !rule.is_cycle_transfer() {
                continue;
            }
            match CycleTransferStats::new(id, &alert.name, rule, now) {
                Some(stats) => {
                    self.cycles.insert((id, i), stats);
                }
                None => tracing::warn!("AlertSentinel: alert {} rule {} has no cycle start", id, i),
            }
        }

        self.alerts.insert(id, alert);
    }

    pub fn remove(&mut self, id: u64) -> Option<AlertRule> {
        self.history.retain(|(alert_id, _), _| *alert_id != id);
        self.states.retain(|(alert_id, _), _| *alert_id != id);
        self.cycles.retain(|(alert_id, _), _| *alert_id != id);
        self.alerts.remove(&id)
    }

    pub fn remove_server(&mut self, server_id: u64) {
        self.history.retain(|(_, sid), _| *sid != server_id);
        self.states.retain(|(_, sid), _| *sid != server_id);
        for stats in self.cycles.values_mut() {
            stats.server_name.remove(&server_id);
            stats.transfer.remove(&server_id);
            stats.next_update.remove(&server_id);
        }
    }

    pub fn alerts(&self) -> Vec<AlertRule> {
        self.alerts.values().cloned().collect()
    }

    pub fn history_len(&self, alert_id: u64, server_id: u64) -> usize {
        self.history.get(&(alert_id, server_id)).map_or(0, Vec::len)
    }

    pub fn cycle_stats(&self) -> Vec<CycleTransferStats> {
        self.cycles.values().cloned().collect()
    }

    /// Start of the oldest cycle still being accounted.
    pub fn earliest_cycle_start(&self) -> Option<DateTime<Utc>> {
        self.cycles.values().map(|c| c.from).min()
    }

    /// Snapshot every enabled alert against every server and return the resulting actions.
    pub fn evaluate(
        &mut self,
        servers: &[Server],
        now: DateTime<Utc>,
        interval: Duration,
        source: &dyn TransferSource,
        plain_ip: bool,
    ) -> Vec<Action> {
        let mut actions = Vec::new();

        for alert in self.alerts.values().filter(|a| a.enabled) {
            for (i, rule) in alert.rules.iter().enumerate() {
                if let Some(stats) = self.cycles.get_mut(&(alert.id, i)) {
                    stats.advance(rule, now);
                }
            }

            for server in servers {
                let point: Point = alert
                    .rules
                    .iter()
                    .enumerate()
                    .map(|(i, rule)| {
                        if rule.is_cycle_transfer() {
                            self.cycles
                                .get_mut(&(alert.id, i))
                                .and_then(|stats| stats.snapshot(rule, server, source, now))
                        } else {
                            threshold_snapshot(rule, server, now)
                        }
                    })
                    .collect();

                let key = (alert.id, server.id);
                let history = self.history.entry(key).or_default();
                history.push(point);

                let (keep, passed) = check(alert, history, interval);
                if history.len() > keep {
                    history.drain(..history.len() - keep);
                }

                let failures: Vec<String> = history
                    .last()
                    .map(|p| p.iter().flatten().cloned().collect())
                    .unwrap_or_default();

                let prev = self.states.insert(
                    key,
                    if passed { CheckState::Pass } else { CheckState::Fail },
                );

                if passed {
                    if prev == Some(CheckState::Fail) {
                        resolved_actions(alert, server, plain_ip, &mut actions);
                    }
                } else {
                    incident_actions(alert, server, plain_ip, &failures, &mut actions);
                    if prev != Some(CheckState::Fail) && !alert.fail_trigger_tasks.is_empty() {
                        actions.push(Action::Trigger {
                            task_ids: alert.fail_trigger_tasks.clone(),
                            server_id: server.id,
                        });
                    }
                }
            }
        }

        actions
    }
}

fn incident_actions(
    alert: &AlertRule,
    server: &Server,
    plain_ip: bool,
    failures: &[String],
    actions: &mut Vec<Action>,
) {
    let ctx = server.context(plain_ip);
    let mut msg = format!("[Incident] {}({}) Rule: {}", ctx.name, ctx.ip, alert.name);
    if !failures.is_empty() {
        msg.push_str(&format!(", {}", failures.join("; ")));
    }

    actions.push(Action::Unmute {
        tag: alert.notification_tag.clone(),
        label: MuteLabel::incident_resolved(alert.id, server.id),
    });
    actions.push(Action::Notify {
        tag: alert.notification_tag.clone(),
        notification: Notification::new(msg).with_server(ctx),
        label: Some(MuteLabel::incident(alert.id, server.id)),
    });
}

fn resolved_actions(alert: &AlertRule, server: &Server, plain_ip: bool, actions: &mut Vec<Action>) {
    let ctx = server.context(plain_ip);
    let msg = format!("[Resolved] {}({}) Rule: {}", ctx.name, ctx.ip, alert.name);

    actions.push(Action::Unmute {
        tag: alert.notification_tag.clone(),
        label: MuteLabel::incident(alert.id, server.id),
    });
    actions.push(Action::Notify {
        tag: alert.notification_tag.clone(),
        notification: Notification::new(msg).with_server(ctx),
        label: Some(MuteLabel::incident_resolved(alert.id, server.id)),
    });
    if !alert.recover_trigger_tasks.is_empty() {
        actions.push(Action::Trigger {
            task_ids: alert.recover_trigger_tasks.clone(),
            server_id: server.id,
        });
    }
}

/// Owner of alert state and the evaluation ticker.
///
/// Lock order is alert state first, then the server registry.
pub struct AlertSentinel {
    state: RwLock<AlertState>,
    store: Arc<Store>,
    servers: Arc<ServerRegistry>,
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
    plain_ip: bool,
}

impl AlertSentinel {
    pub fn new(
        store: Arc<Store>,
        servers: Arc<ServerRegistry>,
        dispatcher: Arc<Dispatcher>,
        config: &ServerConfig,
    ) -> Result<Self, DbError> {
        let now = Utc::now();
        let mut state = AlertState::new();
        let alerts = store.get_alert_rules()?;
        let count = alerts.len();
        for alert in alerts {
            state.upsert(alert, now);
        }
        tracing::info!("AlertSentinel: loaded {} alert rules", count);

        Ok(Self {
            state: RwLock::new(state),
            store,
            servers,
            dispatcher,
            interval: config.alert_interval,
            plain_ip: config.plain_ip,
        })
    }

    pub async fn on_refresh_or_add_alert(&self, alert: AlertRule) {
        let id = alert.id;
        self.state.write().await.upsert(alert, Utc::now());
        tracing::info!("AlertSentinel: refreshed alert {}", id);
    }

    pub async fn on_delete_alert(&self, id: u64) {
        if self.state.write().await.remove(id).is_some() {
            tracing::info!("AlertSentinel: removed alert {}", id);
        }
    }

    /// Drop a server from the live set along with its alert history.
    pub async fn on_server_delete(&self, server_id: u64) {
        let mut state = self.state.write().await;
        state.remove_server(server_id);
        self.servers.remove(server_id).await;
    }

    pub async fn alerts(&self) -> Vec<AlertRule> {
        self.state.read().await.alerts()
    }

    pub async fn cycle_transfer_stats(&self) -> Vec<CycleTransferStats> {
        self.state.read().await.cycle_stats()
    }

    pub async fn earliest_cycle_start(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.earliest_cycle_start()
    }

    /// Run one evaluation pass. Returns handles of the spawned sends.
    pub async fn check_all(&self) -> Vec<JoinHandle<()>> {
        let actions = {
            let mut state = self.state.write().await;
            let servers = self.servers.snapshot().await;
            state.evaluate(
                &servers,
                Utc::now(),
                self.interval,
                &*self.store,
                self.plain_ip,
            )
        };
        self.dispatcher.apply(actions)
    }

    pub async fn run(self: Arc<Self>, mut stop: broadcast::Receiver<()>) {
        tracing::info!("AlertSentinel: ticker started every {:?}", self.interval);

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop.recv() => break,
                _ = interval.tick() => {
                    self.check_all().await;
                }
            }
        }
        tracing::info!("AlertSentinel: ticker stopped");
    }
}
