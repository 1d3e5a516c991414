//! Notification delivery.
//!
//! Engines produce [`Action`]s; the [`Dispatcher`] consults the mute store
//! and runs each send as a detached task bounded by a semaphore, so a slow
//! sender never stalls ingestion.

mod webhook;

pub use webhook::*;

use crate::mute::{MuteLabel, MuteStore};
use crate::task::TaskSink;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Notification error types.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(String),
    #[error("unexpected status {0}: {1}")]
    Status(u16, String),
    #[error("invalid body template: {0}")]
    Template(String),
    #[error("task dispatch failed: {0}")]
    Dispatch(String),
}

/// Server a notification is about, used for template placeholders.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServerContext {
    pub id: u64,
    pub name: String,
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub message: String,
    pub server: Option<ServerContext>,
}

impl Notification {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            server: None,
        }
    }

    pub fn with_server(mut self, server: ServerContext) -> Self {
        self.server = Some(server);
        self
    }
}

/// A single delivery channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Notification channels grouped by tag.
#[derive(Default)]
pub struct NotificationCenter {
    groups: RwLock<HashMap<String, Vec<Arc<dyn Notifier>>>>,
}

impl NotificationCenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, tag: impl Into<String>, notifier: Arc<dyn Notifier>) {
        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        groups.entry(tag.into()).or_default().push(notifier);
    }

    pub fn group_len(&self, tag: &str) -> usize {
        let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
        groups.get(tag).map_or(0, Vec::len)
    }

    /// Deliver to every channel in the group; returns how many succeeded.
    pub async fn send(&self, tag: &str, notification: &Notification) -> usize {
        let notifiers = {
            let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
            groups.get(tag).cloned().unwrap_or_default()
        };

        if notifiers.is_empty() {
            tracing::debug!("NotificationCenter: no channels for group {}", tag);
            return 0;
        }

        let mut delivered = 0;
        for n in notifiers {
            match n.send(notification).await {
                Ok(()) => {
                    tracing::info!("NotificationCenter: sent to {}", n.name());
                    delivered += 1;
                }
                Err(e) => {
                    tracing::error!("NotificationCenter: failed to send to {}: {}", n.name(), e);
                }
            }
        }
        delivered
    }
}

/// Side effect requested by an engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Send to a group, subject to the mute store when a label is given.
    Notify {
        tag: String,
        notification: Notification,
        label: Option<MuteLabel>,
    },
    /// Clear the backoff state of a label.
    Unmute { tag: String, label: MuteLabel },
    /// Run trigger tasks on one server.
    Trigger { task_ids: Vec<u64>, server_id: u64 },
}

/// Applies engine actions against the mute store, channels and task sink.
pub struct Dispatcher {
    center: Arc<NotificationCenter>,
    tasks: Arc<dyn TaskSink>,
    mute: Arc<MuteStore>,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        center: Arc<NotificationCenter>,
        tasks: Arc<dyn TaskSink>,
        mute: Arc<MuteStore>,
        concurrency: usize,
    ) -> Self {
        Self {
            center,
            tasks,
            mute,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    pub fn mute_store(&self) -> &Arc<MuteStore> {
        &self.mute
    }

    /// Apply actions in order. Returns handles of the spawned sends.
    pub fn apply(&self, actions: Vec<Action>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for action in actions {
            let handle = match action {
                Action::Notify {
                    tag,
                    notification,
                    label,
                } => self.notify(&tag, notification, label.as_ref()),
                Action::Unmute { tag, label } => {
                    self.unmute(&tag, &label);
                    None
                }
                Action::Trigger { task_ids, server_id } => self.trigger(task_ids, server_id),
            };
            handles.extend(handle);
        }
        handles
    }

    /// Send unless muted. The send itself is detached.
    pub fn notify(
        &self,
        tag: &str,
        notification: Notification,
        label: Option<&MuteLabel>,
    ) -> Option<JoinHandle<()>> {
        if let Some(label) = label {
            let key = label.for_group(tag);
            if !self.mute.should_send(&key, Utc::now()) {
                tracing::debug!("Dispatcher: muted repeat notification {}: {}", key, notification.message);
                return None;
            }
        }

        let center = self.center.clone();
        let permits = self.permits.clone();
        let tag = tag.to_string();

        Some(tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            center.send(&tag, &notification).await;
        }))
    }

    pub fn unmute(&self, tag: &str, label: &MuteLabel) {
        self.mute.unmute(&label.for_group(tag));
    }

    pub fn trigger(&self, task_ids: Vec<u64>, server_id: u64) -> Option<JoinHandle<()>> {
        if task_ids.is_empty() {
            return None;
        }

        let tasks = self.tasks.clone();
        let permits = self.permits.clone();

        Some(tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            if let Err(e) = tasks.send_trigger_tasks(&task_ids, server_id).await {
                tracing::error!(
                    "Dispatcher: failed to trigger tasks {:?} on server {}: {}",
                    task_ids,
                    server_id,
                    e
                );
            }
        }))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::db::Monitor;
    use std::sync::Mutex;

    /// Records every notification it receives.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub sent: Mutex<Vec<Notification>>,
        pub fail: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
            self.sent.lock().unwrap().push(notification.clone());
            if self.fail {
                return Err(NotifyError::Http("boom".to_string()));
            }
            Ok(())
        }
    }

    /// Records trigger dispatches.
    #[derive(Default)]
    pub struct RecordingTasks {
        pub triggered: Mutex<Vec<(Vec<u64>, u64)>>,
    }

    #[async_trait]
    impl TaskSink for RecordingTasks {
        async fn send_probe(&self, _monitor: &Monitor, _server_id: u64) -> Result<(), NotifyError> {
            Ok(())
        }

        async fn send_trigger_tasks(&self, task_ids: &[u64], server_id: u64) -> Result<(), NotifyError> {
            self.triggered.lock().unwrap().push((task_ids.to_vec(), server_id));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn dispatcher(center: Arc<NotificationCenter>, tasks: Arc<RecordingTasks>) -> Dispatcher {
        Dispatcher::new(center, tasks, Arc::new(MuteStore::new()), 4)
    }

    #[tokio::test]
    async fn test_group_delivery_continues_after_failure() {
        let center = Arc::new(NotificationCenter::new());
        let failing = Arc::new(RecordingNotifier {
            fail: true,
            ..Default::default()
        });
        let ok = Arc::new(RecordingNotifier::default());
        center.add("ops", failing.clone());
        center.add("ops", ok.clone());

        let delivered = center.send("ops", &Notification::new("disk full")).await;
        assert_eq!(delivered, 1);
        assert_eq!(failing.sent.lock().unwrap().len(), 1);
        assert_eq!(ok.sent.lock().unwrap().len(), 1);
        assert_eq!(center.send("nobody", &Notification::new("x")).await, 0);
    }

    #[tokio::test]
    async fn test_muted_notify_is_skipped() {
        let center = Arc::new(NotificationCenter::new());
        let ok = Arc::new(RecordingNotifier::default());
        center.add("ops", ok.clone());
        let d = dispatcher(center, Arc::new(RecordingTasks::default()));
        let label = MuteLabel::state_changed(1);

        let first = d.notify("ops", Notification::new("down"), Some(&label));
        first.unwrap().await.unwrap();
        assert!(d.notify("ops", Notification::new("down"), Some(&label)).is_none());

        d.unmute("ops", &label);
        d.notify("ops", Notification::new("down"), Some(&label))
            .unwrap()
            .await
            .unwrap();

        // unlabelled notifications bypass the mute store
        d.notify("ops", Notification::new("rotated"), None).unwrap().await.unwrap();
        assert_eq!(ok.sent.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_apply_runs_actions_in_order() {
        let center = Arc::new(NotificationCenter::new());
        let ok = Arc::new(RecordingNotifier::default());
        center.add("ops", ok.clone());
        let tasks = Arc::new(RecordingTasks::default());
        let d = dispatcher(center, tasks.clone());
        let label = MuteLabel::incident(1, 2);

        let actions = vec![
            Action::Notify {
                tag: "ops".to_string(),
                notification: Notification::new("first"),
                label: Some(label.clone()),
            },
            Action::Unmute {
                tag: "ops".to_string(),
                label: label.clone(),
            },
            Action::Notify {
                tag: "ops".to_string(),
                notification: Notification::new("second"),
                label: Some(label),
            },
            Action::Trigger {
                task_ids: vec![5, 6],
                server_id: 2,
            },
            Action::Trigger {
                task_ids: vec![],
                server_id: 2,
            },
        ];

        let handles = d.apply(actions);
        assert_eq!(handles.len(), 3);
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(ok.sent.lock().unwrap().len(), 2);
        assert_eq!(*tasks.triggered.lock().unwrap(), vec![(vec![5, 6], 2)]);
    }
}
