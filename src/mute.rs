//! Notification muting with exponential backoff.
//!
//! The first notification for a label goes out immediately and opens a
//! 15 minute quiet window. Each notification after a window has elapsed
//! doubles the next window, up to one day. Unmuting drops the entry.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};

/// Quiet window opened by the first notification for a label.
pub fn first_notification_delay() -> Duration {
    Duration::minutes(15)
}

/// Upper bound on the quiet window.
pub fn max_notification_delay() -> Duration {
    Duration::hours(24)
}

/// Cache entries outlive their quiet window by this much.
fn cache_grace() -> Duration {
    Duration::minutes(10)
}

/// A map whose entries expire at a fixed instant.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    entries: HashMap<K, (V, DateTime<Utc>)>,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Get a live entry, dropping it if it has expired.
    pub fn get(&mut self, key: &K, now: DateTime<Utc>) -> Option<V> {
        match self.entries.get(key) {
            Some((_, expires_at)) if *expires_at <= now => {
                self.entries.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }

    pub fn insert(&mut self, key: K, value: V, ttl: Duration, now: DateTime<Utc>) {
        self.entries.insert(key, (value, now + ttl));
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(v, _)| v)
    }

    /// Drop every expired entry and return how many were removed.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, (_, expires_at)| *expires_at > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Eq + Hash, V: Clone> Default for TtlCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Backoff state stored against a mute label.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NotificationHistory {
    pub duration: Duration,
    pub until: DateTime<Utc>,
}

/// Identifies one alertable condition for backoff purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MuteLabel(String);

impl MuteLabel {
    pub fn state_changed(monitor_id: u64) -> Self {
        Self(format!("ssc-{}", monitor_id))
    }

    pub fn latency_min(monitor_id: u64) -> Self {
        Self(format!("sln-{}", monitor_id))
    }

    pub fn latency_max(monitor_id: u64) -> Self {
        Self(format!("slm-{}", monitor_id))
    }

    pub fn tls(monitor_id: u64, extra: &str) -> Self {
        Self(format!("stls-{}-{}", monitor_id, extra))
    }

    pub fn incident(alert_id: u64, server_id: u64) -> Self {
        Self(format!("sei-{}-{}", alert_id, server_id))
    }

    pub fn incident_resolved(alert_id: u64, server_id: u64) -> Self {
        Self(format!("seir-{}-{}", alert_id, server_id))
    }

    /// Full cache key: the same event on different groups never shares state.
    pub fn for_group(&self, tag: &str) -> String {
        format!("{}:{}", self.0, tag)
    }
}

impl fmt::Display for MuteLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shared suppression state for every notification path.
#[derive(Debug, Default)]
pub struct MuteStore {
    cache: Mutex<TtlCache<String, NotificationHistory>>,
}

impl MuteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether a notification under `key` goes out at `now`,
    /// updating the backoff window when it does.
    pub fn should_send(&self, key: &str, now: DateTime<Utc>) -> bool {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);

        let next = match cache.get(&key.to_string(), now) {
            Some(history) if now <= history.until => return false,
            Some(history) => {
                let duration = (history.duration * 2).min(max_notification_delay());
                NotificationHistory {
                    duration,
                    until: now + duration,
                }
            }
            None => NotificationHistory {
                duration: first_notification_delay(),
                until: now + first_notification_delay(),
            },
        };

        cache.insert(key.to_string(), next, next.duration + cache_grace(), now);
        true
    }

    /// Forget the backoff state for `key`.
    pub fn unmute(&self, key: &str) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.remove(&key.to_string());
    }

    /// Current backoff state for `key`, if any.
    pub fn history(&self, key: &str, now: DateTime<Utc>) -> Option<NotificationHistory> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.get(&key.to_string(), now)
    }

    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.purge_expired(now)
    }
}
