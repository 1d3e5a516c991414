use super::SentinelError;
use crate::db::Monitor;

use async_trait::async_trait;
use std::collections::BTreeMap;

/// Periodic probe scheduling for monitors.
#[async_trait]
pub trait ProbeSchedule: Send + Sync {
    /// Start (or restart) the schedule for a monitor.
    async fn register(&self, monitor: &Monitor) -> Result<(), SentinelError>;

    async fn unregister(&self, monitor_id: u64);
}

/// Monitor definitions owned by the sentinel.
#[derive(Debug, Default)]
pub struct MonitorRegistry {
    monitors: BTreeMap<u64, Monitor>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject monitors that cannot be scheduled as service probes.
    pub fn validate(monitor: &Monitor) -> Result<(), SentinelError> {
        if monitor.id == 0 {
            return Err(SentinelError::InvalidSchedule("monitor has no id".to_string()));
        }
        if !monitor.probe_type.is_service_probe() {
            return Err(SentinelError::InvalidSchedule(format!(
                "monitor {} has non-service probe type {:?}",
                monitor.id, monitor.probe_type
            )));
        }
        if monitor.target.trim().is_empty() {
            return Err(SentinelError::InvalidSchedule(format!(
                "monitor {} has an empty target",
                monitor.id
            )));
        }
        Ok(())
    }

    /// Insert or replace. Returns true when the monitor is new.
    pub fn upsert(&mut self, monitor: Monitor) -> bool {
        self.monitors.insert(monitor.id, monitor).is_none()
    }

    pub fn remove(&mut self, id: u64) -> Option<Monitor> {
        self.monitors.remove(&id)
    }

    pub fn get(&self, id: u64) -> Option<&Monitor> {
        self.monitors.get(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.monitors.contains_key(&id)
    }

    /// Monitors ordered by ID.
    pub fn list(&self) -> Vec<Monitor> {
        self.monitors.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.monitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ProbeType;

    fn monitor(id: u64) -> Monitor {
        Monitor {
            id,
            name: format!("m{}", id),
            target: "https://example.com".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate() {
        assert!(MonitorRegistry::validate(&monitor(1)).is_ok());

        let mut m = monitor(1);
        m.probe_type = ProbeType::Command;
        assert!(matches!(
            MonitorRegistry::validate(&m),
            Err(SentinelError::InvalidSchedule(_))
        ));

        let mut m = monitor(1);
        m.target = "  ".to_string();
        assert!(MonitorRegistry::validate(&m).is_err());
        assert!(MonitorRegistry::validate(&monitor(0)).is_err());
    }

    #[test]
    fn test_upsert_and_list_order() {
        let mut registry = MonitorRegistry::new();
        assert!(registry.upsert(monitor(3)));
        assert!(registry.upsert(monitor(1)));
        assert!(!registry.upsert(monitor(3)));

        let ids: Vec<u64> = registry.list().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 3]);

        assert!(registry.remove(1).is_some());
        assert!(!registry.contains(1));
        assert_eq!(registry.len(), 1);
    }
}
