//! Outbound task delivery to agents.
//!
//! The agent transport lives outside this crate; it plugs in by implementing
//! [`TaskSink`]. Without one, tasks are only logged.

use crate::db::Monitor;
use crate::notify::NotifyError;

use async_trait::async_trait;

#[async_trait]
pub trait TaskSink: Send + Sync {
    /// Ask one server's agent to run a monitor probe.
    async fn send_probe(&self, monitor: &Monitor, server_id: u64) -> Result<(), NotifyError>;

    /// Ask one server's agent to run trigger tasks.
    async fn send_trigger_tasks(&self, task_ids: &[u64], server_id: u64) -> Result<(), NotifyError>;
}

/// Sink used when no agent transport is attached.
#[derive(Debug, Default)]
pub struct LogTaskSink;

#[async_trait]
impl TaskSink for LogTaskSink {
    async fn send_probe(&self, monitor: &Monitor, server_id: u64) -> Result<(), NotifyError> {
        tracing::debug!(
            "TaskSink: probe {} ({}) -> server {}",
            monitor.id,
            monitor.target,
            server_id
        );
        Ok(())
    }

    async fn send_trigger_tasks(&self, task_ids: &[u64], server_id: u64) -> Result<(), NotifyError> {
        tracing::info!("TaskSink: trigger tasks {:?} -> server {}", task_ids, server_id);
        Ok(())
    }
}
