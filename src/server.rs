//! Live server set reported by agents.
//!
//! The transport layer keeps this registry current through `upsert`,
//! `report_state` and `remove`; the engines only read it.

use crate::notify::ServerContext;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tokio::sync::RwLock;

/// Hide the middle of IPv4 and IPv6 addresses: `103.80.236.249` becomes `103.****.249`.
pub fn mask_ip(ip: &str) -> String {
    static IPV4: OnceLock<Regex> = OnceLock::new();
    static IPV6: OnceLock<Regex> = OnceLock::new();

    let ipv4 = IPV4.get_or_init(|| Regex::new(r"(\d*\.).*(\.\d*)").unwrap());
    let ipv6 = IPV6.get_or_init(|| Regex::new(r"(\w*:\w*:).*(:\w*:\w*)").unwrap());

    let masked = ipv4.replace_all(ip, "${1}****${2}");
    ipv6.replace_all(&masked, "${1}****${2}").into_owned()
}

/// Static host facts sent when an agent connects.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HostInfo {
    pub ip: String,
    pub mem_total: u64,
    pub swap_total: u64,
    pub disk_total: u64,
}

/// Latest host metrics sent by an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HostState {
    pub cpu: f64,
    pub mem_used: u64,
    pub swap_used: u64,
    pub disk_used: u64,
    pub net_in_transfer: u64,
    pub net_out_transfer: u64,
    pub net_in_speed: u64,
    pub net_out_speed: u64,
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
    pub process_count: u64,
    pub tcp_conn_count: u64,
    pub udp_conn_count: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Server {
    pub id: u64,
    pub name: String,
    pub host: HostInfo,
    pub state: HostState,
    pub last_active: Option<DateTime<Utc>>,
    /// Counter values at the last persisted transfer record.
    pub transfer_in_snapshot: u64,
    pub transfer_out_snapshot: u64,
}

impl Server {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            ..Default::default()
        }
    }

    /// Identity used in notification templates.
    pub fn context(&self, plain_ip: bool) -> ServerContext {
        ServerContext {
            id: self.id,
            name: self.name.clone(),
            ip: if plain_ip {
                self.host.ip.clone()
            } else {
                mask_ip(&self.host.ip)
            },
        }
    }

    /// Inbound bytes since the last persisted transfer record.
    pub fn pending_transfer_in(&self) -> u64 {
        counter_delta(self.state.net_in_transfer, self.transfer_in_snapshot)
    }

    /// Outbound bytes since the last persisted transfer record.
    pub fn pending_transfer_out(&self) -> u64 {
        counter_delta(self.state.net_out_transfer, self.transfer_out_snapshot)
    }
}

/// A counter that went backwards means the agent restarted and began from zero.
fn counter_delta(current: u64, snapshot: u64) -> u64 {
    if current >= snapshot {
        current - snapshot
    } else {
        current
    }
}

/// Thread-safe registry of live servers keyed by ID.
#[derive(Debug, Default)]
pub struct ServerRegistry {
    servers: RwLock<BTreeMap<u64, Server>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a server's identity and host info, keeping live counters.
    pub async fn upsert(&self, id: u64, name: impl Into<String>, host: HostInfo) {
        let mut servers = self.servers.write().await;
        let server = servers.entry(id).or_insert_with(|| Server::new(id, ""));
        server.name = name.into();
        server.host = host;
    }

    /// Record a metrics report from a server's agent.
    pub async fn report_state(&self, id: u64, state: HostState, at: DateTime<Utc>) -> bool {
        let mut servers = self.servers.write().await;
        match servers.get_mut(&id) {
            Some(server) => {
                server.state = state;
                server.last_active = Some(at);
                true
            }
            None => {
                tracing::warn!("ServerRegistry: state report for unknown server {}", id);
                false
            }
        }
    }

    pub async fn remove(&self, id: u64) -> Option<Server> {
        self.servers.write().await.remove(&id)
    }

    /// Point-in-time copy of all servers ordered by ID.
    pub async fn snapshot(&self) -> Vec<Server> {
        self.servers.read().await.values().cloned().collect()
    }

    pub async fn name_of(&self, id: u64) -> Option<String> {
        self.servers.read().await.get(&id).map(|s| s.name.clone())
    }

    /// Notification identity of a server; unknown servers get a bare ID.
    pub async fn context_of(&self, id: u64, plain_ip: bool) -> ServerContext {
        match self.servers.read().await.get(&id) {
            Some(s) => s.context(plain_ip),
            None => ServerContext {
                id,
                ..Default::default()
            },
        }
    }

    /// Advance transfer snapshots and return each server's delta since the previous call.
    pub async fn take_transfer_deltas(&self) -> Vec<(u64, u64, u64)> {
        let mut servers = self.servers.write().await;
        servers
            .values_mut()
            .map(|s| {
                let delta = (s.id, s.pending_transfer_in(), s.pending_transfer_out());
                s.transfer_in_snapshot = s.state.net_in_transfer;
                s.transfer_out_snapshot = s.state.net_out_transfer;
                delta
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_and_report() {
        let registry = ServerRegistry::new();
        registry.upsert(1, "edge-1", HostInfo::default()).await;

        let state = HostState {
            cpu: 42.0,
            ..Default::default()
        };
        assert!(registry.report_state(1, state, Utc::now()).await);
        assert!(!registry.report_state(2, HostState::default(), Utc::now()).await);

        let servers = registry.snapshot().await;
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].state.cpu, 42.0);
        assert!(servers[0].last_active.is_some());
        assert_eq!(registry.name_of(1).await.as_deref(), Some("edge-1"));
    }

    #[test]
    fn test_mask_ip() {
        let cases = [
            (
                "103.80.236.249/d5ce:d811:cdb8:067a:a873:2076:9521:9d2d",
                "103.****.249/d5ce:d811:****:9521:9d2d",
            ),
            (
                "3.80.236.29/d5ce::cdb8:067a:a873:2076:9521:9d2d",
                "3.****.29/d5ce::****:9521:9d2d",
            ),
            (
                "3.80.236.9/d5ce::cdb8:067a:a873:2076::9d2d",
                "3.****.9/d5ce::****::9d2d",
            ),
            ("10.0.0.1", "10.****.1"),
        ];
        for (input, expected) in cases {
            assert_eq!(mask_ip(input), expected);
        }
    }

    #[tokio::test]
    async fn test_context_masks_ip() {
        let registry = ServerRegistry::new();
        let host = HostInfo {
            ip: "192.168.1.20".to_string(),
            ..Default::default()
        };
        registry.upsert(4, "db", host).await;

        let ctx = registry.context_of(4, false).await;
        assert_eq!(ctx.ip, "192.****.20");
        assert_eq!(registry.context_of(4, true).await.ip, "192.168.1.20");
        assert_eq!(registry.context_of(9, false).await.name, "");
    }

    #[tokio::test]
    async fn test_transfer_deltas() {
        let registry = ServerRegistry::new();
        registry.upsert(1, "edge-1", HostInfo::default()).await;

        let mut state = HostState {
            net_in_transfer: 1000,
            net_out_transfer: 200,
            ..Default::default()
        };
        registry.report_state(1, state.clone(), Utc::now()).await;
        assert_eq!(registry.take_transfer_deltas().await, vec![(1, 1000, 200)]);

        state.net_in_transfer = 1500;
        state.net_out_transfer = 250;
        registry.report_state(1, state.clone(), Utc::now()).await;
        assert_eq!(registry.take_transfer_deltas().await, vec![(1, 500, 50)]);

        // agent restart resets counters
        state.net_in_transfer = 40;
        state.net_out_transfer = 4;
        registry.report_state(1, state, Utc::now()).await;
        assert_eq!(registry.take_transfer_deltas().await, vec![(1, 40, 4)]);
    }
}
