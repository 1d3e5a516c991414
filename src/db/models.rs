//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Default probe interval when a monitor is saved with `duration == 0`.
pub const DEFAULT_MONITOR_DURATION: u64 = 30;

/// Kind of probe an agent runs for a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeType {
    HttpGet,
    IcmpPing,
    TcpPing,
    Command,
    Terminal,
    Upgrade,
}

impl ProbeType {
    pub fn code(self) -> i64 {
        match self {
            ProbeType::HttpGet => 1,
            ProbeType::IcmpPing => 2,
            ProbeType::TcpPing => 3,
            ProbeType::Command => 4,
            ProbeType::Terminal => 5,
            ProbeType::Upgrade => 6,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(ProbeType::HttpGet),
            2 => Some(ProbeType::IcmpPing),
            3 => Some(ProbeType::TcpPing),
            4 => Some(ProbeType::Command),
            5 => Some(ProbeType::Terminal),
            6 => Some(ProbeType::Upgrade),
            _ => None,
        }
    }

    /// Whether results of this probe feed the service statistics.
    pub fn is_service_probe(self) -> bool {
        matches!(self, ProbeType::HttpGet | ProbeType::IcmpPing | ProbeType::TcpPing)
    }

    /// Latency-style probes whose history writes are coalesced per reporter.
    pub fn is_ping(self) -> bool {
        matches!(self, ProbeType::IcmpPing | ProbeType::TcpPing)
    }
}

/// Server coverage policy shared by monitors and alert rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cover {
    /// Every server except the listed ones.
    #[default]
    All,
    /// Only the listed servers.
    IgnoreAll,
}

impl Cover {
    pub fn code(self) -> i64 {
        match self {
            Cover::All => 0,
            Cover::IgnoreAll => 1,
        }
    }

    pub fn from_code(code: i64) -> Self {
        if code == 1 {
            Cover::IgnoreAll
        } else {
            Cover::All
        }
    }

    /// Resolve whether `server_id` is covered given the exception list.
    pub fn covers(self, listed: &BTreeSet<u64>, server_id: u64) -> bool {
        match self {
            Cover::All => !listed.contains(&server_id),
            Cover::IgnoreAll => listed.contains(&server_id),
        }
    }
}

/// A service probe definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Monitor {
    pub id: u64,
    pub name: String,
    pub probe_type: ProbeType,
    pub target: String,
    /// Probe interval in seconds.
    pub duration: u64,
    pub cover: Cover,
    pub skip_servers: BTreeSet<u64>,
    pub notify: bool,
    pub notification_tag: String,
    pub latency_notify: bool,
    pub min_latency: f32,
    pub max_latency: f32,
    pub enable_trigger_task: bool,
    pub fail_trigger_tasks: Vec<u64>,
    pub recover_trigger_tasks: Vec<u64>,
    pub enable_show_in_service: bool,
}

impl Default for Monitor {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            probe_type: ProbeType::HttpGet,
            target: String::new(),
            duration: DEFAULT_MONITOR_DURATION,
            cover: Cover::All,
            skip_servers: BTreeSet::new(),
            notify: false,
            notification_tag: "default".to_string(),
            latency_notify: false,
            min_latency: 0.0,
            max_latency: 0.0,
            enable_trigger_task: false,
            fail_trigger_tasks: Vec::new(),
            recover_trigger_tasks: Vec::new(),
            enable_show_in_service: false,
        }
    }
}

impl Monitor {
    /// Probe interval in seconds, applying the default for zero.
    pub fn interval_secs(&self) -> u64 {
        if self.duration == 0 {
            DEFAULT_MONITOR_DURATION
        } else {
            self.duration
        }
    }

    pub fn covers(&self, server_id: u64) -> bool {
        self.cover.covers(&self.skip_servers, server_id)
    }
}

/// Cycle unit for accumulated transfer rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleUnit {
    #[default]
    Hour,
    Day,
    Week,
    Month,
    Year,
}

/// Metric a rule inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Cpu,
    Memory,
    Swap,
    Disk,
    NetInSpeed,
    NetOutSpeed,
    NetAllSpeed,
    TransferIn,
    TransferOut,
    TransferAll,
    Load1,
    Load5,
    Load15,
    ProcessCount,
    TcpConnCount,
    UdpConnCount,
    Offline,
    TransferInCycle,
    TransferOutCycle,
    TransferAllCycle,
}

impl RuleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleKind::Cpu => "cpu",
            RuleKind::Memory => "memory",
            RuleKind::Swap => "swap",
            RuleKind::Disk => "disk",
            RuleKind::NetInSpeed => "net_in_speed",
            RuleKind::NetOutSpeed => "net_out_speed",
            RuleKind::NetAllSpeed => "net_all_speed",
            RuleKind::TransferIn => "transfer_in",
            RuleKind::TransferOut => "transfer_out",
            RuleKind::TransferAll => "transfer_all",
            RuleKind::Load1 => "load1",
            RuleKind::Load5 => "load5",
            RuleKind::Load15 => "load15",
            RuleKind::ProcessCount => "process_count",
            RuleKind::TcpConnCount => "tcp_conn_count",
            RuleKind::UdpConnCount => "udp_conn_count",
            RuleKind::Offline => "offline",
            RuleKind::TransferInCycle => "transfer_in_cycle",
            RuleKind::TransferOutCycle => "transfer_out_cycle",
            RuleKind::TransferAllCycle => "transfer_all_cycle",
        }
    }

    pub fn is_cycle_transfer(self) -> bool {
        matches!(
            self,
            RuleKind::TransferInCycle | RuleKind::TransferOutCycle | RuleKind::TransferAllCycle
        )
    }
}

/// One constituent rule of an [`AlertRule`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(rename = "type")]
    pub kind: RuleKind,
    /// Lower bound; zero disables the check.
    #[serde(default)]
    pub min: f64,
    /// Upper bound; zero disables the check.
    #[serde(default)]
    pub max: f64,
    /// Seconds the condition must hold (threshold rules).
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub cover: Cover,
    #[serde(default)]
    pub ignore: BTreeSet<u64>,
    #[serde(default)]
    pub cycle_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cycle_interval: u64,
    #[serde(default)]
    pub cycle_unit: CycleUnit,
}

impl Rule {
    pub fn threshold(kind: RuleKind, min: f64, max: f64, duration: u64) -> Self {
        Self {
            kind,
            min,
            max,
            duration,
            cover: Cover::All,
            ignore: BTreeSet::new(),
            cycle_start: None,
            cycle_interval: 0,
            cycle_unit: CycleUnit::Hour,
        }
    }

    pub fn is_cycle_transfer(&self) -> bool {
        self.kind.is_cycle_transfer()
    }

    pub fn covers(&self, server_id: u64) -> bool {
        self.cover.covers(&self.ignore, server_id)
    }
}

/// A set of rules evaluated together against every server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: u64,
    pub name: String,
    pub rules: Vec<Rule>,
    pub enabled: bool,
    pub notification_tag: String,
    pub fail_trigger_tasks: Vec<u64>,
    pub recover_trigger_tasks: Vec<u64>,
}

impl Default for AlertRule {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            rules: Vec::new(),
            enabled: true,
            notification_tag: "default".to_string(),
            fail_trigger_tasks: Vec::new(),
            recover_trigger_tasks: Vec::new(),
        }
    }
}

/// A persisted service probe record.
///
/// Aggregate rows (one per full current window) carry no `server_id`;
/// coalesced ping rows carry the reporting server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorHistory {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub monitor_id: u64,
    pub server_id: Option<u64>,
    /// Average delay in milliseconds.
    pub avg_delay: f32,
    pub up: u64,
    pub down: u64,
    pub data: String,
}

/// Hourly transfer delta for one server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transfer {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub server_id: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_coverage() {
        let mut m = Monitor {
            skip_servers: [2u64].into_iter().collect(),
            ..Default::default()
        };
        assert!(m.covers(1));
        assert!(!m.covers(2));

        m.cover = Cover::IgnoreAll;
        assert!(!m.covers(1));
        assert!(m.covers(2));
    }

    #[test]
    fn test_interval_default() {
        let m = Monitor {
            duration: 0,
            ..Default::default()
        };
        assert_eq!(m.interval_secs(), DEFAULT_MONITOR_DURATION);
    }

    #[test]
    fn test_rule_json_shape() {
        let json = r#"{"type":"transfer_all_cycle","max":100,"cycle_interval":1,"cycle_unit":"month"}"#;
        let rule: Rule = serde_json::from_str(json).unwrap();
        assert_eq!(rule.kind, RuleKind::TransferAllCycle);
        assert!(rule.is_cycle_transfer());
        assert_eq!(rule.cycle_unit, CycleUnit::Month);
        assert_eq!(rule.cover, Cover::All);
    }

    #[test]
    fn test_probe_type_codes() {
        for t in [ProbeType::HttpGet, ProbeType::IcmpPing, ProbeType::TcpPing, ProbeType::Upgrade] {
            assert_eq!(ProbeType::from_code(t.code()), Some(t));
        }
        assert!(ProbeType::TcpPing.is_ping());
        assert!(!ProbeType::Command.is_service_probe());
    }
}
