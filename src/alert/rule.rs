//! Threshold snapshots and the window check.

use crate::db::{AlertRule, Rule, RuleKind};
use crate::server::Server;

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Seconds without a report before a server counts as offline.
pub const OFFLINE_AFTER_SECS: i64 = 6;

/// Share of failing samples in a window above which a threshold rule fails.
pub const FAIL_RATIO: f64 = 0.7;

/// One evaluation of an alert rule: a failure description per sub-rule, `None` when passing.
pub type Point = Vec<Option<String>>;

fn percentage(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (used * 100 / total) as f64
}

/// Current value of a threshold metric.
pub fn metric_value(kind: RuleKind, server: &Server) -> f64 {
    let s = &server.state;
    let h = &server.host;
    match kind {
        RuleKind::Cpu => s.cpu,
        RuleKind::Memory => percentage(s.mem_used, h.mem_total),
        RuleKind::Swap => percentage(s.swap_used, h.swap_total),
        RuleKind::Disk => percentage(s.disk_used, h.disk_total),
        RuleKind::NetInSpeed => s.net_in_speed as f64,
        RuleKind::NetOutSpeed => s.net_out_speed as f64,
        RuleKind::NetAllSpeed => (s.net_in_speed + s.net_out_speed) as f64,
        RuleKind::TransferIn => s.net_in_transfer as f64,
        RuleKind::TransferOut => s.net_out_transfer as f64,
        RuleKind::TransferAll => (s.net_in_transfer + s.net_out_transfer) as f64,
        RuleKind::Load1 => s.load1,
        RuleKind::Load5 => s.load5,
        RuleKind::Load15 => s.load15,
        RuleKind::ProcessCount => s.process_count as f64,
        RuleKind::TcpConnCount => s.tcp_conn_count as f64,
        RuleKind::UdpConnCount => s.udp_conn_count as f64,
        RuleKind::Offline | RuleKind::TransferInCycle | RuleKind::TransferOutCycle | RuleKind::TransferAllCycle => 0.0,
    }
}

/// Compare a value against `[min, max]`; zero bounds are open.
pub fn check_bounds(kind: RuleKind, value: f64, min: f64, max: f64) -> Option<String> {
    if max > 0.0 && value > max {
        Some(format!("{} {:.2} > {}", kind.as_str(), value, max))
    } else if min > 0.0 && value < min {
        Some(format!("{} {:.2} < {}", kind.as_str(), value, min))
    } else {
        None
    }
}

/// Snapshot of an instantaneous rule for one server.
pub fn threshold_snapshot(rule: &Rule, server: &Server, now: DateTime<Utc>) -> Option<String> {
    if !rule.covers(server.id) {
        return None;
    }

    if rule.kind == RuleKind::Offline {
        return match server.last_active {
            Some(t) if (now - t).num_seconds() <= OFFLINE_AFTER_SECS => None,
            Some(t) => Some(format!("offline since {}", t.format("%Y-%m-%d %H:%M:%S"))),
            None => Some("offline, never reported".to_string()),
        };
    }

    check_bounds(rule.kind, metric_value(rule.kind, server), rule.min, rule.max)
}

/// Evaluations a threshold rule looks back over.
pub fn window_len(duration_secs: u64, interval: Duration) -> usize {
    let step = interval.as_secs().max(1);
    (duration_secs.div_ceil(step) as usize).max(1)
}

/// Evaluate an alert over its history.
///
/// Returns the history length worth keeping and whether the alert passes.
/// The alert fails only when every sub-rule fails.
pub fn check(alert: &AlertRule, points: &[Point], interval: Duration) -> (usize, bool) {
    if alert.rules.is_empty() {
        return (1, true);
    }

    let failed_at = |p: &Point, i: usize| p.get(i).is_some_and(Option::is_some);

    let mut keep = 1;
    let mut failed = 0;

    for (i, rule) in alert.rules.iter().enumerate() {
        if rule.is_cycle_transfer() {
            if points.last().is_some_and(|p| failed_at(p, i)) {
                failed += 1;
            }
            continue;
        }

        let window = window_len(rule.duration, interval);
        keep = keep.max(window);
        if points.len() < window {
            continue;
        }

        let fails = points[points.len() - window..]
            .iter()
            .filter(|p| failed_at(p, i))
            .count();
        if fails as f64 / window as f64 > FAIL_RATIO {
            failed += 1;
        }
    }

    (keep, failed != alert.rules.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Cover;
    use crate::server::{HostInfo, HostState};
    use chrono::Duration as ChronoDuration;

    const TICK: Duration = Duration::from_secs(3);

    fn server() -> Server {
        let mut s = Server::new(1, "edge-1");
        s.host = HostInfo {
            ip: "10.0.0.1".to_string(),
            mem_total: 1000,
            swap_total: 0,
            disk_total: 2000,
        };
        s.state = HostState {
            cpu: 91.5,
            mem_used: 500,
            disk_used: 1900,
            net_in_speed: 10,
            net_out_speed: 30,
            load1: 2.5,
            ..Default::default()
        };
        s.last_active = Some(Utc::now());
        s
    }

    fn alert(rules: Vec<Rule>) -> AlertRule {
        AlertRule {
            id: 1,
            name: "hot".to_string(),
            rules,
            ..Default::default()
        }
    }

    #[test]
    fn test_threshold_snapshot() {
        let s = server();
        let now = Utc::now();

        assert!(threshold_snapshot(&Rule::threshold(RuleKind::Cpu, 0.0, 90.0, 10), &s, now).is_some());
        assert!(threshold_snapshot(&Rule::threshold(RuleKind::Cpu, 0.0, 95.0, 10), &s, now).is_none());
        assert!(threshold_snapshot(&Rule::threshold(RuleKind::Memory, 60.0, 0.0, 10), &s, now).is_some());
        assert!(threshold_snapshot(&Rule::threshold(RuleKind::Disk, 0.0, 90.0, 10), &s, now).is_some());
        assert!(threshold_snapshot(&Rule::threshold(RuleKind::Swap, 0.0, 1.0, 10), &s, now).is_none());
        assert_eq!(metric_value(RuleKind::NetAllSpeed, &s), 40.0);
        assert!(threshold_snapshot(&Rule::threshold(RuleKind::Load1, 0.0, 2.0, 10), &s, now).is_some());
    }

    #[test]
    fn test_threshold_respects_cover() {
        let s = server();
        let mut rule = Rule::threshold(RuleKind::Cpu, 0.0, 50.0, 10);
        rule.ignore.insert(1);
        assert!(threshold_snapshot(&rule, &s, Utc::now()).is_none());

        rule.cover = Cover::IgnoreAll;
        assert!(threshold_snapshot(&rule, &s, Utc::now()).is_some());
    }

    #[test]
    fn test_offline() {
        let mut s = server();
        let rule = Rule::threshold(RuleKind::Offline, 0.0, 0.0, 10);
        let now = Utc::now();

        s.last_active = Some(now - ChronoDuration::seconds(3));
        assert!(threshold_snapshot(&rule, &s, now).is_none());

        s.last_active = Some(now - ChronoDuration::seconds(30));
        assert!(threshold_snapshot(&rule, &s, now).is_some());

        s.last_active = None;
        assert!(threshold_snapshot(&rule, &s, now).is_some());
    }

    #[test]
    fn test_window_len() {
        assert_eq!(window_len(90, TICK), 30);
        assert_eq!(window_len(10, TICK), 4);
        assert_eq!(window_len(0, TICK), 1);
        assert_eq!(window_len(5, Duration::from_millis(100)), 5);
    }

    #[test]
    fn test_check_fail_then_recover() {
        let a = alert(vec![Rule::threshold(RuleKind::Cpu, 0.0, 90.0, 90)]);
        let mut points: Vec<Point> = Vec::new();

        for _ in 0..30 {
            points.push(vec![Some("cpu".to_string())]);
        }
        let (keep, passed) = check(&a, &points, TICK);
        assert_eq!(keep, 30);
        assert!(!passed);

        for _ in 0..30 {
            points.push(vec![None]);
        }
        let (_, passed) = check(&a, &points, TICK);
        assert!(passed);
    }

    #[test]
    fn test_check_short_history_passes() {
        let a = alert(vec![Rule::threshold(RuleKind::Cpu, 0.0, 90.0, 90)]);
        let points: Vec<Point> = (0..29).map(|_| vec![Some("cpu".to_string())]).collect();
        assert!(check(&a, &points, TICK).1);
    }

    #[test]
    fn test_check_ratio() {
        let a = alert(vec![Rule::threshold(RuleKind::Cpu, 0.0, 90.0, 30)]);
        // 7 of 10 failing is not above 70%
        let mut points: Vec<Point> = (0..10)
            .map(|i| if i < 7 { vec![Some("x".to_string())] } else { vec![None] })
            .collect();
        assert!(check(&a, &points, TICK).1);

        points[7] = vec![Some("x".to_string())];
        assert!(!check(&a, &points, TICK).1);
    }

    #[test]
    fn test_check_fails_only_when_all_rules_fail() {
        let mut cycle = Rule::threshold(RuleKind::TransferAllCycle, 0.0, 100.0, 0);
        cycle.cycle_interval = 1;
        let a = alert(vec![Rule::threshold(RuleKind::Cpu, 0.0, 90.0, 3), cycle]);

        let both = vec![vec![Some("cpu".to_string()), Some("transfer".to_string())]];
        assert!(!check(&a, &both, TICK).1);

        let one = vec![vec![Some("cpu".to_string()), None]];
        assert!(check(&a, &one, TICK).1);
    }

    #[test]
    fn test_check_empty_alert_passes() {
        assert_eq!(check(&alert(vec![]), &[], TICK), (1, true));
    }
}
