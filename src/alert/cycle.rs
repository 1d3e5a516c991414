//! Accumulated transfer within recurring cycles.

use super::rule::check_bounds;
use crate::db::{CycleUnit, DbError, Rule, RuleKind, Store};
use crate::server::Server;

use chrono::{DateTime, Duration, Months, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Shortest and longest re-query delays for a server's cycle total.
const MIN_REFRESH_SECS: i64 = 180;
const MAX_REFRESH_SECS: i64 = 1800;

/// Persisted per-server transfer totals.
pub trait TransferSource: Send + Sync {
    /// Bytes (in, out) recorded for a server since `since`.
    fn transfer_since(&self, server_id: u64, since: DateTime<Utc>) -> Result<(u64, u64), DbError>;
}

impl TransferSource for Store {
    fn transfer_since(&self, server_id: u64, since: DateTime<Utc>) -> Result<(u64, u64), DbError> {
        self.sum_transfer_since(server_id, since)
    }
}

fn boundary(origin: DateTime<Utc>, unit: CycleUnit, n: u32, k: u32) -> Option<DateTime<Utc>> {
    let steps = n.checked_mul(k)?;
    match unit {
        CycleUnit::Hour => origin.checked_add_signed(Duration::hours(steps as i64)),
        CycleUnit::Day => origin.checked_add_signed(Duration::days(steps as i64)),
        CycleUnit::Week => origin.checked_add_signed(Duration::weeks(steps as i64)),
        CycleUnit::Month => origin.checked_add_months(Months::new(steps)),
        CycleUnit::Year => origin.checked_add_months(Months::new(steps.checked_mul(12)?)),
    }
}

/// Upper bound on one unit in seconds, so `elapsed / longest` never overshoots.
fn longest_unit_secs(unit: CycleUnit) -> i64 {
    match unit {
        CycleUnit::Hour => 3600,
        CycleUnit::Day => 86_400,
        CycleUnit::Week => 7 * 86_400,
        CycleUnit::Month => 31 * 86_400,
        CycleUnit::Year => 366 * 86_400,
    }
}

/// The `[from, to)` cycle containing `now`. Before the first cycle starts, that first cycle.
pub fn cycle_window(rule: &Rule, now: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let origin = rule.cycle_start?;
    let n = u32::try_from(rule.cycle_interval).unwrap_or(u32::MAX).max(1);

    let mut k = if now > origin {
        let elapsed = (now - origin).num_seconds();
        u32::try_from(elapsed / (longest_unit_secs(rule.cycle_unit) * n as i64)).unwrap_or(u32::MAX)
    } else {
        0
    };

    loop {
        let next = boundary(origin, rule.cycle_unit, n, k.checked_add(1)?)?;
        if next > now {
            return Some((boundary(origin, rule.cycle_unit, n, k)?, next));
        }
        k += 1;
    }
}

/// How long a cached total stays fresh: shorter as the total nears `max`.
pub fn refresh_delay(max: u64, value: u64) -> Duration {
    let secs = if max == 0 || value >= max {
        MIN_REFRESH_SECS
    } else {
        (MAX_REFRESH_SECS as f64 * (max - value) as f64 / max as f64) as i64
    };
    Duration::seconds(secs.max(MIN_REFRESH_SECS))
}

fn pick(kind: RuleKind, bytes_in: u64, bytes_out: u64) -> u64 {
    match kind {
        RuleKind::TransferInCycle => bytes_in,
        RuleKind::TransferOutCycle => bytes_out,
        _ => bytes_in + bytes_out,
    }
}

/// Per-rule cycle window with cached per-server totals.
#[derive(Debug, Clone, Serialize)]
pub struct CycleTransferStats {
    pub alert_id: u64,
    pub name: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub max: u64,
    pub min: u64,
    pub server_name: BTreeMap<u64, String>,
    pub transfer: BTreeMap<u64, u64>,
    #[serde(skip)]
    pub next_update: HashMap<u64, DateTime<Utc>>,
}

impl CycleTransferStats {
    pub fn new(alert_id: u64, name: &str, rule: &Rule, now: DateTime<Utc>) -> Option<Self> {
        let (from, to) = cycle_window(rule, now)?;
        Some(Self {
            alert_id,
            name: name.to_string(),
            from,
            to,
            max: rule.max.max(0.0) as u64,
            min: rule.min.max(0.0) as u64,
            server_name: BTreeMap::new(),
            transfer: BTreeMap::new(),
            next_update: HashMap::new(),
        })
    }

    /// Move to the cycle containing `now`, dropping cached totals if it changed.
    pub fn advance(&mut self, rule: &Rule, now: DateTime<Utc>) {
        let Some((from, to)) = cycle_window(rule, now) else {
            return;
        };
        if from != self.from {
            self.from = from;
            self.to = to;
            self.transfer.clear();
            self.next_update.clear();
        }
    }

    /// Compare a server's cycle total against the bounds, refreshing it when due.
    pub fn snapshot(
        &mut self,
        rule: &Rule,
        server: &Server,
        source: &dyn TransferSource,
        now: DateTime<Utc>,
    ) -> Option<String> {
        if !rule.covers(server.id) {
            return None;
        }

        self.server_name.insert(server.id, server.name.clone());

        let due = self.next_update.get(&server.id).map_or(true, |t| *t <= now);
        if due {
            match source.transfer_since(server.id, self.from) {
                Ok((bytes_in, bytes_out)) => {
                    let value = pick(
                        rule.kind,
                        bytes_in + server.pending_transfer_in(),
                        bytes_out + server.pending_transfer_out(),
                    );
                    self.transfer.insert(server.id, value);
                    self.next_update.insert(server.id, now + refresh_delay(self.max, value));
                }
                Err(e) => {
                    tracing::error!(
                        "AlertSentinel: failed to load cycle transfer for server {}: {}",
                        server.id,
                        e
                    );
                }
            }
        }

        let value = self.transfer.get(&server.id).copied()?;
        check_bounds(rule.kind, value as f64, self.min as f64, self.max as f64)
    }
}
