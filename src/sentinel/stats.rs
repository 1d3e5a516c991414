//! Per-monitor rolling statistics.
//!
//! Three granularities are kept together: the current window (last 30
//! samples), today's accumulator, and a 30-day array whose last slot mirrors
//! today. All of them are mutated through [`MonitorStats`] only.

use super::ring::RingBuffer;
use super::status::StatusCode;

use serde::Serialize;
use std::collections::HashMap;

/// Samples in the current window.
pub const CURRENT_WINDOW: usize = 30;

/// Days covered by the monthly arrays; the last slot is today.
pub const MONTH_DAYS: usize = 30;

const TODAY_SLOT: usize = MONTH_DAYS - 1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub successful: bool,
    /// Milliseconds.
    pub delay: f32,
}

/// Counters since local midnight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TodayStats {
    pub up: u64,
    pub down: u64,
    /// Mean delay of successful samples.
    pub delay: f32,
}

impl TodayStats {
    pub fn record(&mut self, sample: Sample) {
        if sample.successful {
            self.delay = (self.delay * self.up as f32 + sample.delay) / (self.up + 1) as f32;
            self.up += 1;
        } else {
            self.down += 1;
        }
    }
}

/// Summary of the current window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CurrentStats {
    pub up: u64,
    pub down: u64,
    pub avg_delay: f32,
}

impl CurrentStats {
    pub fn from_samples<'a>(samples: impl Iterator<Item = &'a Sample>) -> Self {
        let mut stats = Self::default();
        for s in samples {
            if s.successful {
                stats.up += 1;
                stats.avg_delay += (s.delay - stats.avg_delay) / stats.up as f32;
            } else {
                stats.down += 1;
            }
        }
        stats
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_counts(self.up, self.down)
    }
}

/// Trailing 30 days, oldest first, with running totals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyStats {
    pub up: [u64; MONTH_DAYS],
    pub down: [u64; MONTH_DAYS],
    pub delay: [f32; MONTH_DAYS],
    pub total_up: u64,
    pub total_down: u64,
}

impl Default for MonthlyStats {
    fn default() -> Self {
        Self {
            up: [0; MONTH_DAYS],
            down: [0; MONTH_DAYS],
            delay: [0.0; MONTH_DAYS],
            total_up: 0,
            total_down: 0,
        }
    }
}

impl MonthlyStats {
    /// Add a past day's counts. Slot `TODAY_SLOT` is owned by `sync_today`.
    pub fn add_day(&mut self, slot: usize, up: u64, down: u64, delay: f32) {
        if slot >= TODAY_SLOT {
            return;
        }
        self.up[slot] += up;
        self.down[slot] += down;
        self.delay[slot] = delay;
        self.total_up += up;
        self.total_down += down;
    }

    /// Mirror today's accumulator into the last slot without double counting.
    pub fn sync_today(&mut self, today: &TodayStats) {
        self.total_up = self.total_up - self.up[TODAY_SLOT] + today.up;
        self.total_down = self.total_down - self.down[TODAY_SLOT] + today.down;
        self.up[TODAY_SLOT] = today.up;
        self.down[TODAY_SLOT] = today.down;
        self.delay[TODAY_SLOT] = today.delay;
    }

    /// Shift one day: the oldest slot leaves the totals, a zeroed slot opens for today.
    pub fn roll(&mut self) {
        self.total_up -= self.up[0];
        self.total_down -= self.down[0];

        self.up.rotate_left(1);
        self.down.rotate_left(1);
        self.delay.rotate_left(1);

        self.up[TODAY_SLOT] = 0;
        self.down[TODAY_SLOT] = 0;
        self.delay[TODAY_SLOT] = 0.0;
    }

    /// 30-day availability in percent.
    pub fn uptime(&self) -> f32 {
        let total = self.total_up + self.total_down;
        if total == 0 {
            return 0.0;
        }
        self.total_up as f32 * 100.0 / total as f32
    }
}

/// Ping results from one reporter awaiting a coalesced history write.
#[derive(Debug, Clone, Copy, Default)]
struct PingBatch {
    count: usize,
    avg_delay: f32,
    up: u64,
    down: u64,
}

/// A completed ping batch ready to persist.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PingFlush {
    pub avg_delay: f32,
    pub up: u64,
    pub down: u64,
}

/// Rolling state for one monitor.
#[derive(Debug, Clone, Default)]
pub struct MonitorStats {
    pub today: TodayStats,
    pub current: CurrentStats,
    pub monthly: MonthlyStats,
    pub last_status: Option<StatusCode>,
    pub cert_cache: Option<String>,
    window: RingBuffer<Sample, CURRENT_WINDOW>,
    pings: HashMap<u64, PingBatch>,
}

impl MonitorStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one sample into every granularity. Returns true when the
    /// current window just completed a full lap.
    pub fn record(&mut self, sample: Sample) -> bool {
        self.today.record(sample);
        let lap = self.window.push(sample);
        self.current = CurrentStats::from_samples(self.window.iter());
        self.monthly.sync_today(&self.today);
        lap
    }

    /// Average a ping sample into the reporter's batch; yields the batch
    /// once it holds `batch_size` samples.
    pub fn record_ping(&mut self, reporter: u64, sample: Sample, batch_size: usize) -> Option<PingFlush> {
        let batch = self.pings.entry(reporter).or_default();
        batch.count += 1;
        batch.avg_delay += (sample.delay - batch.avg_delay) / batch.count as f32;
        if sample.successful {
            batch.up += 1;
        } else {
            batch.down += 1;
        }

        if batch.count < batch_size.max(1) {
            return None;
        }

        let flush = PingFlush {
            avg_delay: batch.avg_delay,
            up: batch.up,
            down: batch.down,
        };
        *batch = PingBatch::default();
        Some(flush)
    }

    /// Close the current day and open a fresh one.
    pub fn roll_day(&mut self) {
        self.monthly.sync_today(&self.today);
        self.monthly.roll();
        self.today = TodayStats::default();
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }
}
