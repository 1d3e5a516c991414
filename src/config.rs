//! Configuration module for FleetWatch.
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::notify::WebhookChannel;

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    Io(String, std::io::Error),
    #[error("invalid notifier file {0}: {1}")]
    Parse(String, serde_json::Error),
}

/// Upper bound for the ping write-coalescing batch size.
pub const MAX_AVG_PING_COUNT: usize = 30;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the dashboard API (default: 8008)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "fleetwatch.db")
    pub db_path: String,
    /// Number of consecutive ping samples averaged into one history row (default: 2)
    pub avg_ping_count: usize,
    /// Interval between alert rule evaluations (default: 3s)
    pub alert_interval: Duration,
    /// Maximum number of notification sends in flight (default: 16)
    pub notify_concurrency: usize,
    /// Show server IPs unmasked in notifications (default: false)
    pub plain_ip: bool,
    /// Optional JSON file describing notification channels
    pub notifiers_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8008,
            db_path: "fleetwatch.db".to_string(),
            avg_ping_count: 2,
            alert_interval: Duration::from_secs(3),
            notify_concurrency: 16,
            plain_ip: false,
            notifiers_path: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `FLEETWATCH_HTTP_PORT`: HTTP port (default: 8008)
    /// - `FLEETWATCH_DB_PATH`: Database file path (default: "fleetwatch.db")
    /// - `FLEETWATCH_AVG_PING_COUNT`: ping samples per history row (default: 2, max 30)
    /// - `FLEETWATCH_ALERT_INTERVAL_SECS`: alert evaluation interval (default: 3)
    /// - `FLEETWATCH_NOTIFY_CONCURRENCY`: concurrent notification sends (default: 16)
    /// - `FLEETWATCH_PLAIN_IP`: `true` to disable IP masking
    /// - `FLEETWATCH_NOTIFIERS`: path to the notification channel file
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Some(port) = parse_env("FLEETWATCH_HTTP_PORT") {
            cfg.http_port = port;
        }

        if let Ok(db_path) = env::var("FLEETWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Some(count) = parse_env::<usize>("FLEETWATCH_AVG_PING_COUNT") {
            cfg.avg_ping_count = count;
        }
        cfg.avg_ping_count = clamp_avg_ping_count(cfg.avg_ping_count);

        if let Some(secs) = parse_env::<u64>("FLEETWATCH_ALERT_INTERVAL_SECS") {
            if secs > 0 {
                cfg.alert_interval = Duration::from_secs(secs);
            }
        }

        if let Some(n) = parse_env::<usize>("FLEETWATCH_NOTIFY_CONCURRENCY") {
            if n > 0 {
                cfg.notify_concurrency = n;
            }
        }

        if let Some(plain) = parse_env("FLEETWATCH_PLAIN_IP") {
            cfg.plain_ip = plain;
        }

        if let Ok(path) = env::var("FLEETWATCH_NOTIFIERS") {
            if !path.is_empty() {
                cfg.notifiers_path = Some(PathBuf::from(path));
            }
        }

        cfg
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Read webhook channel definitions from a JSON array file.
pub fn load_notifier_channels(path: &Path) -> Result<Vec<WebhookChannel>, ConfigError> {
    let display = path.display().to_string();
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(display.clone(), e))?;
    serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(display, e))
}

/// Clamp the ping batch size into `1..=MAX_AVG_PING_COUNT`.
pub fn clamp_avg_ping_count(count: usize) -> usize {
    count.clamp(1, MAX_AVG_PING_COUNT)
}
