//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use super::models::*;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid column value: {0}")]
    InvalidValue(String),
    #[error("Not found")]
    NotFound,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

struct MonitorRow {
    id: i64,
    name: String,
    probe_type: i64,
    target: String,
    duration: i64,
    cover: i64,
    skip_servers: String,
    notify: bool,
    notification_tag: String,
    latency_notify: bool,
    min_latency: f64,
    max_latency: f64,
    enable_trigger_task: bool,
    fail_trigger_tasks: String,
    recover_trigger_tasks: String,
    enable_show_in_service: bool,
}

impl MonitorRow {
    fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            probe_type: row.get(2)?,
            target: row.get(3)?,
            duration: row.get(4)?,
            cover: row.get(5)?,
            skip_servers: row.get(6)?,
            notify: row.get(7)?,
            notification_tag: row.get(8)?,
            latency_notify: row.get(9)?,
            min_latency: row.get(10)?,
            max_latency: row.get(11)?,
            enable_trigger_task: row.get(12)?,
            fail_trigger_tasks: row.get(13)?,
            recover_trigger_tasks: row.get(14)?,
            enable_show_in_service: row.get(15)?,
        })
    }

    fn into_monitor(self) -> Result<Monitor, DbError> {
        let probe_type = ProbeType::from_code(self.probe_type).ok_or_else(|| {
            DbError::InvalidValue(format!("probe type {} on monitor {}", self.probe_type, self.id))
        })?;
        Ok(Monitor {
            id: self.id as u64,
            name: self.name,
            probe_type,
            target: self.target,
            duration: self.duration.max(0) as u64,
            cover: Cover::from_code(self.cover),
            skip_servers: serde_json::from_str(&self.skip_servers)?,
            notify: self.notify,
            notification_tag: self.notification_tag,
            latency_notify: self.latency_notify,
            min_latency: self.min_latency as f32,
            max_latency: self.max_latency as f32,
            enable_trigger_task: self.enable_trigger_task,
            fail_trigger_tasks: serde_json::from_str(&self.fail_trigger_tasks)?,
            recover_trigger_tasks: serde_json::from_str(&self.recover_trigger_tasks)?,
            enable_show_in_service: self.enable_show_in_service,
        })
    }
}

const MONITOR_COLUMNS: &str = "id, name, probe_type, target, duration, cover, skip_servers, notify, \
     notification_tag, latency_notify, min_latency, max_latency, enable_trigger_task, \
     fail_trigger_tasks, recover_trigger_tasks, enable_show_in_service";

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn();
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    // --- Monitor CRUD ---

    /// Add a new monitor and return its ID.
    pub fn add_monitor(&self, monitor: &mut Monitor) -> Result<u64, DbError> {
        monitor.duration = monitor.interval_secs();
        let skip = serde_json::to_string(&monitor.skip_servers)?;
        let fail = serde_json::to_string(&monitor.fail_trigger_tasks)?;
        let recover = serde_json::to_string(&monitor.recover_trigger_tasks)?;

        let conn = self.conn();
        conn.execute(
            "INSERT INTO monitors (name, probe_type, target, duration, cover, skip_servers, notify, \
             notification_tag, latency_notify, min_latency, max_latency, enable_trigger_task, \
             fail_trigger_tasks, recover_trigger_tasks, enable_show_in_service) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                monitor.name,
                monitor.probe_type.code(),
                monitor.target,
                monitor.duration as i64,
                monitor.cover.code(),
                skip,
                monitor.notify,
                monitor.notification_tag,
                monitor.latency_notify,
                monitor.min_latency as f64,
                monitor.max_latency as f64,
                monitor.enable_trigger_task,
                fail,
                recover,
                monitor.enable_show_in_service,
            ],
        )?;
        let id = conn.last_insert_rowid() as u64;
        monitor.id = id;
        Ok(id)
    }

    /// Update an existing monitor.
    pub fn update_monitor(&self, monitor: &Monitor) -> Result<(), DbError> {
        let skip = serde_json::to_string(&monitor.skip_servers)?;
        let fail = serde_json::to_string(&monitor.fail_trigger_tasks)?;
        let recover = serde_json::to_string(&monitor.recover_trigger_tasks)?;

        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE monitors SET name=?1, probe_type=?2, target=?3, duration=?4, cover=?5, \
             skip_servers=?6, notify=?7, notification_tag=?8, latency_notify=?9, min_latency=?10, \
             max_latency=?11, enable_trigger_task=?12, fail_trigger_tasks=?13, \
             recover_trigger_tasks=?14, enable_show_in_service=?15 WHERE id=?16",
            params![
                monitor.name,
                monitor.probe_type.code(),
                monitor.target,
                monitor.interval_secs() as i64,
                monitor.cover.code(),
                skip,
                monitor.notify,
                monitor.notification_tag,
                monitor.latency_notify,
                monitor.min_latency as f64,
                monitor.max_latency as f64,
                monitor.enable_trigger_task,
                fail,
                recover,
                monitor.enable_show_in_service,
                monitor.id as i64,
            ],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Get all monitors.
    pub fn get_monitors(&self) -> Result<Vec<Monitor>, DbError> {
        let rows = {
            let conn = self.conn();
            let mut stmt =
                conn.prepare(&format!("SELECT {} FROM monitors ORDER BY id", MONITOR_COLUMNS))?;
            let rows = stmt
                .query_map([], MonitorRow::from_row)?
                .collect::<SqlResult<Vec<_>>>()?;
            rows
        };

        rows.into_iter().map(MonitorRow::into_monitor).collect()
    }

    /// Get a monitor by ID.
    pub fn get_monitor(&self, id: u64) -> Result<Monitor, DbError> {
        let row = {
            let conn = self.conn();
            conn.query_row(
                &format!("SELECT {} FROM monitors WHERE id = ?1", MONITOR_COLUMNS),
                params![id as i64],
                MonitorRow::from_row,
            )
            .optional()?
        };

        row.ok_or(DbError::NotFound)?.into_monitor()
    }

    /// Delete a monitor and its history.
    pub fn delete_monitor(&self, id: u64) -> Result<(), DbError> {
        let conn = self.conn();
        conn.execute("DELETE FROM monitor_history WHERE monitor_id = ?1", params![id as i64])?;
        conn.execute("DELETE FROM monitors WHERE id = ?1", params![id as i64])?;
        Ok(())
    }

    // --- Alert rule CRUD ---

    /// Add a new alert rule and return its ID.
    pub fn add_alert_rule(&self, alert: &mut AlertRule) -> Result<u64, DbError> {
        let rules = serde_json::to_string(&alert.rules)?;
        let fail = serde_json::to_string(&alert.fail_trigger_tasks)?;
        let recover = serde_json::to_string(&alert.recover_trigger_tasks)?;

        let conn = self.conn();
        conn.execute(
            "INSERT INTO alert_rules (name, rules, enabled, notification_tag, fail_trigger_tasks, recover_trigger_tasks) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![alert.name, rules, alert.enabled, alert.notification_tag, fail, recover],
        )?;
        let id = conn.last_insert_rowid() as u64;
        alert.id = id;
        Ok(id)
    }

    /// Update an existing alert rule.
    pub fn update_alert_rule(&self, alert: &AlertRule) -> Result<(), DbError> {
        let rules = serde_json::to_string(&alert.rules)?;
        let fail = serde_json::to_string(&alert.fail_trigger_tasks)?;
        let recover = serde_json::to_string(&alert.recover_trigger_tasks)?;

        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE alert_rules SET name=?1, rules=?2, enabled=?3, notification_tag=?4, \
             fail_trigger_tasks=?5, recover_trigger_tasks=?6 WHERE id=?7",
            params![
                alert.name,
                rules,
                alert.enabled,
                alert.notification_tag,
                fail,
                recover,
                alert.id as i64,
            ],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Get all alert rules.
    pub fn get_alert_rules(&self) -> Result<Vec<AlertRule>, DbError> {
        let rows = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                "SELECT id, name, rules, enabled, notification_tag, fail_trigger_tasks, recover_trigger_tasks \
                 FROM alert_rules ORDER BY id",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, bool>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                })?
                .collect::<SqlResult<Vec<_>>>()?;
            rows
        };

        rows.into_iter()
            .map(|(id, name, rules, enabled, tag, fail, recover)| {
                let notification_tag = if tag.is_empty() { "default".to_string() } else { tag };
                Ok(AlertRule {
                    id: id as u64,
                    name,
                    rules: serde_json::from_str(&rules)?,
                    enabled,
                    notification_tag,
                    fail_trigger_tasks: serde_json::from_str(&fail)?,
                    recover_trigger_tasks: serde_json::from_str(&recover)?,
                })
            })
            .collect()
    }

    /// Delete an alert rule.
    pub fn delete_alert_rule(&self, id: u64) -> Result<(), DbError> {
        let conn = self.conn();
        conn.execute("DELETE FROM alert_rules WHERE id = ?1", params![id as i64])?;
        Ok(())
    }

    // --- Monitor history ---

    /// Add monitor history rows in batch.
    pub fn add_monitor_histories(&self, rows: &[MonitorHistory]) -> Result<(), DbError> {
        if rows.is_empty() {
            return Ok(());
        }

        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO monitor_history (created_at, monitor_id, server_id, avg_delay, up, down, data) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;

            for h in rows {
                stmt.execute(params![
                    format_db_time(h.created_at),
                    h.monitor_id as i64,
                    h.server_id.map(|id| id as i64),
                    h.avg_delay as f64,
                    h.up as i64,
                    h.down as i64,
                    h.data,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Get monitor history rows created at or after `since`, oldest first.
    pub fn get_monitor_history_since(&self, since: DateTime<Utc>) -> Result<Vec<MonitorHistory>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, created_at, monitor_id, server_id, avg_delay, up, down, data FROM monitor_history \
             WHERE created_at >= ?1 ORDER BY created_at ASC",
        )?;

        let rows = stmt
            .query_map(params![format_db_time(since)], |row| {
                let id: i64 = row.get(0)?;
                let time_str: String = row.get(1)?;
                let Some(created_at) = parse_db_time(&time_str) else {
                    tracing::warn!("Store: skipping history row {} with bad timestamp {:?}", id, time_str);
                    return Ok(None);
                };
                Ok(Some(MonitorHistory {
                    id,
                    created_at,
                    monitor_id: row.get::<_, i64>(2)? as u64,
                    server_id: row.get::<_, Option<i64>>(3)?.map(|id| id as u64),
                    avg_delay: row.get::<_, f64>(4)? as f32,
                    up: row.get::<_, i64>(5)?.max(0) as u64,
                    down: row.get::<_, i64>(6)?.max(0) as u64,
                    data: row.get(7)?,
                }))
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(rows.into_iter().flatten().collect())
    }

    /// Delete history rows older than `cutoff` or whose monitor no longer exists.
    pub fn delete_stale_monitor_history(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn();
        let deleted = conn.execute(
            "DELETE FROM monitor_history WHERE created_at < ?1 OR monitor_id NOT IN (SELECT id FROM monitors)",
            params![format_db_time(cutoff)],
        )?;
        Ok(deleted)
    }

    // --- Transfers ---

    /// Add transfer rows in batch.
    pub fn add_transfers(&self, rows: &[Transfer]) -> Result<(), DbError> {
        if rows.is_empty() {
            return Ok(());
        }

        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO transfers (created_at, server_id, bytes_in, bytes_out) VALUES (?1, ?2, ?3, ?4)",
            )?;

            for t in rows {
                stmt.execute(params![
                    format_db_time(t.created_at),
                    t.server_id as i64,
                    t.bytes_in as i64,
                    t.bytes_out as i64,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Sum of recorded transfer `(in, out)` for a server since `since`.
    pub fn sum_transfer_since(&self, server_id: u64, since: DateTime<Utc>) -> Result<(u64, u64), DbError> {
        let conn = self.conn();
        let (sum_in, sum_out): (Option<i64>, Option<i64>) = conn.query_row(
            "SELECT SUM(bytes_in), SUM(bytes_out) FROM transfers WHERE server_id = ?1 AND created_at >= ?2",
            params![server_id as i64, format_db_time(since)],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((
            sum_in.unwrap_or(0).max(0) as u64,
            sum_out.unwrap_or(0).max(0) as u64,
        ))
    }

    /// Delete transfer rows older than `cutoff`.
    pub fn delete_transfers_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn();
        let deleted = conn.execute(
            "DELETE FROM transfers WHERE created_at < ?1",
            params![format_db_time(cutoff)],
        )?;
        Ok(deleted)
    }
}

fn format_db_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::NamedTempFile;

    fn history(monitor_id: u64, created_at: DateTime<Utc>) -> MonitorHistory {
        MonitorHistory {
            id: 0,
            created_at,
            monitor_id,
            server_id: None,
            avg_delay: 12.5,
            up: 29,
            down: 1,
            data: String::new(),
        }
    }

    #[test]
    fn test_monitor_crud() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        let mut monitor = Monitor {
            name: "Homepage".to_string(),
            target: "https://example.com".to_string(),
            duration: 0,
            skip_servers: [3u64, 4].into_iter().collect(),
            fail_trigger_tasks: vec![7],
            ..Default::default()
        };
        let id = store.add_monitor(&mut monitor).unwrap();
        assert!(id > 0);

        let fetched = store.get_monitor(id).unwrap();
        assert_eq!(fetched.name, "Homepage");
        assert_eq!(fetched.duration, DEFAULT_MONITOR_DURATION);
        assert_eq!(fetched.skip_servers, monitor.skip_servers);
        assert_eq!(fetched.fail_trigger_tasks, vec![7]);

        let mut updated = fetched;
        updated.probe_type = ProbeType::TcpPing;
        store.update_monitor(&updated).unwrap();
        assert_eq!(store.get_monitor(id).unwrap().probe_type, ProbeType::TcpPing);

        store.delete_monitor(id).unwrap();
        assert!(matches!(store.get_monitor(id), Err(DbError::NotFound)));
        assert!(matches!(store.update_monitor(&updated), Err(DbError::NotFound)));
    }

    #[test]
    fn test_alert_rule_crud() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        let mut alert = AlertRule {
            name: "High CPU".to_string(),
            rules: vec![Rule::threshold(RuleKind::Cpu, 0.0, 90.0, 30)],
            ..Default::default()
        };
        store.add_alert_rule(&mut alert).unwrap();

        let rules = store.get_alert_rules().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0], alert);

        store.delete_alert_rule(alert.id).unwrap();
        assert!(store.get_alert_rules().unwrap().is_empty());
    }

    #[test]
    fn test_history_since_and_cleanup() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        let mut monitor = Monitor {
            name: "api".to_string(),
            target: "api.example.com".to_string(),
            ..Default::default()
        };
        store.add_monitor(&mut monitor).unwrap();

        let now = Utc::now();
        store
            .add_monitor_histories(&[
                history(monitor.id, now - ChronoDuration::days(40)),
                history(monitor.id, now - ChronoDuration::days(2)),
                history(monitor.id + 100, now - ChronoDuration::hours(1)),
            ])
            .unwrap();

        let recent = store.get_monitor_history_since(now - ChronoDuration::days(3)).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].up, 29);
        assert_eq!(recent[0].server_id, None);

        let deleted = store
            .delete_stale_monitor_history(now - ChronoDuration::days(30))
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.get_monitor_history_since(now - ChronoDuration::days(60)).unwrap().len(), 1);
    }

    #[test]
    fn test_history_since_skips_bad_timestamp() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let now = Utc::now();

        store.add_monitor_histories(&[history(1, now - ChronoDuration::hours(1))]).unwrap();
        store
            .conn()
            .execute(
                "INSERT INTO monitor_history (created_at, monitor_id) VALUES ('not-a-time', 1)",
                [],
            )
            .unwrap();

        let rows = store.get_monitor_history_since(now - ChronoDuration::days(1)).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].created_at < now);
    }

    #[test]
    fn test_transfer_sum() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let now = Utc::now();

        let rows = [
            Transfer { id: 0, created_at: now - ChronoDuration::hours(5), server_id: 1, bytes_in: 10, bytes_out: 1 },
            Transfer { id: 0, created_at: now - ChronoDuration::hours(1), server_id: 1, bytes_in: 20, bytes_out: 2 },
            Transfer { id: 0, created_at: now - ChronoDuration::hours(1), server_id: 2, bytes_in: 99, bytes_out: 9 },
        ];
        store.add_transfers(&rows).unwrap();

        assert_eq!(store.sum_transfer_since(1, now - ChronoDuration::hours(2)).unwrap(), (20, 2));
        assert_eq!(store.sum_transfer_since(1, now - ChronoDuration::days(1)).unwrap(), (30, 3));
        assert_eq!(store.sum_transfer_since(3, now - ChronoDuration::days(1)).unwrap(), (0, 0));

        assert_eq!(store.delete_transfers_before(now - ChronoDuration::hours(2)).unwrap(), 1);
    }
}
