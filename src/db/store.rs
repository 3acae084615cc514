//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;
use super::repository::Repository;
use crate::monitor::ScheduleSpec;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("database lock poisoned")]
    LockPoisoned,
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

const ROUTER_COLUMNS: &str = "id, name, address, monitoring_enabled, schedule";
const CONNECTION_COLUMNS: &str = "id, router_id, name, address, active";
const RESULT_COLUMNS: &str =
    "id, router_id, address, time, successful, latency_ms, packet_loss_pct, jitter_ms, connection_label";
const REPORT_COLUMNS: &str = "id, router_id, title, message, time_range_start, time_range_end, created_at, statistics, email_sent, recipients";

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        Self::with_connection(Connection::open(path)?)
    }

    /// A private, non-persistent database.
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, DbError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::LockPoisoned)
    }

    // --- Router CRUD ---

    /// Add a new router and return its ID.
    pub fn add_router(&self, router: &mut Router) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO routers (name, address, monitoring_enabled, schedule) VALUES (?1, ?2, ?3, ?4)",
            params![
                router.name,
                router.address,
                router.monitoring_enabled,
                router.schedule.as_ref().map(ScheduleSpec::to_string),
            ],
        )?;
        router.id = conn.last_insert_rowid();
        Ok(router.id)
    }

    /// Update an existing router.
    pub fn update_router(&self, router: &Router) -> Result<(), DbError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE routers SET name=?1, address=?2, monitoring_enabled=?3, schedule=?4 WHERE id=?5",
            params![
                router.name,
                router.address,
                router.monitoring_enabled,
                router.schedule.as_ref().map(ScheduleSpec::to_string),
                router.id,
            ],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Delete a router and its connections. Probe results and reports are
    /// retained.
    pub fn delete_router(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM isp_connections WHERE router_id = ?1", params![id])?;
        conn.execute("DELETE FROM routers WHERE id = ?1", params![id])?;
        Ok(())
    }

    // --- ISP connection CRUD ---

    /// Add an ISP connection and return its ID.
    pub fn add_isp_connection(&self, connection: &mut IspConnection) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO isp_connections (router_id, name, address, active) VALUES (?1, ?2, ?3, ?4)",
            params![
                connection.router_id,
                connection.name,
                connection.address,
                connection.active,
            ],
        )?;
        connection.id = conn.last_insert_rowid();
        Ok(connection.id)
    }

    pub fn set_isp_connection_active(&self, id: i64, active: bool) -> Result<(), DbError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE isp_connections SET active = ?1 WHERE id = ?2",
            params![active, id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    pub fn delete_isp_connection(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM isp_connections WHERE id = ?1", params![id])?;
        Ok(())
    }
}

impl Repository for Store {
    fn get_router(&self, id: i64) -> Result<Option<Router>, DbError> {
        let conn = self.conn()?;
        let router = conn
            .query_row(
                &format!("SELECT {} FROM routers WHERE id = ?1", ROUTER_COLUMNS),
                params![id],
                router_from_row,
            )
            .optional()?;
        Ok(router)
    }

    fn get_routers(&self, monitoring_only: bool) -> Result<Vec<Router>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM routers WHERE (?1 = 0 OR monitoring_enabled = 1) ORDER BY id",
            ROUTER_COLUMNS
        ))?;
        let routers = stmt
            .query_map(params![monitoring_only], router_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(routers)
    }

    fn get_isp_connections(&self, router_id: i64, active_only: bool) -> Result<Vec<IspConnection>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM isp_connections WHERE router_id = ?1 AND (?2 = 0 OR active = 1) ORDER BY id",
            CONNECTION_COLUMNS
        ))?;
        let connections = stmt
            .query_map(params![router_id, active_only], |row| {
                Ok(IspConnection {
                    id: row.get(0)?,
                    router_id: row.get(1)?,
                    name: row.get(2)?,
                    address: row.get(3)?,
                    active: row.get(4)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(connections)
    }

    fn create_probe_result(&self, result: &mut ProbeResult) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO probe_results (router_id, address, time, successful, latency_ms, packet_loss_pct, jitter_ms, connection_label)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                result.router_id,
                result.address,
                format_db_time(&result.timestamp),
                result.successful,
                result.latency_ms,
                result.packet_loss_pct,
                result.jitter_ms,
                result.connection_label,
            ],
        )?;
        result.id = conn.last_insert_rowid();
        Ok(result.id)
    }

    fn query_probe_results(
        &self,
        router_id: i64,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<ProbeResult>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM probe_results
             WHERE router_id = ?1 AND (?2 IS NULL OR time >= ?2) AND (?3 IS NULL OR time <= ?3)
             ORDER BY time ASC, id ASC",
            RESULT_COLUMNS
        ))?;

        let results = stmt
            .query_map(
                params![
                    router_id,
                    start.as_ref().map(format_db_time),
                    end.as_ref().map(format_db_time),
                ],
                |row| {
                    let time_str: String = row.get(3)?;
                    Ok(ProbeResult {
                        id: row.get(0)?,
                        router_id: row.get(1)?,
                        address: row.get(2)?,
                        timestamp: parse_db_time(&time_str).unwrap_or_else(Utc::now),
                        successful: row.get(4)?,
                        latency_ms: row.get(5)?,
                        packet_loss_pct: row.get(6)?,
                        jitter_ms: row.get(7)?,
                        connection_label: row.get(8)?,
                    })
                },
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(results)
    }

    fn create_report(&self, report: &mut Report) -> Result<i64, DbError> {
        let statistics = serde_json::to_string(&report.statistics_by_connection)?;
        let recipients = serde_json::to_string(&report.recipients)?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO reports (router_id, title, message, time_range_start, time_range_end, created_at, statistics, email_sent, recipients)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                report.router_id,
                report.title,
                report.message,
                format_db_time(&report.time_range_start),
                format_db_time(&report.time_range_end),
                format_db_time(&report.created_at),
                statistics,
                report.email_sent,
                recipients,
            ],
        )?;
        report.id = conn.last_insert_rowid();
        Ok(report.id)
    }

    fn mark_report_emailed(&self, report_id: i64, recipients: &[String]) -> Result<(), DbError> {
        let recipients = serde_json::to_string(recipients)?;
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE reports SET email_sent = 1, recipients = ?1 WHERE id = ?2",
            params![recipients, report_id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    fn get_report(&self, id: i64) -> Result<Option<Report>, DbError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM reports WHERE id = ?1", REPORT_COLUMNS),
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        [
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, String>(6)?,
                        ],
                        row.get::<_, String>(7)?,
                        row.get::<_, bool>(8)?,
                        row.get::<_, String>(9)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, router_id, title, message, times, statistics, email_sent, recipients)) = row else {
            return Ok(None);
        };
        let [start, end, created] = times.map(|t| {
            parse_db_time(&t).ok_or_else(|| DbError::InvalidRecord(format!("bad report time '{}'", t)))
        });

        Ok(Some(Report {
            id,
            router_id,
            title,
            message,
            time_range_start: start?,
            time_range_end: end?,
            created_at: created?,
            statistics_by_connection: serde_json::from_str(&statistics)?,
            email_sent,
            recipients: serde_json::from_str(&recipients)?,
        }))
    }
}

fn router_from_row(row: &Row<'_>) -> SqlResult<Router> {
    let id: i64 = row.get(0)?;
    let schedule: Option<String> = row.get(4)?;
    // An unreadable schedule disables monitoring for that router instead of
    // failing every query that touches it.
    let schedule = schedule.and_then(|s| match s.parse::<ScheduleSpec>() {
        Ok(spec) => Some(spec),
        Err(e) => {
            tracing::warn!(router_id = id, schedule = %s, error = %e, "Ignoring invalid stored schedule");
            None
        }
    });

    Ok(Router {
        id,
        name: row.get(1)?,
        address: row.get(2)?,
        monitoring_enabled: row.get(3)?,
        schedule,
    })
}

fn format_db_time(t: &DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

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
    use crate::report::AggregateStats;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::collections::BTreeMap;
    use tempfile::NamedTempFile;

    fn router(name: &str) -> Router {
        Router {
            name: name.to_string(),
            address: "192.168.1.1".to_string(),
            monitoring_enabled: true,
            schedule: Some("interval:5m".parse().unwrap()),
            ..Default::default()
        }
    }

    fn probe_at(router_id: i64, label: Option<&str>, time: DateTime<Utc>) -> ProbeResult {
        ProbeResult {
            id: 0,
            router_id,
            address: "10.0.0.1".to_string(),
            timestamp: time,
            successful: true,
            latency_ms: Some(12.5),
            packet_loss_pct: 0.0,
            jitter_ms: Some(1.25),
            connection_label: label.map(str::to_string),
        }
    }

    #[test]
    fn test_router_crud() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        // Create
        let mut r = router("edge");
        let id = store.add_router(&mut r).unwrap();
        assert!(id > 0);

        // Read
        let fetched = store.get_router(id).unwrap().unwrap();
        assert_eq!(fetched, r);

        // Update
        let mut updated = fetched;
        updated.monitoring_enabled = false;
        updated.schedule = Some("daily:08:00,20:00".parse().unwrap());
        store.update_router(&updated).unwrap();
        assert_eq!(store.get_router(id).unwrap().unwrap(), updated);
        assert!(store.get_routers(true).unwrap().is_empty());
        assert_eq!(store.get_routers(false).unwrap().len(), 1);

        // Delete
        store.delete_router(id).unwrap();
        assert!(store.get_router(id).unwrap().is_none());
        assert!(matches!(store.update_router(&updated), Err(DbError::NotFound)));
    }

    #[test]
    fn test_invalid_stored_schedule_reads_as_none() {
        let store = Store::open_in_memory().unwrap();
        let mut r = router("edge");
        let id = store.add_router(&mut r).unwrap();
        store
            .conn()
            .unwrap()
            .execute("UPDATE routers SET schedule = 'interval:0m' WHERE id = ?1", params![id])
            .unwrap();

        let fetched = store.get_router(id).unwrap().unwrap();
        assert!(fetched.schedule.is_none());
        assert!(fetched.monitoring_enabled);
    }

    #[test]
    fn test_isp_connections_order_and_filter() {
        let store = Store::open_in_memory().unwrap();
        let mut r = router("edge");
        let router_id = store.add_router(&mut r).unwrap();

        for (name, active) in [("fiber", true), ("dsl", false), ("lte", true)] {
            let mut c = IspConnection {
                router_id,
                name: name.to_string(),
                address: format!("{}.example.net", name),
                active,
                ..Default::default()
            };
            store.add_isp_connection(&mut c).unwrap();
        }

        let all = store.get_isp_connections(router_id, false).unwrap();
        let names: Vec<_> = all.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["fiber", "dsl", "lte"]);

        let active = store.get_isp_connections(router_id, true).unwrap();
        assert_eq!(active.len(), 2);

        store.set_isp_connection_active(all[1].id, true).unwrap();
        assert_eq!(store.get_isp_connections(router_id, true).unwrap().len(), 3);

        store.delete_isp_connection(all[0].id).unwrap();
        assert_eq!(store.get_isp_connections(router_id, false).unwrap().len(), 2);
    }

    #[test]
    fn test_probe_results_window_is_inclusive() {
        let store = Store::open_in_memory().unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

        for i in 0..5 {
            let mut r = probe_at(1, None, t0 + ChronoDuration::minutes(i));
            store.create_probe_result(&mut r).unwrap();
            assert!(r.id > 0);
        }
        let mut other = probe_at(2, Some("fiber"), t0);
        store.create_probe_result(&mut other).unwrap();

        let all = store.query_probe_results(1, None, None).unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].timestamp, t0);
        assert_eq!(all[0].latency_ms, Some(12.5));

        let window = store
            .query_probe_results(
                1,
                Some(t0 + ChronoDuration::minutes(1)),
                Some(t0 + ChronoDuration::minutes(3)),
            )
            .unwrap();
        assert_eq!(window.len(), 3);

        let other = store.query_probe_results(2, Some(t0), Some(t0)).unwrap();
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].connection_label.as_deref(), Some("fiber"));
    }

    #[test]
    fn test_report_roundtrip_and_email_flag() {
        let store = Store::open_in_memory().unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();

        let mut stats = BTreeMap::new();
        stats.insert(
            MAIN_CONNECTION.to_string(),
            AggregateStats {
                total_tests: 4,
                successful_tests: 3,
                success_rate_pct: 75.0,
                ..Default::default()
            },
        );
        let mut report = Report {
            id: 0,
            router_id: 1,
            title: "Weekly".to_string(),
            message: None,
            time_range_start: t0,
            time_range_end: t0 + ChronoDuration::days(7),
            created_at: t0 + ChronoDuration::days(7),
            statistics_by_connection: stats,
            email_sent: false,
            recipients: Vec::new(),
        };
        let id = store.create_report(&mut report).unwrap();
        assert_eq!(store.get_report(id).unwrap().unwrap(), report);

        let recipients = vec!["noc@example.com".to_string()];
        store.mark_report_emailed(id, &recipients).unwrap();
        let fetched = store.get_report(id).unwrap().unwrap();
        assert!(fetched.email_sent);
        assert_eq!(fetched.recipients, recipients);

        assert!(store.get_report(id + 100).unwrap().is_none());
        assert!(matches!(
            store.mark_report_emailed(id + 100, &recipients),
            Err(DbError::NotFound)
        ));
    }

    #[test]
    fn test_parse_db_time() {
        let t = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(parse_db_time(&format_db_time(&t)), Some(t));
        assert_eq!(parse_db_time("2024-01-02 03:04:05"), Some(t));
        assert_eq!(parse_db_time("2024-01-02T03:04:05Z"), Some(t));
        assert_eq!(parse_db_time("yesterday"), None);
    }
}
