//! Storage operations the monitor and report generator depend on.

use chrono::{DateTime, Utc};

use super::models::*;
use super::store::DbError;

/// Persistent storage of routers, connections, probe results and reports.
pub trait Repository: Send + Sync {
    fn get_router(&self, id: i64) -> Result<Option<Router>, DbError>;

    /// All routers, or only those with monitoring enabled.
    fn get_routers(&self, monitoring_only: bool) -> Result<Vec<Router>, DbError>;

    /// A router's ISP connections in stored order.
    fn get_isp_connections(&self, router_id: i64, active_only: bool) -> Result<Vec<IspConnection>, DbError>;

    /// Store a result and assign its id.
    fn create_probe_result(&self, result: &mut ProbeResult) -> Result<i64, DbError>;

    /// Results for a router ordered by time, inclusive of both bounds.
    fn query_probe_results(
        &self,
        router_id: i64,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<ProbeResult>, DbError>;

    /// Store a report and assign its id.
    fn create_report(&self, report: &mut Report) -> Result<i64, DbError>;

    /// Record a successful email dispatch.
    fn mark_report_emailed(&self, report_id: i64, recipients: &[String]) -> Result<(), DbError>;

    fn get_report(&self, id: i64) -> Result<Option<Report>, DbError>;
}

#[cfg(test)]
pub(crate) mod faults {
    use super::*;
    use crate::db::Store;

    /// A `Store` that fails the selected operations.
    #[derive(Clone)]
    pub(crate) struct FaultyRepository {
        pub inner: Store,
        pub fail_connections: bool,
        pub fail_results: bool,
        pub fail_mark_emailed: bool,
    }

    impl FaultyRepository {
        pub fn new(inner: Store) -> Self {
            Self {
                inner,
                fail_connections: false,
                fail_results: false,
                fail_mark_emailed: false,
            }
        }

        fn fail<T>(&self, failing: bool, op: impl FnOnce(&Store) -> Result<T, DbError>) -> Result<T, DbError> {
            if failing {
                return Err(DbError::InvalidRecord("disk I/O error".to_string()));
            }
            op(&self.inner)
        }
    }

    impl Repository for FaultyRepository {
        fn get_router(&self, id: i64) -> Result<Option<Router>, DbError> {
            self.inner.get_router(id)
        }

        fn get_routers(&self, monitoring_only: bool) -> Result<Vec<Router>, DbError> {
            self.inner.get_routers(monitoring_only)
        }

        fn get_isp_connections(&self, router_id: i64, active_only: bool) -> Result<Vec<IspConnection>, DbError> {
            self.fail(self.fail_connections, |s| s.get_isp_connections(router_id, active_only))
        }

        fn create_probe_result(&self, result: &mut ProbeResult) -> Result<i64, DbError> {
            self.fail(self.fail_results, |s| s.create_probe_result(result))
        }

        fn query_probe_results(
            &self,
            router_id: i64,
            start: Option<DateTime<Utc>>,
            end: Option<DateTime<Utc>>,
        ) -> Result<Vec<ProbeResult>, DbError> {
            self.inner.query_probe_results(router_id, start, end)
        }

        fn create_report(&self, report: &mut Report) -> Result<i64, DbError> {
            self.inner.create_report(report)
        }

        fn mark_report_emailed(&self, report_id: i64, recipients: &[String]) -> Result<(), DbError> {
            self.fail(self.fail_mark_emailed, |s| s.mark_report_emailed(report_id, recipients))
        }

        fn get_report(&self, id: i64) -> Result<Option<Report>, DbError> {
            self.inner.get_report(id)
        }
    }
}
