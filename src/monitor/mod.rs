//! Router monitor orchestrator.
//!
//! Turns router configuration into scheduler jobs and runs the probe sequence
//! of a router, either when one of its jobs fires or on demand.

mod schedule;

pub use schedule::*;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;

use crate::db::{DbError, ProbeResult, Repository, Router};
use crate::probe::{ProbeMeasurement, Prober};
use crate::scheduler::{JobError, JobFuture, JobHandle, Scheduler, SchedulerError, Trigger};

/// Monitor error types.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("router {0} not found")]
    RouterNotFound(i64),
    #[error("monitoring is stopped")]
    Stopped,
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Keeps every monitored router's probe jobs in line with its configuration.
///
/// Cloning is cheap; clones share the same job set.
#[derive(Clone)]
pub struct RouterMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    repo: Arc<dyn Repository>,
    prober: Arc<dyn Prober>,
    scheduler: Arc<Scheduler>,
    firing_jitter: Duration,
    running: AtomicBool,
    /// Job handles installed for each router.
    jobs: Mutex<HashMap<i64, Vec<JobHandle>>>,
    /// Serializes reconfiguration of a single router.
    reconfig_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl RouterMonitor {
    /// Create a monitor. Scheduled firings start after a random delay of up
    /// to `firing_jitter`; manual probes never wait.
    pub fn new(
        repo: Arc<dyn Repository>,
        prober: Arc<dyn Prober>,
        scheduler: Arc<Scheduler>,
        firing_jitter: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                repo,
                prober,
                scheduler,
                firing_jitter,
                running: AtomicBool::new(false),
                jobs: Mutex::new(HashMap::new()),
                reconfig_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Install jobs for every router with monitoring enabled. Safe to call
    /// repeatedly; each call replaces the jobs of the previous one.
    ///
    /// Returns the number of routers that now have jobs.
    pub async fn start_monitoring(&self) -> Result<usize, MonitorError> {
        let routers = self.inner.repo.get_routers(true)?;
        self.inner.running.store(true, Ordering::SeqCst);

        // Routers disabled or deleted since the last start keep no jobs.
        let enabled: HashSet<i64> = routers.iter().map(|r| r.id).collect();
        let stale: Vec<i64> = self
            .inner
            .jobs()
            .keys()
            .copied()
            .filter(|id| !enabled.contains(id))
            .collect();
        for router_id in stale {
            let lock = self.inner.reconfig_lock(router_id);
            let _guard = lock.lock().await;
            self.inner.teardown(router_id);
        }

        let mut scheduled = 0;
        for router in &routers {
            match self.apply_router(router).await {
                Ok(true) => scheduled += 1,
                Ok(false) => {
                    tracing::debug!(router_id = router.id, "Monitor: Router has no schedule");
                }
                Err(e) => {
                    tracing::warn!(router_id = router.id, error = %e, "Monitor: Failed to schedule router");
                }
            }
        }

        tracing::info!("Monitor: Started with {} scheduled routers", scheduled);
        Ok(scheduled)
    }

    /// Cancel every job this monitor installed. Until the next start, no
    /// schedule can be installed. Idempotent.
    pub async fn stop_monitoring(&self) -> usize {
        self.inner.running.store(false, Ordering::SeqCst);

        // Waiting on each router's lock lets an install already under way
        // finish, so its jobs are torn down here too.
        let mut router_ids: HashSet<i64> = self.inner.jobs().keys().copied().collect();
        router_ids.extend(
            self.inner
                .reconfig_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .keys()
                .copied(),
        );

        let mut cancelled = 0;
        for router_id in router_ids {
            let lock = self.inner.reconfig_lock(router_id);
            let _guard = lock.lock().await;
            cancelled += self.inner.teardown(router_id);
        }

        tracing::info!("Monitor: Stopped, cancelled {} jobs", cancelled);
        cancelled
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Replace the router's jobs with ones for `spec`.
    ///
    /// `spec` is validated first; when it is invalid or the router does not
    /// exist the router's current jobs are left untouched. Fails with
    /// `Stopped` while monitoring is stopped.
    pub async fn install_schedule(&self, router_id: i64, spec: &ScheduleSpec) -> Result<(), MonitorError> {
        let triggers = spec.triggers()?;
        if self.inner.repo.get_router(router_id)?.is_none() {
            return Err(MonitorError::RouterNotFound(router_id));
        }

        let lock = self.inner.reconfig_lock(router_id);
        let _guard = lock.lock().await;
        if !self.is_running() {
            return Err(MonitorError::Stopped);
        }
        self.inner.teardown(router_id);
        self.install_triggers(router_id, triggers)
    }

    /// Cancel all jobs of a router. Returns false if it had none.
    pub async fn remove_schedule(&self, router_id: i64) -> bool {
        let lock = self.inner.reconfig_lock(router_id);
        let _guard = lock.lock().await;
        self.inner.teardown(router_id) > 0
    }

    /// Bring a router's jobs in line with its stored configuration. Returns
    /// true when the router is left with jobs.
    ///
    /// A router without an active schedule is always torn down; installing
    /// jobs fails with `Stopped` while monitoring is stopped.
    pub async fn apply_router(&self, router: &Router) -> Result<bool, MonitorError> {
        let lock = self.inner.reconfig_lock(router.id);
        let _guard = lock.lock().await;

        match router.active_schedule() {
            Some(spec) => {
                let triggers = spec.triggers()?;
                if !self.is_running() {
                    return Err(MonitorError::Stopped);
                }
                self.inner.teardown(router.id);
                self.install_triggers(router.id, triggers)?;
                Ok(true)
            }
            None => {
                self.inner.teardown(router.id);
                Ok(false)
            }
        }
    }

    /// Probe a router's primary address and active ISP connections now.
    ///
    /// A router that does not exist yields no results. Unlike scheduled
    /// firings, storage failures are returned; every target is still probed
    /// before the first one is reported.
    pub async fn probe_now(&self, router_id: i64) -> Result<Vec<ProbeResult>, MonitorError> {
        self.inner.run_probes(router_id, Firing::Manual).await
    }

    /// Number of live jobs installed for a router.
    pub fn scheduled_jobs(&self, router_id: i64) -> usize {
        self.inner
            .jobs()
            .get(&router_id)
            .map_or(0, |handles| {
                handles
                    .iter()
                    .filter(|handle| self.inner.scheduler.is_current(handle))
                    .count()
            })
    }

    /// Must be called with the router's reconfiguration lock held and its
    /// previous jobs torn down.
    fn install_triggers(&self, router_id: i64, triggers: Vec<Trigger>) -> Result<(), MonitorError> {
        let mut handles = Vec::with_capacity(triggers.len());
        for trigger in triggers {
            let id = job_id(router_id, &trigger);
            let callback = firing(Arc::downgrade(&self.inner), router_id);
            match self.inner.scheduler.schedule(&id, trigger, callback) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    for handle in &handles {
                        self.inner.scheduler.cancel_handle(handle);
                    }
                    return Err(e.into());
                }
            }
        }

        tracing::info!(router_id, jobs = handles.len(), "Monitor: Installed schedule");
        self.inner.jobs().insert(router_id, handles);
        Ok(())
    }
}

/// What started a probe run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Firing {
    /// A scheduler job: storage failures are logged and absorbed.
    Scheduled,
    /// `probe_now`: storage failures go back to the caller.
    Manual,
}

impl MonitorInner {
    async fn run_probes(&self, router_id: i64, firing: Firing) -> Result<Vec<ProbeResult>, MonitorError> {
        let Some(router) = self.repo.get_router(router_id)? else {
            tracing::warn!(router_id, "Monitor: Router no longer exists, nothing to probe");
            return Ok(Vec::new());
        };
        if firing == Firing::Scheduled && !router.monitoring_enabled {
            tracing::debug!(router_id, "Monitor: Monitoring disabled, skipping scheduled probe");
            return Ok(Vec::new());
        }

        let connections = match self.repo.get_isp_connections(router_id, true) {
            Ok(connections) => connections,
            Err(e) if firing == Firing::Manual => return Err(e.into()),
            Err(e) => {
                tracing::warn!(router_id, error = %e, "Monitor: Failed to load ISP connections");
                Vec::new()
            }
        };

        let mut created = Vec::new();
        let mut store_error = None;
        for target in router.targets(&connections) {
            let outcome = self.prober.probe(&target.address).await;
            if let Err(e) = &outcome {
                tracing::warn!(router_id, address = %target.address, error = %e, "Monitor: Probe failed");
            }

            let mut result = ProbeResult::new(router_id, &target, ProbeMeasurement::from_outcome(&outcome));
            match self.repo.create_probe_result(&mut result) {
                Ok(_) => {
                    tracing::debug!(
                        router_id,
                        address = %result.address,
                        successful = result.successful,
                        latency_ms = ?result.latency_ms,
                        loss = result.packet_loss_pct,
                        "Monitor: Probe result"
                    );
                    created.push(result);
                }
                Err(e) => {
                    tracing::error!(router_id, address = %target.address, error = %e, "Monitor: Failed to store probe result");
                    if store_error.is_none() {
                        store_error = Some(e);
                    }
                }
            }
        }

        match store_error {
            Some(e) if firing == Firing::Manual => Err(e.into()),
            _ => Ok(created),
        }
    }

    /// Cancel the router's jobs. Returns how many were still live.
    fn teardown(&self, router_id: i64) -> usize {
        let handles = self.jobs().remove(&router_id).unwrap_or_default();
        let cancelled = handles
            .iter()
            .filter(|handle| self.scheduler.cancel_handle(handle))
            .count();
        if cancelled > 0 {
            tracing::info!(router_id, jobs = cancelled, "Monitor: Removed schedule");
        }
        cancelled
    }

    fn firing_delay(&self) -> Duration {
        let max_ms = self.firing_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    fn reconfig_lock(&self, router_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        self.reconfig_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(router_id)
            .or_default()
            .clone()
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<i64, Vec<JobHandle>>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scheduler callback for one router. Holds the monitor weakly so installed
/// jobs do not keep a dropped monitor alive.
fn firing(inner: Weak<MonitorInner>, router_id: i64) -> impl Fn() -> JobFuture + Send + Sync + 'static {
    move || -> JobFuture {
        let inner = inner.clone();
        Box::pin(async move {
            let Some(inner) = inner.upgrade() else {
                return Ok(());
            };
            let delay = inner.firing_delay();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            inner
                .run_probes(router_id, Firing::Scheduled)
                .await
                .map(|_| ())
                .map_err(JobError::from)
        })
    }
}

/// Scheduler id of a router's job. Daily schedules get one job per time.
fn job_id(router_id: i64, trigger: &Trigger) -> String {
    match trigger {
        Trigger::Daily(time) => format!("router-{}-daily-{}", router_id, time.format("%H%M")),
        Trigger::Interval(_) | Trigger::Cron(_) => format!("router-{}", router_id),
    }
}
