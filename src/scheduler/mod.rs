//! Recurring job scheduler.
//!
//! Jobs are keyed by caller-chosen ids. Installing a job under an id that is
//! already in use cancels the previous job first, so an id never has two
//! live triggers.

mod cron;
mod trigger;

pub use cron::*;
pub use trigger::*;

use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Error returned by a job callback. Logged at the firing site.
pub type JobError = Box<dyn std::error::Error + Send + Sync>;

/// Future produced by one firing of a job.
pub type JobFuture = Pin<Box<dyn Future<Output = Result<(), JobError>> + Send>>;

type JobCallback = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// Scheduler error types.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("interval must be greater than zero")]
    InvalidInterval,
    #[error("invalid time of day '{0}', expected HH:MM")]
    InvalidTime(String),
    #[error("invalid cron expression '{expr}': {source}")]
    InvalidCron {
        expr: String,
        #[source]
        source: CronError,
    },
    #[error("no tokio runtime available to run jobs")]
    NoRuntime,
}

/// Identifies one installation of a job. A later installation under the
/// same id gets a new generation, so a stale handle cannot cancel it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle {
    id: Arc<str>,
    generation: u64,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Source of local wall-clock time for daily and cron triggers.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

/// The host's clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Gate checked under lock before every firing. Once disarmed, no new firing
/// can start.
struct Armed(Mutex<bool>);

impl Armed {
    fn lock(&self) -> MutexGuard<'_, bool> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn disarm(&self) {
        *self.lock() = false;
    }
}

struct ScheduledJob {
    generation: u64,
    trigger: Trigger,
    armed: Arc<Armed>,
    stop_tx: broadcast::Sender<()>,
    _task: JoinHandle<()>,
}

impl ScheduledJob {
    fn cancel(self) {
        self.armed.disarm();
        let _ = self.stop_tx.send(());
    }
}

/// Multiplexes interval, daily and cron jobs onto the tokio timer.
pub struct Scheduler {
    jobs: Mutex<HashMap<Arc<str>, ScheduledJob>>,
    next_generation: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// A scheduler whose daily and cron triggers read time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            clock,
        }
    }

    /// Fire `f` every `every`, starting one period from now.
    pub fn schedule_interval<F, Fut>(
        &self,
        job_id: &str,
        every: Duration,
        f: F,
    ) -> Result<JobHandle, SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.schedule(job_id, Trigger::Interval(every), f)
    }

    /// Fire `f` once a day at local wall-clock `time` (`HH:MM`).
    pub fn schedule_daily<F, Fut>(
        &self,
        job_id: &str,
        time: &str,
        f: F,
    ) -> Result<JobHandle, SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let time = parse_time_of_day(time).ok_or_else(|| SchedulerError::InvalidTime(time.to_string()))?;
        self.schedule(job_id, Trigger::Daily(time), f)
    }

    /// Fire `f` per a five-field cron expression, in local time.
    pub fn schedule_cron<F, Fut>(
        &self,
        job_id: &str,
        expr: &str,
        f: F,
    ) -> Result<JobHandle, SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let cron = CronExpr::parse(expr).map_err(|source| SchedulerError::InvalidCron {
            expr: expr.to_string(),
            source,
        })?;
        self.schedule(job_id, Trigger::Cron(cron), f)
    }

    /// Install a job, replacing any job already registered under `job_id`.
    ///
    /// The previous job is disarmed before the new trigger is armed.
    pub fn schedule<F, Fut>(
        &self,
        job_id: &str,
        trigger: Trigger,
        f: F,
    ) -> Result<JobHandle, SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        if let Trigger::Interval(every) = &trigger {
            if every.is_zero() {
                return Err(SchedulerError::InvalidInterval);
            }
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;

        let callback: JobCallback = Arc::new(move || -> JobFuture { Box::pin(f()) });
        let id: Arc<str> = Arc::from(job_id);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        let mut jobs = self.jobs();
        if let Some(previous) = jobs.remove(&id) {
            previous.cancel();
            tracing::info!(job_id = %id, "Scheduler: Replacing job");
        }

        let armed = Arc::new(Armed(Mutex::new(true)));
        let (stop_tx, stop_rx) = broadcast::channel(1);
        let task = runtime.spawn(run_job(
            id.clone(),
            trigger.clone(),
            armed.clone(),
            callback,
            self.clock.clone(),
            stop_rx,
        ));

        tracing::info!(job_id = %id, trigger = %trigger, "Scheduler: Added job");
        jobs.insert(
            id.clone(),
            ScheduledJob {
                generation,
                trigger,
                armed,
                stop_tx,
                _task: task,
            },
        );

        Ok(JobHandle { id, generation })
    }

    /// Cancel the job registered under `job_id`. Unknown ids are a no-op.
    ///
    /// After this returns no new firing of the job starts; a firing already
    /// in flight runs to completion.
    pub fn cancel(&self, job_id: &str) -> bool {
        let removed = self.jobs().remove(job_id);
        match removed {
            Some(job) => {
                job.cancel();
                tracing::info!(job_id = %job_id, "Scheduler: Removed job");
                true
            }
            None => false,
        }
    }

    /// Cancel the job only if it is still the installation `handle` refers to.
    pub fn cancel_handle(&self, handle: &JobHandle) -> bool {
        let mut jobs = self.jobs();
        let current = jobs
            .get(&handle.id)
            .is_some_and(|job| job.generation == handle.generation);
        if !current {
            return false;
        }
        if let Some(job) = jobs.remove(&handle.id) {
            job.cancel();
            tracing::info!(job_id = %handle.id, "Scheduler: Removed job");
        }
        true
    }

    /// Cancel every job. Returns how many were live.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<ScheduledJob> = self.jobs().drain().map(|(_, job)| job).collect();
        let count = drained.len();
        for job in drained {
            job.cancel();
        }
        if count > 0 {
            tracing::info!("Scheduler: Cancelled {} jobs", count);
        }
        count
    }

    pub fn is_scheduled(&self, job_id: &str) -> bool {
        self.jobs().contains_key(job_id)
    }

    pub fn is_current(&self, handle: &JobHandle) -> bool {
        self.jobs()
            .get(&handle.id)
            .is_some_and(|job| job.generation == handle.generation)
    }

    pub fn trigger_of(&self, job_id: &str) -> Option<Trigger> {
        self.jobs().get(job_id).map(|job| job.trigger.clone())
    }

    pub fn job_count(&self) -> usize {
        self.jobs().len()
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<Arc<str>, ScheduledJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// Drive one job until it is stopped.
async fn run_job(
    job_id: Arc<str>,
    trigger: Trigger,
    armed: Arc<Armed>,
    callback: JobCallback,
    clock: Arc<dyn Clock>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    if let Trigger::Interval(every) = &trigger {
        let every = *every;
        let mut interval = tokio::time::interval_at(Instant::now() + every, every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop_rx.recv() => break,
                _ = interval.tick() => {
                    if !fire(&job_id, &armed, &callback) {
                        break;
                    }
                }
            }
        }
        return;
    }

    let mut last_fire = clock.now();
    loop {
        let now = clock.now();
        let after = if last_fire > now { last_fire } else { now };
        let Some(next) = trigger.next_wall_clock(&after) else {
            tracing::warn!(job_id = %job_id, trigger = %trigger, "Scheduler: Trigger will never fire again");
            break;
        };
        let delay = (next - now).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = tokio::time::sleep(delay) => {
                last_fire = next;
                if !fire(&job_id, &armed, &callback) {
                    break;
                }
            }
        }
    }
}

/// Start one firing as its own task. Errors and panics inside the callback
/// are logged here and never end the job. Returns false once disarmed.
fn fire(job_id: &Arc<str>, armed: &Armed, callback: &JobCallback) -> bool {
    let guard = armed.lock();
    if !*guard {
        return false;
    }

    tracing::debug!(job_id = %job_id, "Scheduler: Firing job");
    let job_id = job_id.clone();
    let callback = callback.clone();
    tokio::spawn(async move {
        match tokio::spawn(async move { callback().await }).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(job_id = %job_id, error = %e, "Scheduler: Job failed");
            }
            Err(e) if e.is_panic() => {
                tracing::error!(job_id = %job_id, "Scheduler: Job panicked");
            }
            Err(_) => {}
        }
    });
    drop(guard);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;
    use tokio_test::{assert_err, assert_ok};

    /// Local time that moves with tokio's clock, so paused tests can drive
    /// wall-clock triggers.
    struct RuntimeClock {
        origin: DateTime<Local>,
        start: Instant,
    }

    impl Clock for RuntimeClock {
        fn now(&self) -> DateTime<Local> {
            self.origin + chrono::Duration::from_std(self.start.elapsed()).unwrap()
        }
    }

    /// Scheduler whose wall clock reads 2024-06-03 12:00:30 when created.
    fn scheduler_at_noon() -> Scheduler {
        let origin = Local
            .with_ymd_and_hms(2024, 6, 3, 12, 0, 30)
            .earliest()
            .unwrap();
        Scheduler::with_clock(Arc::new(RuntimeClock {
            origin,
            start: Instant::now(),
        }))
    }

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn counting(
        count: &Arc<AtomicUsize>,
    ) -> impl Fn() -> std::future::Ready<Result<(), JobError>> + Send + Sync + 'static {
        let count = count.clone();
        move || {
            count.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(()))
        }
    }

    async fn advance(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_fires_after_first_period() {
        let scheduler = Scheduler::new();
        let count = counter();
        assert_ok!(scheduler.schedule_interval("job", Duration::from_secs(10), counting(&count)));

        advance(5).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        advance(30).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replace_not_duplicate() {
        let scheduler = Scheduler::new();
        let first = counter();
        let second = counter();

        assert_ok!(scheduler.schedule_interval("router-1", Duration::from_secs(10), counting(&first)));
        assert_ok!(scheduler.schedule_interval("router-1", Duration::from_secs(7), counting(&second)));
        assert_eq!(scheduler.job_count(), 1);

        advance(30).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        // 7, 14, 21, 28
        assert_eq!(second.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_firing() {
        let scheduler = Scheduler::new();
        let count = counter();
        assert_ok!(scheduler.schedule_interval("job", Duration::from_secs(10), counting(&count)));

        advance(15).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(scheduler.cancel("job"));
        assert!(!scheduler.is_scheduled("job"));
        advance(100).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_unknown_is_noop() {
        let scheduler = Scheduler::new();
        assert!(!scheduler.cancel("missing"));
        assert!(!scheduler.cancel("missing"));
        assert_eq!(scheduler.cancel_all(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let scheduler = Scheduler::new();
        let a = counter();
        let b = counter();
        assert_ok!(scheduler.schedule_interval("a", Duration::from_secs(5), counting(&a)));
        assert_ok!(scheduler.schedule_interval("b", Duration::from_secs(5), counting(&b)));

        assert_eq!(scheduler.cancel_all(), 2);
        advance(60).await;
        assert_eq!(a.load(Ordering::SeqCst), 0);
        assert_eq!(b.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.job_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_handle_cannot_cancel_replacement() {
        let scheduler = Scheduler::new();
        let count = counter();
        let old = scheduler
            .schedule_interval("job", Duration::from_secs(10), counting(&count))
            .unwrap();
        let new = scheduler
            .schedule_interval("job", Duration::from_secs(10), counting(&count))
            .unwrap();

        assert!(!scheduler.is_current(&old));
        assert!(!scheduler.cancel_handle(&old));
        assert!(scheduler.is_scheduled("job"));

        advance(25).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        assert!(scheduler.cancel_handle(&new));
        assert!(!scheduler.is_scheduled("job"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_and_panicking_jobs_keep_firing() {
        let scheduler = Scheduler::new();
        let failures = counter();
        let panics = counter();
        let healthy = counter();

        let f = failures.clone();
        assert_ok!(scheduler.schedule_interval("fails", Duration::from_secs(10), move || {
            let f = f.clone();
            async move {
                f.fetch_add(1, Ordering::SeqCst);
                Err::<(), JobError>("boom".into())
            }
        }));
        let p = panics.clone();
        assert_ok!(scheduler.schedule_interval("panics", Duration::from_secs(10), move || {
            let p = p.clone();
            async move {
                if p.fetch_add(1, Ordering::SeqCst) < usize::MAX {
                    panic!("job blew up");
                }
                Ok::<(), JobError>(())
            }
        }));
        assert_ok!(scheduler.schedule_interval("healthy", Duration::from_secs(10), counting(&healthy)));

        advance(35).await;
        assert_eq!(failures.load(Ordering::SeqCst), 3);
        assert_eq!(panics.load(Ordering::SeqCst), 3);
        assert_eq!(healthy.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.job_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_job_does_not_delay_others() {
        let scheduler = Scheduler::new();
        let fast = counter();
        assert_ok!(scheduler.schedule_interval("slow", Duration::from_secs(1), || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<(), JobError>(())
        }));
        assert_ok!(scheduler.schedule_interval("fast", Duration::from_secs(2), counting(&fast)));

        advance(21).await;
        assert_eq!(fast.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_invalid_triggers() {
        let scheduler = Scheduler::new();
        let count = counter();
        assert!(matches!(
            scheduler.schedule_interval("a", Duration::ZERO, counting(&count)),
            Err(SchedulerError::InvalidInterval)
        ));
        assert!(matches!(
            scheduler.schedule_daily("b", "25:00", counting(&count)),
            Err(SchedulerError::InvalidTime(_))
        ));
        assert_err!(scheduler.schedule_cron("c", "not a cron", counting(&count)));
        assert_eq!(scheduler.job_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_daily_and_cron_register_with_trigger() {
        let scheduler = Scheduler::new();
        let count = counter();
        assert_ok!(scheduler.schedule_daily("d", "06:30", counting(&count)));
        assert_ok!(scheduler.schedule_cron("c", "*/5 * * * *", counting(&count)));

        assert_eq!(
            scheduler.trigger_of("d"),
            Some(Trigger::Daily(chrono::NaiveTime::from_hms_opt(6, 30, 0).unwrap()))
        );
        assert!(matches!(scheduler.trigger_of("c"), Some(Trigger::Cron(_))));

        // Replacing a daily job with an interval one swaps the trigger kind.
        assert_ok!(scheduler.schedule_interval("d", Duration::from_secs(60), counting(&count)));
        assert_eq!(
            scheduler.trigger_of("d"),
            Some(Trigger::Interval(Duration::from_secs(60)))
        );
        assert_eq!(scheduler.job_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cron_fires_on_the_minute_until_cancelled() {
        let scheduler = scheduler_at_noon();
        let count = counter();
        assert_ok!(scheduler.schedule_cron("c", "* * * * *", counting(&count)));

        advance(29).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // 12:01, 12:02, 12:03
        advance(122).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        assert!(scheduler.cancel("c"));
        advance(600).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cron_replace_fires_only_new_expression() {
        let scheduler = scheduler_at_noon();
        let every_minute = counter();
        let even_minutes = counter();

        assert_ok!(scheduler.schedule_cron("c", "* * * * *", counting(&every_minute)));
        assert_ok!(scheduler.schedule_cron("c", "*/2 * * * *", counting(&even_minutes)));
        assert_eq!(scheduler.job_count(), 1);

        // 12:02 and 12:04
        advance(250).await;
        assert_eq!(every_minute.load(Ordering::SeqCst), 0);
        assert_eq!(even_minutes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_daily_fires_once_per_day() {
        let scheduler = scheduler_at_noon();
        let count = counter();
        assert_ok!(scheduler.schedule_daily("d", "12:05", counting(&count)));

        advance(271).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        advance(3600).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        advance(86400).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        assert!(scheduler.cancel("d"));
        advance(2 * 86400).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_schedule_outside_runtime_fails() {
        let scheduler = Scheduler::new();
        let count = counter();
        assert!(matches!(
            scheduler.schedule_interval("a", Duration::from_secs(1), counting(&count)),
            Err(SchedulerError::NoRuntime)
        ));
    }
}
