//! Statistics and report generation.

mod email;
mod stats;

pub use email::*;
pub use stats::*;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use thiserror::Error;

use crate::db::{DbError, Report, Repository};
use crate::monitor::{ScheduleError, ScheduleSpec};
use crate::scheduler::{JobError, JobFuture, JobHandle, Scheduler, SchedulerError, Trigger};

/// Report error types.
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("router {0} not found")]
    RouterNotFound(i64),
    #[error("report window starts after it ends")]
    InvalidRange,
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Caller-supplied report details.
#[derive(Debug, Clone, Default)]
pub struct ReportOptions {
    pub title: Option<String>,
    pub message: Option<String>,
    /// Empty means the report is stored but not emailed.
    pub recipients: Vec<String>,
    /// Receives the report instead of `recipients` when every target was
    /// unreachable. Empty means `recipients` get it too.
    pub error_recipients: Vec<String>,
}

impl ReportOptions {
    fn recipients_for(&self, report: &Report) -> &[String] {
        if report.all_unreachable() && !self.error_recipients.is_empty() {
            &self.error_recipients
        } else {
            &self.recipients
        }
    }
}

/// What happened to the report's email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmailOutcome {
    /// No recipients were given.
    Skipped,
    Sent,
    /// The report is stored; only the email was lost.
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct ReportOutcome {
    pub report: Report,
    pub email: EmailOutcome,
}

/// Builds, stores and emails router reports.
#[derive(Clone)]
pub struct ReportGenerator {
    repo: Arc<dyn Repository>,
    mailer: Option<Arc<dyn Mailer>>,
}

impl ReportGenerator {
    /// `mailer` may be `None`; reports with recipients are then stored but
    /// their email fails.
    pub fn new(repo: Arc<dyn Repository>, mailer: Option<Arc<dyn Mailer>>) -> Self {
        Self { repo, mailer }
    }

    /// Aggregate a router's results in `[start, end]`, store the report and
    /// email it when recipients are given.
    pub async fn generate_report(
        &self,
        router_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        options: ReportOptions,
    ) -> Result<ReportOutcome, ReportError> {
        if start > end {
            return Err(ReportError::InvalidRange);
        }
        let router = self
            .repo
            .get_router(router_id)?
            .ok_or(ReportError::RouterNotFound(router_id))?;

        let known = self
            .repo
            .get_isp_connections(router_id, false)?
            .into_iter()
            .map(|c| c.name);
        let results = self.repo.query_probe_results(router_id, Some(start), Some(end))?;

        let mut report = Report {
            id: 0,
            router_id,
            title: options
                .title
                .clone()
                .unwrap_or_else(|| format!("{} - {}", REPORT_SUBJECT, router.name)),
            message: options.message.clone(),
            time_range_start: start,
            time_range_end: end,
            created_at: Utc::now(),
            statistics_by_connection: stats_by_connection(&results, known),
            email_sent: false,
            recipients: Vec::new(),
        };
        self.repo.create_report(&mut report)?;
        tracing::info!(
            router_id,
            report_id = report.id,
            results = results.len(),
            "Report: Created report"
        );

        let recipients = options.recipients_for(&report).to_vec();
        if recipients.is_empty() {
            return Ok(ReportOutcome {
                report,
                email: EmailOutcome::Skipped,
            });
        }

        let email = match self.dispatch(&report, &recipients).await {
            Ok(()) => {
                tracing::info!(report_id = report.id, recipients = recipients.len(), "Report: Email sent");
                // The email is out either way; only the stored flag can lag.
                match self.repo.mark_report_emailed(report.id, &recipients) {
                    Ok(()) => {
                        report.email_sent = true;
                        report.recipients = recipients;
                    }
                    Err(e) => {
                        tracing::warn!(report_id = report.id, error = %e, "Report: Failed to record email dispatch");
                    }
                }
                EmailOutcome::Sent
            }
            Err(e) => {
                tracing::warn!(report_id = report.id, error = %e, "Report: Email dispatch failed");
                EmailOutcome::Failed(e.to_string())
            }
        };

        Ok(ReportOutcome { report, email })
    }

    /// Report on every monitored router over the `window` ending now. A
    /// router whose report fails is logged and skipped.
    pub async fn report_all(&self, window: Duration, options: &ReportOptions) -> Result<Vec<ReportOutcome>, ReportError> {
        let end = Utc::now();
        let start = end - report_window(window)?;

        let mut outcomes = Vec::new();
        for router in self.repo.get_routers(true)? {
            match self.generate_report(router.id, start, end, options.clone()).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    tracing::warn!(router_id = router.id, error = %e, "Report: Periodic report failed");
                }
            }
        }
        Ok(outcomes)
    }

    /// Run `report_all` on `spec`. Jobs are named `reports`, or
    /// `reports-daily-HHMM` per daily time, and replace earlier ones.
    pub fn schedule_reports(
        &self,
        scheduler: &Scheduler,
        spec: &ScheduleSpec,
        window: Duration,
        options: ReportOptions,
    ) -> Result<Vec<JobHandle>, ReportError> {
        report_window(window)?;
        let triggers = spec.triggers()?;

        let mut handles = Vec::with_capacity(triggers.len());
        for trigger in triggers {
            let id = match &trigger {
                Trigger::Daily(time) => format!("reports-daily-{}", time.format("%H%M")),
                Trigger::Interval(_) | Trigger::Cron(_) => "reports".to_string(),
            };
            let generator = self.clone();
            let options = options.clone();
            let job = move || -> JobFuture {
                let generator = generator.clone();
                let options = options.clone();
                Box::pin(async move {
                    generator
                        .report_all(window, &options)
                        .await
                        .map(|_| ())
                        .map_err(JobError::from)
                })
            };

            match scheduler.schedule(&id, trigger, job) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    for handle in &handles {
                        scheduler.cancel_handle(handle);
                    }
                    return Err(e.into());
                }
            }
        }

        tracing::info!(jobs = handles.len(), schedule = %spec, "Report: Scheduled periodic reports");
        Ok(handles)
    }

    async fn dispatch(&self, report: &Report, recipients: &[String]) -> Result<(), MailError> {
        let mailer = self.mailer.as_ref().ok_or(MailError::NotConfigured)?;
        let html = render_report_html(report);
        mailer.send(recipients, report_subject(report), &html).await
    }
}

fn report_window(window: Duration) -> Result<ChronoDuration, ReportError> {
    match ChronoDuration::from_std(window) {
        Ok(window) if window > ChronoDuration::zero() => Ok(window),
        _ => Err(ReportError::InvalidRange),
    }
}
