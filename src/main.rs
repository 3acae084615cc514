//! linkwatch - router availability monitoring service.

use linkwatch::config::MonitorConfig;
use linkwatch::db::{Repository, Store};
use linkwatch::monitor::RouterMonitor;
use linkwatch::probe::PingProber;
use linkwatch::report::{ReportGenerator, ReportOptions};
use linkwatch::scheduler::Scheduler;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("linkwatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = MonitorConfig::load();
    tracing::info!("Starting linkwatch...");
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    if store.get_routers(false)?.is_empty() {
        tracing::warn!("No routers configured, nothing will be probed");
    }

    let prober = PingProber::new(cfg.ping_count, cfg.ping_reply_timeout, cfg.probe_timeout);
    tracing::info!("Probing with {} pings per target on {}", cfg.ping_count, prober.os());

    let scheduler = Arc::new(Scheduler::new());
    let monitor = RouterMonitor::new(store.clone(), Arc::new(prober), scheduler.clone(), cfg.firing_jitter);
    monitor.start_monitoring().await?;

    if let Some(spec) = &cfg.report_schedule {
        // No mail transport is bundled; reports are stored and their email fails softly.
        let reports = ReportGenerator::new(store, None);
        let options = ReportOptions {
            recipients: cfg.report_recipients.clone(),
            error_recipients: cfg.error_recipients.clone(),
            ..Default::default()
        };
        reports.schedule_reports(&scheduler, spec, cfg.report_window, options)?;
        tracing::info!("Periodic reports on {}", spec);
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    monitor.stop_monitoring().await;
    scheduler.cancel_all();

    Ok(())
}
