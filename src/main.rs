use std::sync::Arc;
use std::time::Duration;

use report_jobs::api::{ApiState, api_routes};
use report_jobs::clock::{Clock, TokioClock};
use report_jobs::collab::{IssueFormParser, LoggingReportCache, ReportCache, WebhookReportCache};
use report_jobs::config::Config;
use report_jobs::github::{GithubApi, GithubClient};
use report_jobs::monitor::{GithubWorkflowMonitor, LabelDescriptions, MONITOR_QUEUE, MonitorDeps};
use report_jobs::queue::{JobOptions, JobQueue, spawn_schedule_ticker};
use report_jobs::scheduler::{
    MAINTENANCE_QUEUE, MaintenanceProcessor, REFRESH_QUEUE, RecurringTaskScheduler,
    RefreshProcessor,
};
use report_jobs::store::{Database, LibSqlBackend};
use report_jobs::worker::{WorkerOptions, WorkerPool};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Config::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        eprintln!("  export GITHUB_REPOSITORY=owner/repo");
        std::process::exit(1);
    });

    eprintln!("📋 Report Jobs v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Repository: {}", config.repository);
    eprintln!("   API: http://0.0.0.0:{}/api/tasks", config.http_port);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    config.db_path.display(),
                    e
                );
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Queue + crash recovery ───────────────────────────────────────────
    let queue = Arc::new(JobQueue::new(Arc::clone(&db)));
    let requeued = queue.requeue_active().await?;
    if requeued > 0 {
        eprintln!("   Recovered {} jobs left running by a previous process", requeued);
    }

    // ── Collaborators ────────────────────────────────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(TokioClock);
    let github: Arc<dyn GithubApi> = Arc::new(GithubClient::new(&config.github_api_url)?);
    let cache: Arc<dyn ReportCache> = match &config.cache_url {
        Some(url) => {
            eprintln!("   Cache: {}", url);
            Arc::new(WebhookReportCache::new(url.clone())?)
        }
        None => {
            eprintln!("   Cache: not configured (refreshes are logged only)");
            Arc::new(LoggingReportCache)
        }
    };

    // ── Workers ──────────────────────────────────────────────────────────
    let pool = WorkerPool::new(Arc::clone(&db), Arc::clone(&clock));

    let monitor = GithubWorkflowMonitor::new(
        MonitorDeps {
            github,
            store: Arc::clone(&db),
            parser: Arc::new(IssueFormParser::default()),
            cache: Arc::clone(&cache),
            labels: Arc::new(LabelDescriptions::new(
                config.monitor.label_cache_ttl,
                Arc::clone(&clock),
            )),
            clock: Arc::clone(&clock),
        },
        config.monitor.clone(),
        config.repository.clone(),
    );
    pool.register(
        MONITOR_QUEUE,
        Arc::new(monitor),
        WorkerOptions::new(5).with_rate_limit(100, Duration::from_secs(10)),
    )?;
    pool.register(
        REFRESH_QUEUE,
        Arc::new(RefreshProcessor::new(Arc::clone(&cache))),
        WorkerOptions::new(1),
    )?;
    pool.register(
        MAINTENANCE_QUEUE,
        Arc::new(MaintenanceProcessor::new(
            Arc::clone(&queue),
            Arc::clone(&cache),
            config.scheduler.clone(),
        )),
        WorkerOptions::new(1),
    )?;
    eprintln!("   Workers: {}", pool.queues().join(", "));

    // ── Recurring schedules ──────────────────────────────────────────────
    let registered = RecurringTaskScheduler::new(Arc::clone(&queue), config.scheduler.clone())
        .register_all()
        .await;
    eprintln!(
        "   Schedules: refresh {} ({}), maintenance {} ({})",
        config.scheduler.refresh_pattern,
        if registered.refresh.is_some() { "ok" } else { "FAILED" },
        config.scheduler.maintenance_pattern,
        if registered.maintenance.is_some() { "ok" } else { "FAILED" },
    );
    let _ticker = spawn_schedule_ticker(Arc::clone(&queue), config.scheduler.tick_interval);

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = api_routes(ApiState {
        queue: Arc::clone(&queue),
        store: Arc::clone(&db),
        default_repo: config.repository.clone(),
        monitor_job_options: JobOptions::default()
            .with_attempts(config.monitor.job_attempts)
            .with_backoff(config.monitor.job_backoff),
    });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port)).await?;
    tracing::info!(port = config.http_port, "HTTP server started");
    eprintln!();

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await?;

    pool.shutdown().await;
    tracing::info!("Workers drained, exiting");
    Ok(())
}
