use opsflow::config::Config;
use opsflow::db;
use opsflow::events::{EventBroker, EventPoller, EventsRepo};
use opsflow::jobs::model::{
    JOB_TYPE_SANDBOX_CREATE, JOB_TYPE_SANDBOX_DESTROY, JOB_TYPE_SESSION_DELETE,
    JOB_TYPE_WORKSPACE_INIT,
};
use opsflow::jobs::retry::RetryConfig;
use opsflow::jobs::{
    cutoff_days, ConcurrencyLimiter, Dispatcher, ExecutorRegistry, Job, JobContext, JobError,
    JobExecutor, JobRunner, JobsRepo, MaintenanceRepo,
};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Stand-in executor so the dispatcher can be run end to end. The real
/// sandbox/workspace/session providers live outside this crate and
/// register their own implementations.
struct PlaceholderExecutor {
    job_type: &'static str,
    work: Duration,
}

#[async_trait]
impl JobExecutor for PlaceholderExecutor {
    fn job_type(&self) -> &str {
        self.job_type
    }

    async fn execute(&self, _ctx: &JobContext, job: &Job) -> Result<(), JobError> {
        tracing::info!(job_id = %job.id, job_type = %job.job_type, "placeholder executor running");
        tokio::time::sleep(self.work).await;
        Ok(())
    }
}

fn build_registry() -> Arc<ExecutorRegistry> {
    let mut registry = ExecutorRegistry::new();
    for job_type in [
        JOB_TYPE_SANDBOX_CREATE,
        JOB_TYPE_SANDBOX_DESTROY,
        JOB_TYPE_WORKSPACE_INIT,
        JOB_TYPE_SESSION_DELETE,
    ] {
        registry.register(Arc::new(PlaceholderExecutor {
            job_type,
            work: Duration::from_millis(300),
        }));
    }
    Arc::new(registry)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "opsflow=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = Config::from_env()?;
    tracing::info!(
        server_id = %cfg.server_id,
        dispatcher_enabled = cfg.dispatcher_enabled,
        poll_interval_ms = cfg.dispatcher_poll_interval.as_millis() as u64,
        heartbeat_timeout_ms = cfg.dispatcher_heartbeat_timeout.as_millis() as u64,
        "opsflow starting"
    );

    let pool = db::make_pool(&cfg.database_url).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let jobs_repo = JobsRepo::new(pool.clone());
    let events_repo = EventsRepo::new(pool.clone());
    let maintenance_repo = MaintenanceRepo::new(pool.clone());

    let poller = EventPoller::new(
        events_repo.clone(),
        cfg.event_poll_interval,
        cfg.event_batch_size,
        cfg.subscriber_buffer,
    );
    let broker = EventBroker::new(
        events_repo.clone(),
        jobs_repo.clone(),
        Arc::clone(&poller),
        cfg.wait_poll_interval,
    );

    let runner = JobRunner::new(jobs_repo.clone(), broker.clone(), RetryConfig::default());
    let dispatcher = Dispatcher::new(
        cfg.dispatcher_config(),
        jobs_repo.clone(),
        runner,
        build_registry(),
        Arc::new(ConcurrencyLimiter::with_default_caps()),
        JobContext {
            db: pool.clone(),
            server_id: cfg.server_id.clone(),
        },
    );

    let poller_handle = Arc::clone(&poller).start();
    let dispatcher_handle = Arc::clone(&dispatcher).start();

    // ---- Maintenance task (leader-only archival) ----
    let maintenance_handle = {
        let dispatcher = Arc::clone(&dispatcher);
        let archive_after_days = cfg.archive_after_days;
        let interval = cfg.maintenance_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !dispatcher.is_leader() {
                    continue;
                }
                match maintenance_repo
                    .archive_terminal_older_than(cutoff_days(archive_after_days), 500)
                    .await
                {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(archived = n, "archived terminal jobs"),
                    Err(e) => tracing::error!(error = %e, "job archival failed"),
                }
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    maintenance_handle.abort();
    dispatcher_handle.shutdown().await;
    poller_handle.shutdown().await;

    Ok(())
}
