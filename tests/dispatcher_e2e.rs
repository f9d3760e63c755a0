mod common;

use common::{build_broker, setup_db};

use async_trait::async_trait;
use opsflow::events::PollerHandle;
use opsflow::jobs::queue::{with_max_attempts, with_project, with_resource};
use opsflow::jobs::retry::RetryConfig;
use opsflow::jobs::{
    ConcurrencyLimiter, Dispatcher, DispatcherConfig, DispatcherHandle, ExecutorRegistry, Job,
    JobContext, JobError, JobExecutor, JobQueue, JobRunner, JobsRepo,
};
use serde_json::json;
use serial_test::serial;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn test_dispatcher_config(server_id: &str) -> DispatcherConfig {
    let mut cfg = DispatcherConfig::for_server(server_id);
    cfg.poll_interval = Duration::from_millis(50);
    cfg.heartbeat_interval = Duration::from_millis(100);
    cfg.heartbeat_timeout = Duration::from_secs(2);
    cfg.job_timeout = Duration::from_secs(5);
    // Keep the reaper out of these tests.
    cfg.stale_check_interval = Duration::from_secs(3600);
    cfg.shutdown_grace = Duration::from_secs(5);
    cfg
}

async fn start_stack(
    pool: &PgPool,
    server_id: &str,
    registry: Arc<ExecutorRegistry>,
    caps: HashMap<String, usize>,
) -> (Arc<Dispatcher>, DispatcherHandle, JobQueue, PollerHandle) {
    let repo = JobsRepo::new(pool.clone());
    let (poller, broker) = build_broker(pool);
    let poller_handle = Arc::clone(&poller).start();

    let runner = JobRunner::new(
        repo.clone(),
        broker,
        RetryConfig {
            base_seconds: 0,
            max_seconds: 1,
            jitter_pct: 0.0,
        },
    );

    let dispatcher = Dispatcher::new(
        test_dispatcher_config(server_id),
        repo.clone(),
        runner,
        registry,
        Arc::new(ConcurrencyLimiter::new(caps)),
        JobContext {
            db: pool.clone(),
            server_id: server_id.to_string(),
        },
    );

    let handle = Arc::clone(&dispatcher).start();
    let queue = JobQueue::new(repo).with_notify(dispatcher.enqueue_notify());

    (dispatcher, handle, queue, poller_handle)
}

async fn count_with_status(pool: &PgPool, status: &str) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = $1")
        .bind(status)
        .fetch_one(pool)
        .await
        .unwrap()
}

struct TrackingExecutor {
    job_type: &'static str,
    work: Duration,
    current: Arc<AtomicUsize>,
    max_seen: Arc<AtomicUsize>,
}

#[async_trait]
impl JobExecutor for TrackingExecutor {
    fn job_type(&self) -> &str {
        self.job_type
    }

    async fn execute(&self, _ctx: &JobContext, _job: &Job) -> Result<(), JobError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.work).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FlakyExecutor {
    job_type: &'static str,
    calls: Arc<AtomicUsize>,
    succeed_on_call: usize,
}

#[async_trait]
impl JobExecutor for FlakyExecutor {
    fn job_type(&self) -> &str {
        self.job_type
    }

    async fn execute(&self, _ctx: &JobContext, _job: &Job) -> Result<(), JobError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call < self.succeed_on_call {
            Err(JobError::new("SANDBOX_API", "transient provider failure"))
        } else {
            Ok(())
        }
    }
}

#[tokio::test]
#[serial]
async fn ten_jobs_respect_a_concurrency_cap_of_two() {
    let pool = setup_db().await;

    let current = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let mut registry = ExecutorRegistry::new();
    registry.register(Arc::new(TrackingExecutor {
        job_type: "sandbox_create",
        work: Duration::from_millis(200),
        current: Arc::clone(&current),
        max_seen: Arc::clone(&max_seen),
    }));

    let mut caps = HashMap::new();
    caps.insert("sandbox_create".to_string(), 2);

    let (_dispatcher, handle, queue, poller_handle) =
        start_stack(&pool, "server-a", Arc::new(registry), caps).await;

    for n in 0..10 {
        queue
            .enqueue(
                "sandbox_create",
                &json!({"sandboxId": format!("sb-{n}")}),
                vec![with_project("p1")],
            )
            .await
            .unwrap();
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while count_with_status(&pool, "completed").await < 10 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "jobs did not complete in time"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert_eq!(count_with_status(&pool, "completed").await, 10);
    assert!(
        max_seen.load(Ordering::SeqCst) <= 2,
        "observed {} concurrent executions, cap is 2",
        max_seen.load(Ordering::SeqCst)
    );

    handle.shutdown().await;
    poller_handle.shutdown().await;
}

#[tokio::test]
#[serial]
async fn unregistered_job_type_fails_terminally_without_retries() {
    let pool = setup_db().await;

    // The type is claimable (it has a cap) but nothing can execute it.
    let mut caps = HashMap::new();
    caps.insert("mystery_op".to_string(), 1);

    let (_dispatcher, handle, queue, poller_handle) =
        start_stack(&pool, "server-a", Arc::new(ExecutorRegistry::new()), caps).await;

    let job_id = queue
        .enqueue("mystery_op", &json!({}), vec![with_max_attempts(3)])
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while count_with_status(&pool, "failed").await < 1 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "job did not fail in time"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let job = JobsRepo::new(pool.clone())
        .get_job(job_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, "failed");
    assert_eq!(job.attempts, 1, "an impossible job must not burn retries");
    assert!(job
        .error
        .as_deref()
        .unwrap()
        .contains("no executor registered"));

    handle.shutdown().await;
    poller_handle.shutdown().await;
}

#[tokio::test]
#[serial]
async fn transient_failures_retry_until_success() {
    let pool = setup_db().await;

    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = ExecutorRegistry::new();
    registry.register(Arc::new(FlakyExecutor {
        job_type: "sandbox_create",
        calls: Arc::clone(&calls),
        succeed_on_call: 3,
    }));

    let mut caps = HashMap::new();
    caps.insert("sandbox_create".to_string(), 1);

    let (_dispatcher, handle, queue, poller_handle) =
        start_stack(&pool, "server-a", Arc::new(registry), caps).await;

    let job_id = queue
        .enqueue(
            "sandbox_create",
            &json!({"sandboxId": "sb-flaky"}),
            vec![with_max_attempts(5), with_resource("sandbox", "sb-flaky")],
        )
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while count_with_status(&pool, "completed").await < 1 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "job did not recover in time"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let job = JobsRepo::new(pool.clone())
        .get_job(job_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, "completed");
    assert_eq!(job.attempts, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    handle.shutdown().await;
    poller_handle.shutdown().await;
}

#[tokio::test]
#[serial]
async fn follower_defers_until_the_incumbent_releases() {
    let pool = setup_db().await;
    let repo = JobsRepo::new(pool.clone());

    // Another replica holds a fresh lease.
    assert!(repo
        .try_acquire_leadership("other-server", Duration::from_secs(60))
        .await
        .unwrap());

    let mut registry = ExecutorRegistry::new();
    registry.register(Arc::new(TrackingExecutor {
        job_type: "sandbox_create",
        work: Duration::from_millis(50),
        current: Arc::new(AtomicUsize::new(0)),
        max_seen: Arc::new(AtomicUsize::new(0)),
    }));
    let mut caps = HashMap::new();
    caps.insert("sandbox_create".to_string(), 2);

    let (dispatcher, handle, queue, poller_handle) =
        start_stack(&pool, "server-a", Arc::new(registry), caps).await;

    queue
        .enqueue("sandbox_create", &json!({}), vec![])
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(!dispatcher.is_leader(), "a fresh incumbent must win");
    assert_eq!(count_with_status(&pool, "pending").await, 1);

    repo.release_leadership("other-server").await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while count_with_status(&pool, "completed").await < 1 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "takeover did not happen in time"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(dispatcher.is_leader());

    handle.shutdown().await;
    poller_handle.shutdown().await;
}

#[tokio::test]
#[serial]
async fn shutdown_releases_leadership() {
    let pool = setup_db().await;

    let (dispatcher, handle, _queue, poller_handle) = start_stack(
        &pool,
        "server-a",
        Arc::new(ExecutorRegistry::new()),
        HashMap::new(),
    )
    .await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !dispatcher.is_leader() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "dispatcher never became leader"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    handle.shutdown().await;
    poller_handle.shutdown().await;

    let leaders: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dispatcher_leader")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(leaders, 0, "shutdown should release the leader row");
}
