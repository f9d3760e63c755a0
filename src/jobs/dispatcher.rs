use crate::jobs::executor::{ExecutorRegistry, JobContext, JobError};
use crate::jobs::limits::ConcurrencyLimiter;
use crate::jobs::model::Job;
use crate::jobs::repo::JobsRepo;
use crate::jobs::runner::JobRunner;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub enabled: bool,
    pub server_id: String,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub job_timeout: Duration,
    pub stale_job_timeout: Duration,
    pub stale_check_interval: Duration,
    /// Whether Enqueue wakes the processing loop immediately instead of
    /// waiting for the next poll tick.
    pub immediate_execution: bool,
    pub shutdown_grace: Duration,
}

impl DispatcherConfig {
    pub fn for_server(server_id: &str) -> Self {
        Self {
            enabled: true,
            server_id: server_id.to_string(),
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(3),
            heartbeat_timeout: Duration::from_secs(10),
            job_timeout: Duration::from_secs(300),
            stale_job_timeout: Duration::from_secs(600),
            stale_check_interval: Duration::from_secs(60),
            immediate_execution: true,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Bounded, lossy wake signal for the processing loop. A dropped ping is
/// harmless: the next poll tick covers the same work.
#[derive(Clone)]
pub struct DispatchSignal {
    tx: mpsc::Sender<()>,
    immediate: bool,
}

impl DispatchSignal {
    pub fn ping(&self) {
        if self.immediate {
            let _ = self.tx.try_send(());
        }
    }
}

/// Leader-elected job dispatcher.
///
/// Runs three loops: heartbeat (Follower/Leader state), processing
/// (claim + execute while leader), and the stale-job reaper. Leadership
/// is a throughput gate, not the safety net — the claim query stays
/// atomic so the brief dual-leader window during failover cannot
/// double-run a job.
pub struct Dispatcher {
    cfg: DispatcherConfig,
    jobs: JobsRepo,
    runner: JobRunner,
    registry: Arc<ExecutorRegistry>,
    limiter: Arc<ConcurrencyLimiter>,
    ctx: JobContext,

    leader: AtomicBool,
    in_flight: AtomicUsize,
    wake_tx: mpsc::Sender<()>,
    wake_rx: Mutex<Option<mpsc::Receiver<()>>>,
    executions: Mutex<JoinSet<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Dispatcher {
    pub fn new(
        cfg: DispatcherConfig,
        jobs: JobsRepo,
        runner: JobRunner,
        registry: Arc<ExecutorRegistry>,
        limiter: Arc<ConcurrencyLimiter>,
        ctx: JobContext,
    ) -> Arc<Self> {
        let (wake_tx, wake_rx) = mpsc::channel(1);
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            cfg,
            jobs,
            runner,
            registry,
            limiter,
            ctx,
            leader: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            wake_tx,
            wake_rx: Mutex::new(Some(wake_rx)),
            executions: Mutex::new(JoinSet::new()),
            shutdown_tx,
        })
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn signal(&self) -> DispatchSignal {
        DispatchSignal {
            tx: self.wake_tx.clone(),
            immediate: self.cfg.immediate_execution,
        }
    }

    /// Notify hook for `JobQueue::with_notify`.
    pub fn enqueue_notify(&self) -> Arc<dyn Fn() + Send + Sync> {
        let signal = self.signal();
        Arc::new(move || signal.ping())
    }

    /// Spawn the dispatcher loops. With `enabled = false` this server
    /// never competes for leadership and only serves reads/enqueues.
    pub fn start(self: Arc<Self>) -> DispatcherHandle {
        let mut tasks = Vec::new();

        if self.cfg.enabled {
            tasks.push(tokio::spawn(Arc::clone(&self).heartbeat_loop()));
            tasks.push(tokio::spawn(Arc::clone(&self).processing_loop()));
            tasks.push(tokio::spawn(Arc::clone(&self).reaper_loop()));
            tracing::info!(server_id = %self.cfg.server_id, "dispatcher started");
        } else {
            tracing::info!(server_id = %self.cfg.server_id, "dispatcher disabled");
        }

        DispatcherHandle {
            dispatcher: self,
            tasks,
        }
    }

    // ----------------------------
    // Leadership
    // ----------------------------

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            match self
                .jobs
                .try_acquire_leadership(&self.cfg.server_id, self.cfg.heartbeat_timeout)
                .await
            {
                Ok(true) => {
                    if !self.leader.swap(true, Ordering::SeqCst) {
                        tracing::info!(server_id = %self.cfg.server_id, "acquired dispatcher leadership");
                        // Pick up any backlog without waiting for a tick.
                        let _ = self.wake_tx.try_send(());
                    }
                }
                Ok(false) => {
                    if self.leader.swap(false, Ordering::SeqCst) {
                        tracing::info!(server_id = %self.cfg.server_id, "lost dispatcher leadership");
                    }
                }
                // Demote on any uncertainty rather than assume the lease
                // still holds.
                Err(e) => {
                    if self.leader.swap(false, Ordering::SeqCst) {
                        tracing::warn!(error = %e, "heartbeat failed, demoting to follower");
                    } else {
                        tracing::warn!(error = %e, "heartbeat failed");
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.cfg.heartbeat_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    // ----------------------------
    // Processing
    // ----------------------------

    async fn processing_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut wake_rx = self
            .wake_rx
            .lock()
            .expect("wake receiver mutex poisoned")
            .take()
            .expect("dispatcher started twice");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.cfg.poll_interval) => {}
                _ = wake_rx.recv() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }

            if !self.is_leader() {
                continue;
            }

            self.reap_finished_executions();
            Self::drain_claimable(&self).await;
        }
    }

    /// Claim until either capacity or the pending pool runs out, spawning
    /// one execution task per claim.
    async fn drain_claimable(this: &Arc<Self>) {
        loop {
            if !this.is_leader() {
                return;
            }

            let types = this.limiter.claimable_types();
            if types.is_empty() {
                return;
            }

            match this.jobs.claim_job_of_types(&types, &this.cfg.server_id).await {
                Ok(Some(job)) => {
                    this.limiter.acquire(&job.job_type);
                    Self::spawn_execution(this, job);
                }
                Ok(None) => return,
                // Claim errors never crash the loop; the next tick retries.
                Err(e) => {
                    tracing::error!(error = %e, "job claim failed");
                    return;
                }
            }
        }
    }

    fn spawn_execution(this: &Arc<Self>, job: Job) {
        this.in_flight.fetch_add(1, Ordering::SeqCst);
        let dispatcher = Arc::clone(this);

        this.executions
            .lock()
            .expect("executions mutex poisoned")
            .spawn(async move {
                let _slot = SlotGuard {
                    dispatcher: Arc::clone(&dispatcher),
                    job_type: job.job_type.clone(),
                };
                dispatcher.execute_job(job).await;
            });
    }

    async fn execute_job(&self, job: Job) {
        tracing::info!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            "executing job"
        );

        let result = match self.registry.get(&job.job_type) {
            Some(executor) => {
                match tokio::time::timeout(self.cfg.job_timeout, executor.execute(&self.ctx, &job))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(JobError::new(
                        "TIMEOUT",
                        format!(
                            "execution exceeded {}s",
                            self.cfg.job_timeout.as_secs()
                        ),
                    )),
                }
            }
            // No executor can ever succeed for this type; retrying would
            // only burn attempts.
            None => Err(JobError::new(
                "UNREGISTERED_JOB_TYPE",
                format!("no executor registered for job type {}", job.job_type),
            )),
        };

        let outcome = match result {
            Ok(()) => self.runner.on_success(&job).await,
            Err(err) => self.runner.on_failure(&job, &err).await,
        };

        if let Err(e) = outcome {
            tracing::error!(job_id = %job.id, error = %e, "failed to record job outcome");
        }
    }

    fn reap_finished_executions(&self) {
        let mut executions = self.executions.lock().expect("executions mutex poisoned");
        while let Some(joined) = executions.try_join_next() {
            if let Err(e) = joined {
                if e.is_panic() {
                    tracing::error!("job execution task panicked");
                }
            }
        }
    }

    // ----------------------------
    // Stale-job reaper
    // ----------------------------

    async fn reaper_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.cfg.stale_check_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }

            if !self.is_leader() {
                continue;
            }

            match self.jobs.cleanup_stale_jobs(self.cfg.stale_job_timeout).await {
                Ok(0) => {}
                Ok(n) => {
                    tracing::warn!(requeued = n, "requeued stale jobs from crashed workers");
                    let _ = self.wake_tx.try_send(());
                }
                Err(e) => tracing::error!(error = %e, "stale job cleanup failed"),
            }
        }
    }
}

/// Releases the limiter slot and the in-flight count even if the
/// execution future is dropped on timeout, abort, or panic.
struct SlotGuard {
    dispatcher: Arc<Dispatcher>,
    job_type: String,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.dispatcher.limiter.release(&self.job_type);
        self.dispatcher.in_flight.fetch_sub(1, Ordering::SeqCst);
        // New capacity may unblock a pending claim.
        let _ = self.dispatcher.wake_tx.try_send(());
    }
}

pub struct DispatcherHandle {
    dispatcher: Arc<Dispatcher>,
    tasks: Vec<JoinHandle<()>>,
}

impl DispatcherHandle {
    pub fn is_leader(&self) -> bool {
        self.dispatcher.is_leader()
    }

    /// Stop all loops, wait (bounded) for in-flight executions, abort
    /// stragglers, then release leadership so a peer takes over without
    /// waiting out the heartbeat timeout.
    pub async fn shutdown(self) {
        let _ = self.dispatcher.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }

        let deadline = Instant::now() + self.dispatcher.cfg.shutdown_grace;
        while self.dispatcher.in_flight() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let mut executions = {
            let mut guard = self
                .dispatcher
                .executions
                .lock()
                .expect("executions mutex poisoned");
            std::mem::take(&mut *guard)
        };
        let remaining = self.dispatcher.in_flight();
        if remaining > 0 {
            tracing::warn!(remaining, "aborting executions still running at shutdown");
        }
        executions.shutdown().await;

        let was_leader = self.dispatcher.leader.swap(false, Ordering::SeqCst);
        if was_leader {
            if let Err(e) = self
                .dispatcher
                .jobs
                .release_leadership(&self.dispatcher.cfg.server_id)
                .await
            {
                tracing::warn!(error = %e, "failed to release leadership on shutdown");
            }
        }

        tracing::info!(server_id = %self.dispatcher.cfg.server_id, "dispatcher stopped");
    }
}
