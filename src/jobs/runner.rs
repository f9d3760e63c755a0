use crate::events::broker::EventBroker;
use crate::jobs::executor::JobError;
use crate::jobs::model::{Job, JobStatus};
use crate::jobs::repo::JobsRepo;
use crate::jobs::retry::{next_delay_seconds, RetryConfig};
use chrono::Utc;
use rand::{rngs::StdRng, SeedableRng};

/// Applies execution outcomes: terminal transitions, retry scheduling,
/// and completion events. The status transition is durable before the
/// event is published; a failed publish is logged and left to the
/// waiters' poll fallback.
#[derive(Clone)]
pub struct JobRunner {
    jobs: JobsRepo,
    broker: EventBroker,
    retry_cfg: RetryConfig,
}

impl JobRunner {
    pub fn new(jobs: JobsRepo, broker: EventBroker, retry_cfg: RetryConfig) -> Self {
        Self {
            jobs,
            broker,
            retry_cfg,
        }
    }

    pub async fn on_success(&self, job: &Job) -> anyhow::Result<()> {
        self.jobs.mark_completed(job.id).await?;

        if let Err(e) = self
            .broker
            .publish_job_completed(job, JobStatus::Completed.as_str(), None)
            .await
        {
            tracing::warn!(job_id = %job.id, error = %e, "failed to publish completion event");
        }

        Ok(())
    }

    /// Retry with backoff while attempts remain and the error is
    /// retryable; otherwise fail terminally and publish the completion.
    /// Transient failures stay invisible externally except as latency.
    pub async fn on_failure(&self, job: &Job, err: &JobError) -> anyhow::Result<()> {
        let can_retry = err.is_retryable() && job.retries_remaining();

        if can_retry {
            let mut rng = StdRng::from_entropy();
            let delay_secs = next_delay_seconds(job.attempts, &self.retry_cfg, &mut rng);
            let next_attempt_at = Utc::now() + chrono::Duration::seconds(delay_secs);

            tracing::info!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempt = job.attempts,
                delay_secs,
                error = %err,
                "job failed, requeueing for retry"
            );

            self.jobs
                .requeue_for_retry(job.id, next_attempt_at, &err.to_string())
                .await?;
        } else {
            tracing::warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempt = job.attempts,
                error = %err,
                "job failed terminally"
            );

            self.jobs.mark_failed(job.id, &err.to_string()).await?;

            if let Err(e) = self
                .broker
                .publish_job_completed(job, JobStatus::Failed.as_str(), Some(&err.to_string()))
                .await
            {
                tracing::warn!(job_id = %job.id, error = %e, "failed to publish completion event");
            }
        }

        Ok(())
    }
}
