use crate::jobs::model::{Job, JobStatus, NewJob};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone)]
pub struct JobsRepo {
    pool: PgPool,
}

impl JobsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ----------------------------
    // Writes
    // ----------------------------

    pub async fn create_job(&self, job: &NewJob) -> anyhow::Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, job_type, payload, status, priority, scheduled_at,
                max_attempts, project_id, resource_type, resource_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(id)
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(JobStatus::Pending.as_str())
        .bind(job.priority)
        .bind(job.scheduled_at)
        .bind(job.max_attempts)
        .bind(&job.project_id)
        .bind(&job.resource_type)
        .bind(&job.resource_id)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    // ----------------------------
    // Reads
    // ----------------------------

    pub async fn get_job(&self, job_id: Uuid) -> anyhow::Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    /// Latest job touching a given external resource, terminal or not.
    pub async fn get_job_by_resource(
        &self,
        resource_type: &str,
        resource_id: &str,
    ) -> anyhow::Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            SELECT *
            FROM jobs
            WHERE resource_type = $1 AND resource_id = $2
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(resource_type)
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    // ----------------------------
    // Claiming
    // ----------------------------

    /// Claim exactly one pending job whose type is in `job_types`.
    ///
    /// Correctness: SELECT ... FOR UPDATE SKIP LOCKED inside the UPDATE's
    /// CTE — two concurrent callers are never handed the same row, with or
    /// without a leader gating them.
    ///
    /// Order: priority DESC, scheduled_at ASC, created_at ASC, id ASC.
    /// The id tiebreaker keeps the order deterministic when created_at
    /// collides at the clock's resolution.
    pub async fn claim_job_of_types(
        &self,
        job_types: &[String],
        worker_id: &str,
    ) -> anyhow::Result<Option<Job>> {
        if job_types.is_empty() {
            return Ok(None);
        }

        let claimed = sqlx::query_as::<_, Job>(
            r#"
            WITH candidate AS (
                SELECT id
                FROM jobs
                WHERE status = 'pending'
                  AND scheduled_at <= now()
                  AND job_type = ANY($1)
                ORDER BY priority DESC, scheduled_at ASC, created_at ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            UPDATE jobs j
            SET status = 'running',
                worker_id = $2,
                attempts = j.attempts + 1,
                started_at = now(),
                error = NULL
            FROM candidate c
            WHERE j.id = c.id
            RETURNING j.*
            "#,
        )
        .bind(job_types.to_vec())
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed)
    }

    // ----------------------------
    // State transitions
    // ----------------------------
    // Every transition is guarded on the current status so a terminal row
    // never mutates again (archival is the only later touch).

    pub async fn mark_completed(&self, job_id: Uuid) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                worker_id = NULL,
                completed_at = now()
            WHERE id = $1
              AND status = 'running'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Return a failed job to the pending pool for another attempt.
    pub async fn requeue_for_retry(
        &self,
        job_id: Uuid,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                worker_id = NULL,
                scheduled_at = $2,
                error = $3,
                started_at = NULL
            WHERE id = $1
              AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(next_attempt_at)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn mark_failed(&self, job_id: Uuid, error: &str) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                worker_id = NULL,
                error = $2,
                completed_at = now()
            WHERE id = $1
              AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ----------------------------
    // Stale-job recovery
    // ----------------------------

    /// Requeue jobs stuck `running` past `stale_after` — the claim of a
    /// crashed process. Only rows well past the timeout are touched, so
    /// this is safe to run alongside normal claiming.
    pub async fn cleanup_stale_jobs(&self, stale_after: Duration) -> anyhow::Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                worker_id = NULL,
                started_at = NULL
            WHERE status = 'running'
              AND started_at IS NOT NULL
              AND started_at < now() - ($1::bigint * interval '1 millisecond')
            "#,
        )
        .bind(stale_after.as_millis() as i64)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    // ----------------------------
    // Leader heartbeat
    // ----------------------------

    /// Acquire or refresh dispatcher leadership for `server_id`.
    ///
    /// One atomic upsert against the singleton row: the insert wins when no
    /// leader exists; the conflict update wins only when the row already
    /// belongs to `server_id` or the incumbent's heartbeat is older than
    /// `timeout`. Returns whether this server is now the leader.
    pub async fn try_acquire_leadership(
        &self,
        server_id: &str,
        timeout: Duration,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            INSERT INTO dispatcher_leader (id, server_id, heartbeat_at)
            VALUES (TRUE, $1, now())
            ON CONFLICT (id) DO UPDATE
            SET server_id = EXCLUDED.server_id,
                heartbeat_at = now()
            WHERE dispatcher_leader.server_id = EXCLUDED.server_id
               OR dispatcher_leader.heartbeat_at
                    < now() - ($2::bigint * interval '1 millisecond')
            "#,
        )
        .bind(server_id)
        .bind(timeout.as_millis() as i64)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() > 0)
    }

    /// Best-effort release on shutdown so a peer can take over without
    /// waiting out the heartbeat timeout.
    pub async fn release_leadership(&self, server_id: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM dispatcher_leader WHERE server_id = $1")
            .bind(server_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
