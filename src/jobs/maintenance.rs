use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;

#[derive(Clone)]
pub struct MaintenanceRepo {
    pool: PgPool,
}

impl MaintenanceRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Move terminal jobs older than `cutoff` into jobs_archive
    /// (idempotent). Archival is the only mutation a terminal row ever
    /// sees. Returns the number archived.
    pub async fn archive_terminal_older_than(
        &self,
        cutoff: DateTime<Utc>,
        batch: i64,
    ) -> anyhow::Result<u64> {
        let mut tx = self.pool.begin().await?;

        // Insert into archive while avoiding duplicates by id.
        sqlx::query(
            r#"
            WITH candidates AS (
                SELECT
                  id, job_type, payload, status, priority, scheduled_at,
                  attempts, max_attempts, error,
                  project_id, resource_type, resource_id,
                  created_at, started_at, completed_at
                FROM jobs
                WHERE status IN ('completed', 'failed')
                  AND completed_at IS NOT NULL
                  AND completed_at < $1
                ORDER BY completed_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $2
            )
            INSERT INTO jobs_archive (
              id, job_type, payload, status, priority, scheduled_at,
              attempts, max_attempts, error,
              project_id, resource_type, resource_id,
              created_at, started_at, completed_at
            )
            SELECT
              c.id, c.job_type, c.payload, c.status, c.priority, c.scheduled_at,
              c.attempts, c.max_attempts, c.error,
              c.project_id, c.resource_type, c.resource_id,
              c.created_at, c.started_at, c.completed_at
            FROM candidates c
            WHERE NOT EXISTS (
              SELECT 1
              FROM jobs_archive a
              WHERE a.id = c.id
            )
            "#,
        )
        .bind(cutoff)
        .bind(batch)
        .execute(&mut *tx)
        .await?;

        // Only delete rows that made it into the archive.
        let deleted = sqlx::query(
            r#"
            DELETE FROM jobs j
            USING jobs_archive a
            WHERE j.id = a.id
              AND j.status IN ('completed', 'failed')
              AND j.completed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        Ok(deleted)
    }
}

/// Convenience: compute cutoff like "now - N days"
pub fn cutoff_days(days: i64) -> DateTime<Utc> {
    Utc::now() - Duration::days(days)
}
