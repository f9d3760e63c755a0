use crate::events::model::{NewProjectEvent, ProjectEvent};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

#[derive(Clone)]
pub struct EventsRepo {
    pool: PgPool,
}

impl EventsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Persist one event; the database assigns `seq` and `created_at`.
    pub async fn create_event(&self, event: &NewProjectEvent) -> anyhow::Result<ProjectEvent> {
        let row = sqlx::query_as::<_, ProjectEvent>(
            r#"
            INSERT INTO project_events (id, project_id, event_type, data)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(event.id)
        .bind(&event.project_id)
        .bind(&event.event_type)
        .bind(&event.data)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    /// Global tail for the poller, all projects, seq order.
    pub async fn list_after_seq(
        &self,
        after_seq: i64,
        limit: i64,
    ) -> anyhow::Result<Vec<ProjectEvent>> {
        let rows = sqlx::query_as::<_, ProjectEvent>(
            r#"
            SELECT *
            FROM project_events
            WHERE seq > $1
            ORDER BY seq ASC
            LIMIT $2
            "#,
        )
        .bind(after_seq)
        .bind(limit.clamp(1, 1000))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Highest assigned seq, 0 on an empty table.
    pub async fn max_seq(&self) -> anyhow::Result<i64> {
        let seq: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) FROM project_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(seq)
    }

    // ----------------------------
    // Replay (per project)
    // ----------------------------
    // The durable fallback for subscribers that missed an in-memory
    // broadcast; strictly scoped to one project.

    pub async fn list_project_events_after_seq(
        &self,
        project_id: &str,
        after_seq: i64,
        limit: i64,
    ) -> anyhow::Result<Vec<ProjectEvent>> {
        let rows = sqlx::query_as::<_, ProjectEvent>(
            r#"
            SELECT *
            FROM project_events
            WHERE project_id = $1
              AND seq > $2
            ORDER BY seq ASC
            LIMIT $3
            "#,
        )
        .bind(project_id)
        .bind(after_seq)
        .bind(limit.clamp(1, 1000))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn list_project_events_since(
        &self,
        project_id: &str,
        since: DateTime<Utc>,
        limit: i64,
    ) -> anyhow::Result<Vec<ProjectEvent>> {
        let rows = sqlx::query_as::<_, ProjectEvent>(
            r#"
            SELECT *
            FROM project_events
            WHERE project_id = $1
              AND created_at >= $2
            ORDER BY seq ASC
            LIMIT $3
            "#,
        )
        .bind(project_id)
        .bind(since)
        .bind(limit.clamp(1, 1000))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
