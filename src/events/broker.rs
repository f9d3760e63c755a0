use crate::events::model::{
    NewProjectEvent, ProjectEvent, EVENT_JOB_COMPLETED, EVENT_SESSION_UPDATED,
    EVENT_WORKSPACE_UPDATED,
};
use crate::events::poller::EventPoller;
use crate::events::repo::EventsRepo;
use crate::jobs::model::{Job, JobStatus};
use crate::jobs::repo::JobsRepo;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Terminal outcome of a job as seen by a synchronous waiter.
#[derive(Debug, Clone)]
pub struct JobCompletion {
    pub job_id: Option<Uuid>,
    pub status: String,
    pub error: Option<String>,
}

impl JobCompletion {
    fn from_job(job: &Job) -> Self {
        Self {
            job_id: Some(job.id),
            status: job.status.clone(),
            error: job.error.clone(),
        }
    }
}

/// Publishes events durable-write-first, then notifies the in-process
/// poller. The persisted row (with its DB-assigned seq) is the source of
/// truth; the broadcast is only a latency optimization.
#[derive(Clone)]
pub struct EventBroker {
    events: EventsRepo,
    jobs: JobsRepo,
    poller: Arc<EventPoller>,
    wait_poll_interval: Duration,
}

impl EventBroker {
    pub fn new(
        events: EventsRepo,
        jobs: JobsRepo,
        poller: Arc<EventPoller>,
        wait_poll_interval: Duration,
    ) -> Self {
        Self {
            events,
            jobs,
            poller,
            wait_poll_interval,
        }
    }

    pub async fn publish(
        &self,
        project_id: &str,
        event_type: &str,
        data: Value,
    ) -> anyhow::Result<ProjectEvent> {
        let event = NewProjectEvent {
            id: Uuid::new_v4(),
            project_id: project_id.to_string(),
            event_type: event_type.to_string(),
            data,
        };

        let row = self.events.create_event(&event).await?;
        self.poller.ping();
        Ok(row)
    }

    // ----------------------------
    // Typed publishers
    // ----------------------------

    pub async fn publish_session_updated(
        &self,
        project_id: &str,
        session_id: &str,
        status: &str,
        commit_status: Option<&str>,
    ) -> anyhow::Result<ProjectEvent> {
        self.publish(
            project_id,
            EVENT_SESSION_UPDATED,
            json!({
                "sessionId": session_id,
                "status": status,
                "commitStatus": commit_status,
            }),
        )
        .await
    }

    pub async fn publish_workspace_updated(
        &self,
        project_id: &str,
        workspace_id: &str,
        status: &str,
    ) -> anyhow::Result<ProjectEvent> {
        self.publish(
            project_id,
            EVENT_WORKSPACE_UPDATED,
            json!({
                "workspaceId": workspace_id,
                "status": status,
            }),
        )
        .await
    }

    /// Completion event for a terminal job, scoped to the job's project.
    pub async fn publish_job_completed(
        &self,
        job: &Job,
        status: &str,
        error: Option<&str>,
    ) -> anyhow::Result<ProjectEvent> {
        let project_id = job.project_id.clone().unwrap_or_default();
        self.publish(
            &project_id,
            EVENT_JOB_COMPLETED,
            json!({
                "jobId": job.id,
                "jobType": job.job_type,
                "resourceType": job.resource_type,
                "resourceId": job.resource_id,
                "status": status,
                "error": error,
            }),
        )
        .await
    }

    // ----------------------------
    // Synchronous wait bridge
    // ----------------------------

    /// Block until the job correlated with (`resource_type`,
    /// `resource_id`) reaches a terminal state.
    ///
    /// Fast path is a matching completion event from the subscription;
    /// the periodic direct store re-poll is the fallback when an
    /// in-memory notification was dropped. Bound the call with
    /// `tokio::time::timeout` — cancelling the wait never cancels the
    /// underlying job.
    pub async fn wait_for_job_completion(
        &self,
        project_id: &str,
        resource_type: &str,
        resource_id: &str,
    ) -> anyhow::Result<JobCompletion> {
        // Completion may predate the call entirely.
        if let Some(done) = self.poll_terminal(resource_type, resource_id).await? {
            return Ok(done);
        }

        let mut subscription = Arc::clone(&self.poller).subscribe(project_id);

        // Re-check after subscribing: the job may have completed between
        // the first check and the subscription becoming live.
        if let Some(done) = self.poll_terminal(resource_type, resource_id).await? {
            return Ok(done);
        }

        let mut poll_tick = tokio::time::interval(self.wait_poll_interval);
        loop {
            tokio::select! {
                event = subscription.recv() => {
                    match event {
                        Some(event) => {
                            if let Some(done) = completion_from_event(&event, resource_type, resource_id) {
                                return Ok(done);
                            }
                        }
                        // Poller went away; fall back to pure polling.
                        None => break,
                    }
                }
                _ = poll_tick.tick() => {
                    if let Some(done) = self.poll_terminal(resource_type, resource_id).await? {
                        return Ok(done);
                    }
                }
            }
        }

        loop {
            poll_tick.tick().await;
            if let Some(done) = self.poll_terminal(resource_type, resource_id).await? {
                return Ok(done);
            }
        }
    }

    async fn poll_terminal(
        &self,
        resource_type: &str,
        resource_id: &str,
    ) -> anyhow::Result<Option<JobCompletion>> {
        let job = self.jobs.get_job_by_resource(resource_type, resource_id).await?;
        Ok(job.filter(|j| j.is_terminal()).map(|j| JobCompletion::from_job(&j)))
    }
}

/// Extract a completion for the watched resource from a broadcast event,
/// if it is one.
fn completion_from_event(
    event: &ProjectEvent,
    resource_type: &str,
    resource_id: &str,
) -> Option<JobCompletion> {
    if event.event_type != EVENT_JOB_COMPLETED {
        return None;
    }
    if event.data.get("resourceType").and_then(Value::as_str) != Some(resource_type)
        || event.data.get("resourceId").and_then(Value::as_str) != Some(resource_id)
    {
        return None;
    }

    let status = event
        .data
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or(JobStatus::Failed.as_str())
        .to_string();

    Some(JobCompletion {
        job_id: event
            .data
            .get("jobId")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok()),
        status,
        error: event
            .data
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn completed_event(resource_type: &str, resource_id: &str) -> ProjectEvent {
        ProjectEvent {
            id: Uuid::new_v4(),
            project_id: "p1".to_string(),
            event_type: EVENT_JOB_COMPLETED.to_string(),
            data: json!({
                "jobId": Uuid::new_v4(),
                "jobType": "sandbox_create",
                "resourceType": resource_type,
                "resourceId": resource_id,
                "status": "completed",
                "error": null,
            }),
            seq: 1,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn completion_matches_resource_keys() {
        let event = completed_event("sandbox", "sb-1");

        let done = completion_from_event(&event, "sandbox", "sb-1").unwrap();
        assert_eq!(done.status, "completed");
        assert!(done.error.is_none());

        assert!(completion_from_event(&event, "sandbox", "sb-2").is_none());
        assert!(completion_from_event(&event, "session", "sb-1").is_none());
    }

    #[test]
    fn non_completion_events_are_ignored() {
        let mut event = completed_event("sandbox", "sb-1");
        event.event_type = EVENT_SESSION_UPDATED.to_string();
        assert!(completion_from_event(&event, "sandbox", "sb-1").is_none());
    }
}
