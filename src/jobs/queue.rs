use crate::jobs::model::NewJob;
use crate::jobs::repo::JobsRepo;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Mutation applied to the draft job row before it is persisted.
pub type EnqueueOption = Box<dyn FnOnce(&mut NewJob) + Send>;

pub fn with_priority(priority: i32) -> EnqueueOption {
    Box::new(move |job| job.priority = priority)
}

pub fn with_max_attempts(max_attempts: i32) -> EnqueueOption {
    Box::new(move |job| job.max_attempts = max_attempts.max(1))
}

pub fn with_scheduled_at(at: DateTime<Utc>) -> EnqueueOption {
    Box::new(move |job| job.scheduled_at = at)
}

pub fn with_project(project_id: &str) -> EnqueueOption {
    let project_id = project_id.to_string();
    Box::new(move |job| job.project_id = Some(project_id))
}

/// Correlation keys tying the job to the externally-visible entity it
/// affects; consumed by the wait-for-completion bridge.
pub fn with_resource(resource_type: &str, resource_id: &str) -> EnqueueOption {
    let resource_type = resource_type.to_string();
    let resource_id = resource_id.to_string();
    Box::new(move |job| {
        job.resource_type = Some(resource_type);
        job.resource_id = Some(resource_id);
    })
}

/// Producer-side handle: persists pending job rows and pings the
/// dispatcher so it does not wait for the next poll tick.
#[derive(Clone)]
pub struct JobQueue {
    jobs: JobsRepo,
    notify: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl JobQueue {
    pub fn new(jobs: JobsRepo) -> Self {
        Self { jobs, notify: None }
    }

    /// Wire the dispatcher's wake signal (or any other hook) into enqueue.
    pub fn with_notify(mut self, notify: Arc<dyn Fn() + Send + Sync>) -> Self {
        self.notify = Some(notify);
        self
    }

    /// Serialize `payload`, persist a pending job, then signal the
    /// dispatcher. An error here means the job was never scheduled —
    /// callers must treat it as a synchronous failure.
    pub async fn enqueue<P: Serialize>(
        &self,
        job_type: &str,
        payload: &P,
        options: Vec<EnqueueOption>,
    ) -> anyhow::Result<Uuid> {
        let payload = serde_json::to_value(payload)?;

        let mut job = NewJob::new(job_type, payload);
        for option in options {
            option(&mut job);
        }

        let id = self.jobs.create_job(&job).await?;

        if let Some(notify) = &self.notify {
            notify();
        }

        Ok(id)
    }
}
