use chrono::{DateTime, Utc};

use serde_json::Value;

use uuid::Uuid;

// Infrastructure job types known to the platform. The concurrency cap
// table in `limits.rs` is keyed by these.
pub const JOB_TYPE_SANDBOX_CREATE: &str = "sandbox_create";
pub const JOB_TYPE_SANDBOX_DESTROY: &str = "sandbox_destroy";
pub const JOB_TYPE_WORKSPACE_INIT: &str = "workspace_init";
pub const JOB_TYPE_SESSION_DELETE: &str = "session_delete";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub payload: Value,
    pub status: String,
    pub priority: i32,
    pub scheduled_at: DateTime<Utc>,
    pub attempts: i32,
    pub max_attempts: i32,

    pub worker_id: Option<String>,
    pub error: Option<String>,

    pub project_id: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status == JobStatus::Completed.as_str() || self.status == JobStatus::Failed.as_str()
    }

    /// Whether another failed attempt would still be retried.
    pub fn retries_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub payload: Value,
    pub priority: i32,
    pub scheduled_at: DateTime<Utc>,
    pub max_attempts: i32,
    pub project_id: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
}

impl NewJob {
    pub fn new(job_type: &str, payload: Value) -> Self {
        Self {
            job_type: job_type.to_string(),
            payload,
            priority: 0,
            scheduled_at: Utc::now(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            project_id: None,
            resource_type: None,
            resource_id: None,
        }
    }
}

pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}
