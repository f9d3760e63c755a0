use crate::jobs::model::Job;
use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Executor failure with a stable code for retry classification.
#[derive(Debug)]
pub struct JobError {
    pub code: &'static str,
    pub message: String,
}

impl JobError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Whether another attempt could plausibly succeed. Unknown codes are
    /// treated as retryable; the attempt budget is the real backstop.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.code, "BAD_PAYLOAD" | "UNREGISTERED_JOB_TYPE")
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for JobError {}

/// Shared resources handed to every executor.
#[derive(Clone)]
pub struct JobContext {
    pub db: PgPool,
    pub server_id: String,
}

/// One implementation per job type; sandbox/workspace/session providers
/// live outside this crate and plug in through this trait.
///
/// Executors must be idempotent (a job can run more than once under
/// at-least-once delivery) and must return promptly when their future is
/// dropped on timeout or shutdown — the retry policy reclaims the job.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    fn job_type(&self) -> &str;

    async fn execute(&self, ctx: &JobContext, job: &Job) -> Result<(), JobError>;
}

/// Registry of executors keyed by job type.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn JobExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: Arc<dyn JobExecutor>) {
        self.executors
            .insert(executor.job_type().to_string(), executor);
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobExecutor>> {
        self.executors.get(job_type).cloned()
    }

    pub fn job_types(&self) -> Vec<String> {
        self.executors.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopExecutor;

    #[async_trait]
    impl JobExecutor for NoopExecutor {
        fn job_type(&self) -> &str {
            "noop"
        }

        async fn execute(&self, _ctx: &JobContext, _job: &Job) -> Result<(), JobError> {
            Ok(())
        }
    }

    #[test]
    fn registry_lookup_by_type() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(NoopExecutor));

        assert!(registry.get("noop").is_some());
        assert!(registry.get("other").is_none());
        assert_eq!(registry.job_types(), vec!["noop".to_string()]);
    }

    #[test]
    fn payload_and_unregistered_errors_are_terminal() {
        assert!(!JobError::new("BAD_PAYLOAD", "x").is_retryable());
        assert!(!JobError::new("UNREGISTERED_JOB_TYPE", "x").is_retryable());
        assert!(JobError::new("TIMEOUT", "x").is_retryable());
        assert!(JobError::new("SANDBOX_API", "x").is_retryable());
    }
}
