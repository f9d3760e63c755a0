use crate::jobs::model::{
    JOB_TYPE_SANDBOX_CREATE, JOB_TYPE_SANDBOX_DESTROY, JOB_TYPE_SESSION_DELETE,
    JOB_TYPE_WORKSPACE_INIT,
};
use std::collections::HashMap;
use std::sync::Mutex;

/// Cap for job types without an explicit entry: serialize them.
const DEFAULT_CAP: usize = 1;

/// Static per-job-type concurrency caps with in-process running counters.
///
/// The cap table is also the authoritative list of claimable job types.
/// Counters are process-local, not cluster-wide: in steady state only the
/// leader claims, and brief over-subscription during a leadership handoff
/// is tolerated as long as executors are idempotent.
pub struct ConcurrencyLimiter {
    caps: HashMap<String, usize>,
    running: Mutex<HashMap<String, usize>>,
}

impl ConcurrencyLimiter {
    pub fn new(caps: HashMap<String, usize>) -> Self {
        Self {
            caps,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Caps for the platform's infrastructure job types: resource-heavy
    /// create/init operations run tighter than lightweight teardown.
    pub fn with_default_caps() -> Self {
        let mut caps = HashMap::new();
        caps.insert(JOB_TYPE_SANDBOX_CREATE.to_string(), 2);
        caps.insert(JOB_TYPE_WORKSPACE_INIT.to_string(), 2);
        caps.insert(JOB_TYPE_SANDBOX_DESTROY.to_string(), 4);
        caps.insert(JOB_TYPE_SESSION_DELETE.to_string(), 4);
        Self::new(caps)
    }

    pub fn cap_for(&self, job_type: &str) -> usize {
        self.caps.get(job_type).copied().unwrap_or(DEFAULT_CAP)
    }

    /// Job types that currently have spare capacity.
    pub fn claimable_types(&self) -> Vec<String> {
        let running = self.running.lock().expect("limiter mutex poisoned");
        self.caps
            .keys()
            .filter(|ty| running.get(*ty).copied().unwrap_or(0) < self.cap_for(ty))
            .cloned()
            .collect()
    }

    /// Count a claimed job against its type. Called right after a
    /// successful claim, before the execution task is spawned.
    pub fn acquire(&self, job_type: &str) {
        let mut running = self.running.lock().expect("limiter mutex poisoned");
        *running.entry(job_type.to_string()).or_insert(0) += 1;
    }

    /// Release a slot when the execution task finishes, whatever the
    /// outcome.
    pub fn release(&self, job_type: &str) {
        let mut running = self.running.lock().expect("limiter mutex poisoned");
        if let Some(count) = running.get_mut(job_type) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn running_count(&self, job_type: &str) -> usize {
        let running = self.running.lock().expect("limiter mutex poisoned");
        running.get(job_type).copied().unwrap_or(0)
    }
}
