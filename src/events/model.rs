use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

pub const EVENT_SESSION_UPDATED: &str = "session_updated";
pub const EVENT_WORKSPACE_UPDATED: &str = "workspace_updated";
pub const EVENT_JOB_COMPLETED: &str = "job_completed";

/// A persisted, project-scoped domain event.
///
/// `seq` is assigned by the database and strictly increasing across the
/// whole table; it is the durable total order consumers replay from.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProjectEvent {
    pub id: Uuid,
    pub project_id: String,
    pub event_type: String,
    pub data: Value,
    pub seq: i64,
    pub created_at: DateTime<Utc>,
}

impl ProjectEvent {
    /// Shape consumed by the SSE layer.
    pub fn wire(&self) -> WireEvent<'_> {
        WireEvent {
            id: self.id,
            seq: self.seq,
            event_type: &self.event_type,
            timestamp: self.created_at,
            data: &self.data,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WireEvent<'a> {
    pub id: Uuid,
    pub seq: i64,
    #[serde(rename = "type")]
    pub event_type: &'a str,
    pub timestamp: DateTime<Utc>,
    pub data: &'a Value,
}

#[derive(Debug, Clone)]
pub struct NewProjectEvent {
    pub id: Uuid,
    pub project_id: String,
    pub event_type: String,
    pub data: Value,
}
