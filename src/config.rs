use crate::jobs::dispatcher::DispatcherConfig;
use std::time::Duration;

/// Runtime configuration, loaded from `OPSFLOW_*` environment variables
/// (with a `.env` file honored in development).
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub server_id: String,

    pub dispatcher_enabled: bool,
    pub dispatcher_poll_interval: Duration,
    pub dispatcher_heartbeat_interval: Duration,
    pub dispatcher_heartbeat_timeout: Duration,
    pub dispatcher_job_timeout: Duration,
    pub dispatcher_stale_job_timeout: Duration,
    pub dispatcher_stale_check_interval: Duration,
    pub dispatcher_immediate_execution: bool,
    pub shutdown_grace: Duration,

    pub event_poll_interval: Duration,
    pub event_batch_size: i64,
    pub subscriber_buffer: usize,
    pub wait_poll_interval: Duration,

    pub migrate_on_startup: bool,
    pub archive_after_days: i64,
    pub maintenance_interval: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let server_id = env_string("OPSFLOW_SERVER_ID")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "server-1".to_string());

        Ok(Self {
            database_url,
            server_id,

            dispatcher_enabled: env_bool("OPSFLOW_DISPATCHER_ENABLED").unwrap_or(true),
            dispatcher_poll_interval: env_millis("OPSFLOW_DISPATCHER_POLL_INTERVAL_MS", 1_000),
            dispatcher_heartbeat_interval: env_millis(
                "OPSFLOW_DISPATCHER_HEARTBEAT_INTERVAL_MS",
                3_000,
            ),
            dispatcher_heartbeat_timeout: env_millis(
                "OPSFLOW_DISPATCHER_HEARTBEAT_TIMEOUT_MS",
                10_000,
            ),
            dispatcher_job_timeout: env_secs("OPSFLOW_DISPATCHER_JOB_TIMEOUT_SECS", 300),
            dispatcher_stale_job_timeout: env_secs("OPSFLOW_DISPATCHER_STALE_JOB_TIMEOUT_SECS", 600),
            dispatcher_stale_check_interval: env_secs(
                "OPSFLOW_DISPATCHER_STALE_CHECK_INTERVAL_SECS",
                60,
            ),
            dispatcher_immediate_execution: env_bool("OPSFLOW_DISPATCHER_IMMEDIATE_EXECUTION")
                .unwrap_or(true),
            shutdown_grace: env_secs("OPSFLOW_SHUTDOWN_GRACE_SECS", 10),

            event_poll_interval: env_millis("OPSFLOW_EVENT_POLL_INTERVAL_MS", 1_000),
            event_batch_size: env_parse("OPSFLOW_EVENT_BATCH_SIZE").unwrap_or(200),
            subscriber_buffer: env_parse("OPSFLOW_SUBSCRIBER_BUFFER").unwrap_or(64),
            wait_poll_interval: env_millis("OPSFLOW_WAIT_POLL_INTERVAL_MS", 2_000),

            migrate_on_startup: env_bool("OPSFLOW_MIGRATE_ON_STARTUP").unwrap_or(false),
            archive_after_days: env_parse("OPSFLOW_ARCHIVE_AFTER_DAYS").unwrap_or(7),
            maintenance_interval: env_secs("OPSFLOW_MAINTENANCE_INTERVAL_SECS", 3_600),
        })
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            enabled: self.dispatcher_enabled,
            server_id: self.server_id.clone(),
            poll_interval: self.dispatcher_poll_interval,
            heartbeat_interval: self.dispatcher_heartbeat_interval,
            heartbeat_timeout: self.dispatcher_heartbeat_timeout,
            job_timeout: self.dispatcher_job_timeout,
            stale_job_timeout: self.dispatcher_stale_job_timeout,
            stale_check_interval: self.dispatcher_stale_check_interval,
            immediate_execution: self.dispatcher_immediate_execution,
            shutdown_grace: self.shutdown_grace,
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|s| s.parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env_string(key).map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn env_millis(key: &str, default: u64) -> Duration {
    Duration::from_millis(env_parse(key).unwrap_or(default))
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_parse(key).unwrap_or(default))
}
