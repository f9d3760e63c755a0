//! opsflow — job dispatch and event broadcast for the sandbox platform.
//!
//! A PostgreSQL-backed, leader-elected job queue that executes
//! asynchronous infrastructure operations (sandbox create/destroy,
//! workspace init, session delete) with bounded per-type concurrency,
//! retry-with-backoff, and crash recovery — paired with a durable event
//! log whose in-process poller fans resource-state changes out to any
//! number of server replicas in real time.
//!
//! Building blocks:
//!
//! - [`jobs::JobQueue`] — producer side: persist a pending job, wake the
//!   dispatcher.
//! - [`jobs::Dispatcher`] — leader election, the claim/execute loop, and
//!   stale-job recovery.
//! - [`jobs::JobExecutor`] — the contract sandbox/workspace/session
//!   providers implement.
//! - [`events::EventBroker`] — durable-write-then-broadcast publishing
//!   and the synchronous wait-for-completion bridge.
//! - [`events::EventPoller`] — per-process fan-out to project-scoped
//!   subscribers.

pub mod config;
pub mod db;
pub mod events;
pub mod jobs;
