use crate::events::model::ProjectEvent;
use crate::events::repo::EventsRepo;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Live, in-memory consumer of one project's events. Never persisted,
/// never shared across processes.
struct Subscriber {
    project_id: String,
    tx: mpsc::Sender<ProjectEvent>,
}

/// Receiving side handed to the connection (or waiter) that subscribed.
/// Dropping it detaches the subscriber from the poller.
pub struct Subscription {
    pub id: Uuid,
    rx: mpsc::Receiver<ProjectEvent>,
    poller: Arc<EventPoller>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<ProjectEvent> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.poller.unsubscribe(self.id);
    }
}

/// Single per-process poll loop over the event table.
///
/// Starts from `MAX(seq)` so history is never re-broadcast, then fans each
/// new row out to live subscribers with a matching project id. Delivery is
/// best-effort and non-blocking: a full subscriber buffer drops that event
/// for that subscriber — the durable replay queries are the correctness
/// fallback for slow clients.
pub struct EventPoller {
    events: EventsRepo,
    poll_interval: Duration,
    batch_size: i64,
    subscriber_buffer: usize,
    subscribers: Mutex<HashMap<Uuid, Subscriber>>,
    notify: Notify,
}

impl EventPoller {
    pub fn new(
        events: EventsRepo,
        poll_interval: Duration,
        batch_size: i64,
        subscriber_buffer: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            events,
            poll_interval,
            batch_size: batch_size.clamp(1, 1000),
            subscriber_buffer: subscriber_buffer.max(1),
            subscribers: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        })
    }

    /// Wake the poll loop ahead of its next tick. Bounded and lossy on
    /// purpose: a missed wakeup is recovered by the timer.
    pub fn ping(&self) {
        self.notify.notify_one();
    }

    pub fn subscribe(self: Arc<Self>, project_id: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(self.subscriber_buffer);
        let id = Uuid::new_v4();

        self.subscribers
            .lock()
            .expect("subscriber map mutex poisoned")
            .insert(
                id,
                Subscriber {
                    project_id: project_id.to_string(),
                    tx,
                },
            );

        Subscription {
            id,
            rx,
            poller: self,
        }
    }

    pub fn unsubscribe(&self, id: Uuid) {
        self.subscribers
            .lock()
            .expect("subscriber map mutex poisoned")
            .remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("subscriber map mutex poisoned")
            .len()
    }

    pub fn start(self: Arc<Self>) -> PollerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(&self).run(shutdown_rx));
        PollerHandle { shutdown_tx, task }
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut last_seq = loop {
            match self.events.max_seq().await {
                Ok(seq) => break seq,
                Err(e) => {
                    tracing::error!(error = %e, "event poller failed to read max seq, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => return,
                    }
                }
            }
        };
        tracing::debug!(last_seq, "event poller started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.notify.notified() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::debug!("event poller shutting down");
                        return;
                    }
                }
            }

            // Drain everything past last_seq in bounded batches.
            loop {
                let rows = match self.events.list_after_seq(last_seq, self.batch_size).await {
                    Ok(rows) => rows,
                    Err(e) => {
                        tracing::warn!(error = %e, "event poll failed, will retry on next tick");
                        break;
                    }
                };

                let batch_full = rows.len() as i64 == self.batch_size;
                for row in &rows {
                    last_seq = row.seq;
                    self.fan_out(row);
                }
                if !batch_full {
                    break;
                }
            }
        }
    }

    /// Push one event to every live subscriber on its project. Full
    /// buffers drop the event for that subscriber; closed receivers are
    /// pruned.
    fn fan_out(&self, event: &ProjectEvent) {
        let mut dead = Vec::new();
        {
            let subscribers = self
                .subscribers
                .lock()
                .expect("subscriber map mutex poisoned");
            for (id, sub) in subscribers.iter() {
                if sub.project_id != event.project_id {
                    continue;
                }
                match sub.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::debug!(
                            subscriber = %id,
                            seq = event.seq,
                            "subscriber buffer full, dropping event"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dead.push(*id);
                    }
                }
            }
        }
        for id in dead {
            self.unsubscribe(id);
        }
    }
}

pub struct PollerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}
