//! Poll loop and worker pool.
//!
//! One poll task asks the persistence provider for due instances and feeds
//! their ids into a bounded queue; `worker_count` workers drain the queue and
//! run one cycle per id. The poll task wakes on its interval, on a hint from
//! the host or a worker, or on cancellation.

use crate::context::EngineContext;
use crate::worker::{CycleOutcome, Worker};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use workflow_core::instance::WorkflowStatus;

/// Ids that are queued or being worked on by this node.
#[derive(Clone, Default)]
struct InFlight(Arc<Mutex<HashSet<String>>>);

impl InFlight {
    fn insert(&self, id: &str) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string())
    }

    fn remove(&self, id: &str) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).remove(id);
    }
}

pub(crate) struct Scheduler {
    context: Arc<EngineContext>,
    hint: Arc<Notify>,
    cancellation: CancellationToken,
    in_flight: InFlight,
}

impl Scheduler {
    pub(crate) fn new(
        context: Arc<EngineContext>,
        hint: Arc<Notify>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            context,
            hint,
            cancellation,
            in_flight: InFlight::default(),
        }
    }

    /// Spawn the poll task and the workers.
    pub(crate) fn spawn(self) -> Vec<JoinHandle<()>> {
        let config = &self.context.config;
        let (tx, rx) = mpsc::channel::<String>(config.queue_capacity.get());
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = Vec::with_capacity(config.worker_count.get() + 1);
        for n in 0..config.worker_count.get() {
            let worker = Worker::new(
                format!("{}-{n}", config.node_id),
                Arc::clone(&self.context),
                self.cancellation.clone(),
            );
            handles.push(tokio::spawn(run_worker(
                worker,
                Arc::clone(&rx),
                self.in_flight.clone(),
                Arc::clone(&self.hint),
                self.cancellation.clone(),
            )));
        }
        handles.push(tokio::spawn(self.poll(tx)));
        handles
    }

    async fn poll(self, tx: mpsc::Sender<String>) {
        let config = &self.context.config;
        let mut interval = time::interval(config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            node_id = %config.node_id,
            workers = config.worker_count.get(),
            "Scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => break,
                _ = interval.tick() => {}
                _ = self.hint.notified() => {}
            }

            let ids = match self
                .context
                .persistence
                .list_runnable(Utc::now(), config.batch_size.get())
                .await
            {
                Ok(ids) => ids,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to list runnable instances");
                    continue;
                }
            };

            for id in ids {
                if !self.in_flight.insert(&id) {
                    continue;
                }
                match tx.try_send(id) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(id)) => {
                        self.in_flight.remove(&id);
                        tracing::debug!("Work queue full, deferring to next poll");
                        break;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return,
                }
            }
        }

        tracing::info!(node_id = %config.node_id, "Scheduler stopped");
    }
}

async fn run_worker(
    worker: Worker,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
    in_flight: InFlight,
    hint: Arc<Notify>,
    cancellation: CancellationToken,
) {
    loop {
        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => None,
                id = rx.recv() => id,
            }
        };
        let Some(id) = next else { break };

        let outcome = worker.run_cycle(&id).await;
        in_flight.remove(&id);

        match outcome {
            // More work may be due right away
            Ok(CycleOutcome::Persisted(WorkflowStatus::Runnable) | CycleOutcome::Conflict) => {
                hint.notify_one();
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(
                    instance_id = %id,
                    worker_id = %worker.worker_id(),
                    error = %e,
                    "Worker cycle failed"
                );
            }
        }
    }
    tracing::debug!(worker_id = %worker.worker_id(), "Worker stopped");
}
