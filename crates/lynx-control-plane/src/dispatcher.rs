use crate::{
    config::ExecutorConfig,
    emergency::DispatchGate,
    executor::{BatchExecutor, Outcome, Settled},
    history::TaskHistory,
    queue::TaskQueue,
    readiness::Heartbeat,
    store::{FlagStore, TaskSink},
    worker::TaskWorker,
};
use lynx_core::{Task, now_ms};
use lynx_protocol::{Envelope, MessageKind, TaskLogRecord};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, broadcast},
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SOURCE: &str = "dispatcher";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Blocked,
    Idle,
    Dispatched(usize),
}

pub struct Dispatcher {
    store: Arc<dyn FlagStore>,
    sink: Arc<dyn TaskSink>,
    worker: Arc<dyn TaskWorker>,
    queue: Arc<Mutex<TaskQueue>>,
    history: Arc<Mutex<TaskHistory>>,
    executor: BatchExecutor,
    config: ExecutorConfig,
    heartbeat: Heartbeat,
    events: broadcast::Sender<Envelope>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn FlagStore>,
        sink: Arc<dyn TaskSink>,
        worker: Arc<dyn TaskWorker>,
        queue: Arc<Mutex<TaskQueue>>,
        history: Arc<Mutex<TaskHistory>>,
        executor: BatchExecutor,
        config: ExecutorConfig,
        heartbeat: Heartbeat,
        events: broadcast::Sender<Envelope>,
    ) -> Self {
        Self { store, sink, worker, queue, history, executor, config, heartbeat, events }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            batch_size = self.config.batch_size,
            concurrency_limit = self.config.concurrency_limit,
            preempt_on_stop = self.config.preempt_on_stop,
            "dispatcher started"
        );

        while !shutdown.is_cancelled() {
            let pause = match self.run_cycle().await {
                CycleOutcome::Dispatched(_) => self.config.delay_between_batches(),
                CycleOutcome::Blocked | CycleOutcome::Idle => self.config.idle_poll(),
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!("dispatcher stopped");
    }

    pub async fn run_cycle(&self) -> CycleOutcome {
        self.heartbeat.beat();

        let gate = DispatchGate::read(self.store.as_ref()).await;
        if !gate.allows_dispatch() {
            debug!(
                emergency_stop = gate.emergency_stop,
                autonomous_enabled = gate.autonomous_enabled,
                "dispatch gated"
            );
            return CycleOutcome::Blocked;
        }

        let (batch, orphaned) = {
            let mut queue = self.queue.lock().await;
            (queue.dequeue_batch(self.config.batch_size), queue.take_orphaned())
        };
        if !orphaned.is_empty() {
            warn!(orphaned = orphaned.len(), "retired tasks whose dependencies can never complete");
            self.publish(&orphaned).await;
        }
        if batch.is_empty() {
            return CycleOutcome::Idle;
        }

        let limit = gate.concurrency(self.config.concurrency_limit);
        let size = batch.len();
        let batch_cancel = CancellationToken::new();
        if self.config.preempt_on_stop {
            tokio::spawn(watch_for_stop(
                self.store.clone(),
                batch_cancel.clone(),
                self.config.idle_poll(),
            ));
        }

        let dispatch = self.executor.process_batch(batch, self.worker.clone(), limit, &batch_cancel);
        tokio::pin!(dispatch);
        let mut pulse = tokio::time::interval(self.heartbeat.pulse_period());
        pulse.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // A batch can outlast the stale window, so keep beating while it runs.
        let settled = loop {
            tokio::select! {
                settled = &mut dispatch => break settled,
                _ = pulse.tick() => self.heartbeat.beat(),
            }
        };
        batch_cancel.cancel();

        self.write_back(settled).await;
        self.heartbeat.beat();
        CycleOutcome::Dispatched(size)
    }

    async fn write_back(&self, settled: Vec<Settled>) {
        let completed = settled.iter().filter(|entry| entry.outcome == Outcome::Completed).count();
        let failed = settled.len() - completed;

        {
            let mut queue = self.queue.lock().await;
            for entry in &settled {
                queue.settle(entry.task.id, entry.task.status);
            }
        }

        let tasks: Vec<Task> = settled.into_iter().map(|entry| entry.task).collect();
        self.publish(&tasks).await;
        info!(completed, failed, "batch settled");
    }

    async fn publish(&self, tasks: &[Task]) {
        {
            let mut history = self.history.lock().await;
            for task in tasks {
                history.record(task.clone());
            }
        }

        for task in tasks {
            let record = TaskLogRecord::from(task);
            if let Err(err) = self.sink.record(&record).await {
                warn!(task_id = %record.id, error = %err, "task sink write failed");
            }
            let _ = self.events.send(Envelope::new(SOURCE, MessageKind::TaskSettled(record), now_ms()));
        }
    }
}

/// Cancels `batch` as soon as the emergency stop is observed.
async fn watch_for_stop(store: Arc<dyn FlagStore>, batch: CancellationToken, poll: Duration) {
    loop {
        tokio::select! {
            _ = batch.cancelled() => return,
            _ = tokio::time::sleep(poll) => {}
        }

        if DispatchGate::read(store.as_ref()).await.emergency_stop {
            warn!("emergency stop raised mid-batch, cancelling in-flight tasks");
            batch.cancel();
            return;
        }
    }
}
