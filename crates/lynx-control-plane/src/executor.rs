use crate::{error::DispatchError, history::TaskHistory, retry::RetryPolicy, worker::TaskWorker};
use async_trait::async_trait;
use lynx_core::{Task, TaskStatus, now_ms};
use std::{any::Any, collections::HashMap, sync::Arc};
use tokio::{
    sync::{Mutex, Semaphore},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct Settled {
    pub task: Task,
    pub outcome: Outcome,
}

impl Settled {
    fn from_task(task: Task) -> Self {
        let outcome = match task.status {
            TaskStatus::Completed => Outcome::Completed,
            _ => Outcome::Failed(task.error.clone().unwrap_or_else(|| "unknown failure".to_string())),
        };
        Self { task, outcome }
    }
}

#[derive(Clone, Default)]
pub struct BatchExecutor {
    retry: RetryPolicy,
    history: Option<Arc<Mutex<TaskHistory>>>,
}

impl BatchExecutor {
    #[must_use]
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry, history: None }
    }

    /// Records each task as `running` in `history` once it holds a permit.
    #[must_use]
    pub fn with_history(mut self, history: Arc<Mutex<TaskHistory>>) -> Self {
        self.history = Some(history);
        self
    }

    /// Dispatches every task with at most `concurrency_limit` in flight and returns
    /// once all of them have settled, in batch order. A failing or panicking task
    /// never affects its siblings.
    pub async fn process_batch(
        &self,
        tasks: Vec<Task>,
        worker: Arc<dyn TaskWorker>,
        concurrency_limit: usize,
        cancel: &CancellationToken,
    ) -> Vec<Settled> {
        let limit = concurrency_limit.max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut join_set = JoinSet::new();
        let mut slots: Vec<Option<Settled>> = vec![None; tasks.len()];
        let mut index_by_id = HashMap::with_capacity(tasks.len());
        let originals = tasks.clone();

        debug!(batch = tasks.len(), limit, "dispatching batch");

        for (index, mut task) in tasks.into_iter().enumerate() {
            // Acquiring here, before spawning, keeps start order equal to batch order.
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                error!(task_id = %task.id, "executor semaphore closed");
                break;
            };

            if let Some(history) = &self.history {
                let mut running = task.clone();
                if running.start(now_ms()).is_ok() {
                    history.lock().await.record(running);
                }
            }

            let worker = Isolated(worker.clone());
            let retry = self.retry;
            let cancel = cancel.clone();
            let handle = join_set.spawn(async move {
                let _permit = permit;
                if let Err(err) = retry.execute(&mut task, &worker, &cancel).await {
                    warn!(task_id = %task.id, error = %err, "task skipped, not pending");
                }
                (index, task)
            });
            index_by_id.insert(handle.id(), index);
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, task)) => slots[index] = Some(Settled::from_task(task)),
                Err(join_err) => {
                    let Some(&index) = index_by_id.get(&join_err.id()) else {
                        error!(error = %join_err, "unknown task join failure");
                        continue;
                    };
                    error!(task_id = %originals[index].id, error = %join_err, "worker panicked");
                    slots[index] = Some(Settled::from_task(panicked(
                        originals[index].clone(),
                        join_err.to_string(),
                    )));
                }
            }
        }

        slots.into_iter().flatten().collect()
    }
}

/// Runs every attempt on its own task so a panicking worker fails that attempt
/// and leaves the retry state of the task intact.
struct Isolated(Arc<dyn TaskWorker>);

#[async_trait]
impl TaskWorker for Isolated {
    async fn dispatch(&self, task: &Task) -> Result<serde_json::Value, DispatchError> {
        let worker = self.0.clone();
        let task = task.clone();
        // Dropping the set aborts the attempt when the caller times out or is cancelled.
        let mut attempt = JoinSet::new();
        attempt.spawn(async move { worker.dispatch(&task).await });

        match attempt.join_next().await {
            Some(Ok(outcome)) => outcome,
            Some(Err(err)) if err.is_panic() => {
                Err(DispatchError::Panicked(panic_message(err.into_panic())))
            }
            Some(Err(err)) => Err(DispatchError::Transient(err.to_string())),
            None => Err(DispatchError::Cancelled),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map_or_else(|| "unknown panic".to_string(), |message| (*message).to_string()),
    }
}

fn panicked(mut task: Task, message: String) -> Task {
    let now = now_ms();
    if task.status == TaskStatus::Pending {
        if let Err(err) = task.start(now) {
            warn!(task_id = %task.id, error = %err, "could not mark panicked task running");
        }
        if task.attempt_count == 0 {
            task.record_attempt();
        }
    }
    if let Err(err) = task.fail(now, DispatchError::Panicked(message).to_string()) {
        warn!(task_id = %task.id, error = %err, "could not mark panicked task failed");
    }
    task
}
