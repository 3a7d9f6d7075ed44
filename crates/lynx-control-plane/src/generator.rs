//! Continuous task production, recovery and status broadcast.
//!
//! Three independent tickers run until cancelled:
//! - generation: synthesize one task per tick while autonomy is allowed;
//! - recovery: requeue `failed` tasks from the history window, burying those that
//!   reached the lifetime attempt ceiling as `dead`;
//! - broadcast: publish a [`StatusSummary`] for observability consumers.
//!
//! None of the loops propagate errors; failures are logged and the next tick runs.

use crate::{
    config::GeneratorConfig, emergency::DispatchGate, history::TaskHistory, queue::TaskQueue,
    store::FlagStore,
};
use lynx_core::{AGENTS, Task, TaskId, TaskKind, TaskPriority, TaskStatus, now_ms};
use lynx_protocol::{Envelope, MessageKind, StatusSummary};
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::{
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};
use tokio::{
    sync::{Mutex, broadcast},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SOURCE: &str = "generator";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: Vec<TaskId>,
    pub buried: Vec<TaskId>,
}

pub struct ContinuousGenerator {
    store: Arc<dyn FlagStore>,
    queue: Arc<Mutex<TaskQueue>>,
    history: Arc<Mutex<TaskHistory>>,
    config: GeneratorConfig,
    events: broadcast::Sender<Envelope>,
    rng: StdMutex<StdRng>,
}

impl ContinuousGenerator {
    pub fn new(
        store: Arc<dyn FlagStore>,
        queue: Arc<Mutex<TaskQueue>>,
        history: Arc<Mutex<TaskHistory>>,
        config: GeneratorConfig,
        events: broadcast::Sender<Envelope>,
    ) -> Self {
        Self {
            store,
            queue,
            history,
            config,
            events,
            rng: StdMutex::new(StdRng::from_entropy()),
        }
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdMutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub async fn tick(&self) -> Option<TaskId> {
        let gate = DispatchGate::read(self.store.as_ref()).await;
        if !gate.allows_dispatch() {
            debug!(emergency_stop = gate.emergency_stop, "generation gated");
            return None;
        }

        let task = self.synthesize();
        let id = task.id;
        debug!(task_id = %id, kind = %task.kind, agent_id = %task.agent_id, "generated task");

        self.history.lock().await.record(task.clone());
        self.queue.lock().await.enqueue(task);
        Some(id)
    }

    /// Sends every `failed` task in the window back to `pending`, or to `dead`
    /// once its lifetime attempts reach the ceiling.
    pub async fn recover(&self) -> RecoveryReport {
        let now = now_ms();
        let ceiling = self.config.lifetime_attempt_ceiling;
        let mut report = RecoveryReport::default();
        let mut requeued = Vec::new();

        {
            let mut history = self.history.lock().await;
            for task in history.iter_mut().filter(|task| task.status == TaskStatus::Failed) {
                if ceiling > 0 && task.lifetime_attempts >= ceiling {
                    match task.bury(now) {
                        Ok(()) => {
                            warn!(task_id = %task.id, attempts = task.lifetime_attempts, "task is dead, not requeued");
                            report.buried.push(task.id);
                        }
                        Err(err) => error!(task_id = %task.id, error = %err, "bury failed"),
                    }
                    continue;
                }

                match task.requeue(now) {
                    Ok(()) => {
                        report.requeued.push(task.id);
                        requeued.push(task.clone());
                    }
                    Err(err) => error!(task_id = %task.id, error = %err, "requeue failed"),
                }
            }
        }

        if !requeued.is_empty() || !report.buried.is_empty() {
            let mut queue = self.queue.lock().await;
            for id in &report.buried {
                queue.settle(*id, TaskStatus::Dead);
            }
            for task in requeued {
                queue.enqueue(task);
            }
        }

        if !report.requeued.is_empty() || !report.buried.is_empty() {
            info!(
                requeued = report.requeued.len(),
                buried = report.buried.len(),
                "recovery sweep finished"
            );
        }
        report
    }

    pub async fn broadcast_status(&self) -> StatusSummary {
        let summary = self.history.lock().await.summary(now_ms());
        info!(
            total = summary.total,
            pending = summary.pending,
            running = summary.running,
            completed = summary.completed,
            failed = summary.failed,
            dead = summary.dead,
            "status broadcast"
        );
        let _ = self.events.send(Envelope::new(
            SOURCE,
            MessageKind::StatusSummary(summary.clone()),
            summary.generated_at_ms,
        ));
        summary
    }

    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let ticks = [
            (Loop::Generate, self.config.tick_ms),
            (Loop::Recover, self.config.recovery_ms),
            (Loop::Broadcast, self.config.broadcast_ms),
        ];

        ticks
            .into_iter()
            .map(|(which, period_ms)| {
                let generator = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { generator.run_loop(which, period_ms, shutdown).await })
            })
            .collect()
    }

    async fn run_loop(&self, which: Loop, period_ms: u64, shutdown: CancellationToken) {
        let period = Duration::from_millis(period_ms.max(1));
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match which {
                Loop::Generate => {
                    self.tick().await;
                }
                Loop::Recover => {
                    self.recover().await;
                }
                Loop::Broadcast => {
                    self.broadcast_status().await;
                }
            }
        }
        debug!(loop_name = which.as_str(), "generator loop stopped");
    }

    fn synthesize(&self) -> Task {
        let mut rng = self.rng.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let kind = TaskKind::ALL[rng.gen_range(0..TaskKind::ALL.len())];
        let agent = AGENTS[rng.gen_range(0..AGENTS.len())];
        let priority = TaskPriority::ALL[rng.gen_range(0..TaskPriority::ALL.len())];
        Task::new(kind, agent).with_priority(priority)
    }
}

#[derive(Debug, Clone, Copy)]
enum Loop {
    Generate,
    Recover,
    Broadcast,
}

impl Loop {
    fn as_str(self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Recover => "recover",
            Self::Broadcast => "broadcast",
        }
    }
}
