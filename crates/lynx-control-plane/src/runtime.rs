use crate::{
    config::ControlPlaneConfig,
    dispatcher::Dispatcher,
    emergency::EmergencyControl,
    executor::BatchExecutor,
    generator::ContinuousGenerator,
    history::TaskHistory,
    http::{self, AppState},
    queue::TaskQueue,
    readiness::{AgentLiveness, Heartbeat, ReadinessGate},
    store::{BacklogSource, FlagStore, SqliteStore, TaskSink},
    worker::{SimulatedAgentWorker, TaskWorker},
};
use anyhow::{Context, Result};
use axum::Router;
use lynx_protocol::Envelope;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const EVENT_CAPACITY: usize = 256;

pub struct ControlPlane {
    config: ControlPlaneConfig,
    flags: Arc<dyn FlagStore>,
    backlog: Arc<dyn BacklogSource>,
    sink: Arc<dyn TaskSink>,
    liveness: Option<Arc<dyn AgentLiveness>>,
    queue: Arc<Mutex<TaskQueue>>,
    history: Arc<Mutex<TaskHistory>>,
    heartbeat: Heartbeat,
    events: broadcast::Sender<Envelope>,
}

impl ControlPlane {
    pub fn open(config: ControlPlaneConfig) -> Result<Self> {
        let store = SqliteStore::open(&config.db_path)
            .with_context(|| format!("failed to open database {}", config.db_path.display()))?;
        let store = Arc::new(store);
        Ok(Self::from_parts(config, store.clone(), store.clone(), store))
    }

    pub fn from_parts(
        config: ControlPlaneConfig,
        flags: Arc<dyn FlagStore>,
        backlog: Arc<dyn BacklogSource>,
        sink: Arc<dyn TaskSink>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let heartbeat =
            Heartbeat::with_stale_after(Duration::from_millis(config.readiness.heartbeat_stale_ms));
        Self {
            queue: Arc::new(Mutex::new(TaskQueue::new())),
            history: Arc::new(Mutex::new(TaskHistory::new(config.generator.history_len))),
            config,
            flags,
            backlog,
            sink,
            liveness: None,
            heartbeat,
            events,
        }
    }

    /// Replaces the dispatcher heartbeat as the agents-alive check.
    #[must_use]
    pub fn with_liveness(mut self, liveness: Arc<dyn AgentLiveness>) -> Self {
        self.liveness = Some(liveness);
        self
    }

    #[must_use]
    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.events.subscribe()
    }

    pub fn control(&self) -> EmergencyControl {
        EmergencyControl::new(self.flags.clone(), self.config.owner.clone())
            .with_events(self.events.clone())
    }

    pub fn readiness(&self) -> ReadinessGate {
        let liveness = self
            .liveness
            .clone()
            .unwrap_or_else(|| Arc::new(self.heartbeat.clone()) as Arc<dyn AgentLiveness>);
        ReadinessGate::new(
            self.flags.clone(),
            self.backlog.clone(),
            liveness,
            Duration::from_millis(self.config.readiness.check_timeout_ms),
        )
    }

    pub fn router(&self) -> Router {
        http::router(AppState {
            control: self.control(),
            readiness: self.readiness(),
            queue: self.queue.clone(),
            history: self.history.clone(),
        })
    }

    pub fn dispatcher(&self, worker: Arc<dyn TaskWorker>) -> Dispatcher {
        Dispatcher::new(
            self.flags.clone(),
            self.sink.clone(),
            worker,
            self.queue.clone(),
            self.history.clone(),
            BatchExecutor::new(self.config.executor.retry_policy())
                .with_history(self.history.clone()),
            self.config.executor.clone(),
            self.heartbeat.clone(),
            self.events.clone(),
        )
    }

    pub fn generator(&self) -> ContinuousGenerator {
        ContinuousGenerator::new(
            self.flags.clone(),
            self.queue.clone(),
            self.history.clone(),
            self.config.generator.clone(),
            self.events.clone(),
        )
    }

    /// Serves HTTP and runs the dispatcher and generator loops until `shutdown`
    /// fires. The in-flight batch is drained before returning.
    pub async fn serve(self, port: u16, shutdown: CancellationToken) -> Result<()> {
        let worker: Arc<dyn TaskWorker> =
            Arc::new(SimulatedAgentWorker::new(self.config.worker.clone()));
        let dispatcher = self.dispatcher(worker);
        let generator = Arc::new(self.generator());
        let app = self.router();

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        info!("control-plane listening on http://{}", addr);
        info!("sqlite database at {}", self.config.db_path.display());

        let loops = generator.spawn(shutdown.clone());
        let dispatch = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { dispatcher.run(shutdown).await }
        });

        let served = axum::serve(listener, app)
            .with_graceful_shutdown({
                let shutdown = shutdown.clone();
                async move { shutdown.cancelled().await }
            })
            .await;
        shutdown.cancel();

        if let Err(err) = dispatch.await {
            warn!(error = %err, "dispatcher task ended abnormally");
        }
        for handle in loops {
            if let Err(err) = handle.await {
                warn!(error = %err, "generator loop ended abnormally");
            }
        }

        served.context("http server failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{readiness::StaticLiveness, store::MemoryStore};
    use lynx_core::TaskStatus;
    use lynx_protocol::MessageKind;

    fn plane(store: &Arc<MemoryStore>, config: ControlPlaneConfig) -> ControlPlane {
        ControlPlane::from_parts(config, store.clone(), store.clone(), store.clone())
    }

    #[tokio::test]
    async fn readiness_defaults_to_the_dispatcher_heartbeat() {
        let store = Arc::new(MemoryStore::new());
        let plane = plane(&store, ControlPlaneConfig::default());

        assert!(!plane.readiness().readiness().await.ready);

        let plane = plane.with_liveness(Arc::new(StaticLiveness(true)));
        assert!(plane.readiness().readiness().await.ready);
    }

    #[tokio::test(start_paused = true)]
    async fn generated_work_flows_through_the_dispatcher() {
        let store = Arc::new(MemoryStore::new());
        let mut config = ControlPlaneConfig::default();
        config.worker.failure_rate = 0.0;
        let plane = plane(&store, config);
        let mut events = plane.subscribe();

        let generator = plane.generator().with_seed(7);
        for _ in 0..4 {
            generator.tick().await;
        }

        let worker = Arc::new(SimulatedAgentWorker::seeded(plane.config().worker.clone(), 7));
        plane.dispatcher(worker).run_cycle().await;

        let summary = generator.broadcast_status().await;
        assert_eq!(summary.total, 4);
        assert_eq!(summary.completed, 4);
        assert_eq!(store.records().len(), 4);
        assert!(store.records().iter().all(|record| record.status == TaskStatus::Completed));

        let mut settled = 0;
        while let Ok(envelope) = events.try_recv() {
            if matches!(envelope.kind, MessageKind::TaskSettled(_)) {
                settled += 1;
            }
        }
        assert_eq!(settled, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn status_counts_tasks_that_are_mid_dispatch() {
        let store = Arc::new(MemoryStore::new());
        let mut config = ControlPlaneConfig::default();
        config.worker.failure_rate = 0.0;
        let plane = plane(&store, config);

        let generator = plane.generator().with_seed(3);
        for _ in 0..4 {
            generator.tick().await;
        }

        let worker = Arc::new(SimulatedAgentWorker::seeded(plane.config().worker.clone(), 3));
        let dispatcher = plane.dispatcher(worker);
        let cycle = tokio::spawn(async move { dispatcher.run_cycle().await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let summary = generator.broadcast_status().await;
        assert_eq!(summary.running, 3);
        assert_eq!(summary.pending, 1);

        cycle.await.unwrap();
        assert_eq!(generator.broadcast_status().await.completed, 4);
    }

    #[tokio::test]
    async fn control_sweeps_are_broadcast() {
        let store = Arc::new(MemoryStore::new());
        let plane = plane(&store, ControlPlaneConfig::default());
        let mut events = plane.subscribe();

        plane.control().degrade(Some("load test")).await;

        let envelope = events.recv().await.unwrap();
        assert!(matches!(envelope.kind, MessageKind::ControlChanged(ref changed) if changed.applied == 2));
    }
}
