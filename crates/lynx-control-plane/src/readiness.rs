//! Readiness is `database && !emergencyStop && agents_alive`. Backlog depths
//! never flip the verdict.

use crate::{
    error::CheckError,
    store::{self, BacklogSource, FlagStore},
};
use async_trait::async_trait;
use lynx_core::{keys, now_ms};
use lynx_protocol::{HealthChecks, HealthSnapshot};
use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::Instant;
use tracing::warn;

const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30);

#[async_trait]
pub trait AgentLiveness: Send + Sync {
    async fn agents_alive(&self) -> Result<bool, String>;
}

pub struct StaticLiveness(pub bool);

#[async_trait]
impl AgentLiveness for StaticLiveness {
    async fn agents_alive(&self) -> Result<bool, String> {
        Ok(self.0)
    }
}

/// Beaten by the dispatcher every cycle; alive while the last beat is fresh.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    last: Arc<Mutex<Option<Instant>>>,
    stale_after: Duration,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

impl Heartbeat {
    #[must_use]
    pub fn new() -> Self {
        Self::with_stale_after(DEFAULT_STALE_AFTER)
    }

    #[must_use]
    pub fn with_stale_after(stale_after: Duration) -> Self {
        Self { last: Arc::new(Mutex::new(None)), stale_after }
    }

    pub fn beat(&self) {
        *self.last.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Instant::now());
    }

    /// How often a long-running holder must beat to stay fresh.
    #[must_use]
    pub fn pulse_period(&self) -> Duration {
        (self.stale_after / 3).max(Duration::from_millis(1))
    }

    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.last
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_some_and(|at| at.elapsed() <= self.stale_after)
    }
}

#[async_trait]
impl AgentLiveness for Heartbeat {
    async fn agents_alive(&self) -> Result<bool, String> {
        Ok(self.is_fresh())
    }
}

#[derive(Clone)]
pub struct ReadinessGate {
    store: Arc<dyn FlagStore>,
    backlog: Arc<dyn BacklogSource>,
    liveness: Arc<dyn AgentLiveness>,
    check_timeout: Duration,
}

impl ReadinessGate {
    pub fn new(
        store: Arc<dyn FlagStore>,
        backlog: Arc<dyn BacklogSource>,
        liveness: Arc<dyn AgentLiveness>,
        check_timeout: Duration,
    ) -> Self {
        Self { store, backlog, liveness, check_timeout }
    }

    #[must_use]
    pub fn liveness(&self) -> bool {
        true
    }

    pub async fn readiness(&self) -> HealthSnapshot {
        let timeout = self.check_timeout;
        let store = self.store.as_ref();

        let (database, outbox, dlq, alive, stop) = tokio::join!(
            guarded("database", timeout, async { store.ping().await.map_err(|err| err.to_string()) }),
            guarded("outbox_backlog", timeout, async {
                self.backlog.outbox_depth().await.map_err(|err| err.to_string())
            }),
            guarded("dlq_backlog", timeout, async {
                self.backlog.dlq_depth().await.map_err(|err| err.to_string())
            }),
            guarded("agents_alive", timeout, self.liveness.agents_alive()),
            guarded("emergencyStop", timeout, async {
                store::read_bool(store, keys::EMERGENCY_STOP)
                    .await
                    .map(|value| value.unwrap_or(false))
                    .map_err(|err| err.to_string())
            }),
        );

        let stop_active = matches!(stop, Ok(true));
        let mut errors = Vec::new();
        let mut record = |err: &CheckError| {
            warn!(error = %err, "readiness check failed");
            errors.push(err.to_string());
        };

        let database = match database {
            Ok(()) => true,
            Err(err) => {
                record(&err);
                false
            }
        };
        let outbox_backlog = outbox.map_err(|err| record(&err)).ok();
        let dlq_backlog = dlq.map_err(|err| record(&err)).ok();
        let agents_alive = match alive {
            Ok(alive) => alive,
            Err(err) => {
                record(&err);
                false
            }
        };
        let emergency_stop_clear = match stop {
            Ok(active) => !active,
            Err(err) => {
                record(&err);
                false
            }
        };

        if !agents_alive && errors.iter().all(|err| !err.starts_with("agents_alive")) {
            errors.push("agents_alive check failed: no live agents".to_string());
        }
        if stop_active {
            errors.push("emergencyStop is active".to_string());
        }

        let ready = database && emergency_stop_clear && agents_alive;
        HealthSnapshot {
            ready,
            timestamp: now_ms(),
            checks: HealthChecks {
                database,
                outbox_backlog,
                dlq_backlog,
                agents_alive,
                emergency_stop_clear,
            },
            errors,
        }
    }
}

async fn guarded<T>(
    check: &'static str,
    timeout: Duration,
    fut: impl Future<Output = Result<T, String>>,
) -> Result<T, CheckError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(message)) => Err(CheckError::Failed { check, message }),
        Err(_) => Err(CheckError::TimedOut { check, timeout_ms: timeout.as_millis() as u64 }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{emergency::EmergencyControl, store::MemoryStore};

    struct Hung;

    #[async_trait]
    impl AgentLiveness for Hung {
        async fn agents_alive(&self) -> Result<bool, String> {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Ok(true)
        }
    }

    fn gate(store: &Arc<MemoryStore>, liveness: Arc<dyn AgentLiveness>) -> ReadinessGate {
        ReadinessGate::new(store.clone(), store.clone(), liveness, Duration::from_secs(2))
    }

    #[tokio::test]
    async fn healthy_system_is_ready() {
        let store = Arc::new(MemoryStore::new());
        store.set_backlog(12, 3);

        let snapshot = gate(&store, Arc::new(StaticLiveness(true))).readiness().await;
        assert!(snapshot.ready);
        assert!(snapshot.errors.is_empty());
        assert_eq!(snapshot.checks.outbox_backlog, Some(12));
        assert_eq!(snapshot.checks.dlq_backlog, Some(3));
    }

    #[tokio::test]
    async fn emergency_stop_flips_readiness_immediately() {
        let store = Arc::new(MemoryStore::new());
        let gate = gate(&store, Arc::new(StaticLiveness(true)));
        assert!(gate.readiness().await.ready);

        EmergencyControl::new(store.clone(), "ops").stop(None).await;
        let snapshot = gate.readiness().await;
        assert!(!snapshot.ready);
        assert!(snapshot.checks.database);
        assert!(!snapshot.checks.emergency_stop_clear);
        assert!(snapshot.errors.iter().any(|err| err.contains("emergencyStop")));
    }

    #[tokio::test]
    async fn unreachable_database_is_reported_not_raised() {
        let store = Arc::new(MemoryStore::new());
        store.set_unreachable(true);

        let snapshot = gate(&store, Arc::new(StaticLiveness(true))).readiness().await;
        assert!(!snapshot.ready);
        assert!(!snapshot.checks.database);
        assert_eq!(snapshot.checks.outbox_backlog, None);
        assert!(snapshot.errors.iter().any(|err| err.starts_with("database check failed")));
    }

    #[tokio::test]
    async fn large_backlogs_do_not_block_readiness() {
        let store = Arc::new(MemoryStore::new());
        store.set_backlog(1_000_000, 50_000);

        assert!(gate(&store, Arc::new(StaticLiveness(true))).readiness().await.ready);
    }

    #[tokio::test]
    async fn dead_agents_block_readiness() {
        let store = Arc::new(MemoryStore::new());
        let snapshot = gate(&store, Arc::new(StaticLiveness(false))).readiness().await;
        assert!(!snapshot.ready);
        assert!(!snapshot.checks.agents_alive);
        assert_eq!(snapshot.errors.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_check_times_out_independently() {
        let store = Arc::new(MemoryStore::new());
        let started = Instant::now();

        let snapshot = gate(&store, Arc::new(Hung)).readiness().await;
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(snapshot.checks.database);
        assert!(!snapshot.checks.agents_alive);
        assert!(snapshot.errors.iter().any(|err| err.contains("timed out")));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_goes_stale() {
        let heartbeat = Heartbeat::with_stale_after(Duration::from_secs(5));
        assert!(!heartbeat.is_fresh());

        heartbeat.beat();
        assert!(heartbeat.is_fresh());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!heartbeat.is_fresh());
    }

    #[test]
    fn liveness_is_unconditional() {
        let store = Arc::new(MemoryStore::new());
        store.set_unreachable(true);
        assert!(gate(&store, Arc::new(StaticLiveness(false))).liveness());
    }
}
