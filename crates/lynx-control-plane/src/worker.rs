use crate::{config::WorkerConfig, error::DispatchError};
use async_trait::async_trait;
use lynx_core::Task;
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde_json::json;
use std::{sync::Mutex, time::Duration};

#[async_trait]
pub trait TaskWorker: Send + Sync {
    async fn dispatch(&self, task: &Task) -> Result<serde_json::Value, DispatchError>;
}

/// Stand-in agent: sleeps for a random duration and fails at a configured rate.
pub struct SimulatedAgentWorker {
    config: WorkerConfig,
    rng: Mutex<StdRng>,
}

impl SimulatedAgentWorker {
    #[must_use]
    pub fn new(config: WorkerConfig) -> Self {
        Self { config, rng: Mutex::new(StdRng::from_entropy()) }
    }

    #[must_use]
    pub fn seeded(config: WorkerConfig, seed: u64) -> Self {
        Self { config, rng: Mutex::new(StdRng::seed_from_u64(seed)) }
    }

    fn roll(&self) -> (Duration, bool) {
        let mut rng = self.rng.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let millis = rng.gen_range(self.config.min_duration_ms..=self.config.max_duration_ms);
        let fails = rng.gen_bool(self.config.failure_rate);
        (Duration::from_millis(millis), fails)
    }
}

#[async_trait]
impl TaskWorker for SimulatedAgentWorker {
    async fn dispatch(&self, task: &Task) -> Result<serde_json::Value, DispatchError> {
        let (duration, fails) = self.roll();
        tokio::time::sleep(duration).await;

        if fails {
            return Err(DispatchError::Transient(format!(
                "{} could not finish {} task",
                task.agent_id, task.kind
            )));
        }

        Ok(json!({
            "agent_id": task.agent_id,
            "task_type": task.kind,
            "duration_ms": duration.as_millis() as u64,
        }))
    }
}
