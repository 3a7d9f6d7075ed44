use crate::retry::RetryPolicy;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

const CONFIG_DIR: &str = "lynx";
const CONFIG_FILE: &str = "control-plane.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub db_path: PathBuf,
    pub port: u16,
    pub owner: String,
    pub executor: ExecutorConfig,
    pub generator: GeneratorConfig,
    pub readiness: ReadinessConfig,
    pub worker: WorkerConfig,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./var/lynx-control-plane.db"),
            port: 8900,
            owner: "lynx-control-plane".to_string(),
            executor: ExecutorConfig::default(),
            generator: GeneratorConfig::default(),
            readiness: ReadinessConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub batch_size: usize,
    pub concurrency_limit: usize,
    pub delay_between_batches_ms: u64,
    pub idle_poll_ms: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub task_timeout_ms: u64,
    /// Cancel in-flight tasks when the emergency stop flips mid-batch.
    pub preempt_on_stop: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            concurrency_limit: 3,
            delay_between_batches_ms: 1_000,
            idle_poll_ms: 500,
            max_retries: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 0,
            task_timeout_ms: 30_000,
            preempt_on_stop: false,
        }
    }
}

impl ExecutorConfig {
    #[must_use]
    pub fn delay_between_batches(&self) -> Duration {
        Duration::from_millis(self.delay_between_batches_ms)
    }

    #[must_use]
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    /// Zero `backoff_max_ms` or `task_timeout_ms` leaves that bound off.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base: Duration::from_millis(self.backoff_base_ms),
            max_delay: (self.backoff_max_ms > 0).then(|| Duration::from_millis(self.backoff_max_ms)),
            attempt_timeout: (self.task_timeout_ms > 0)
                .then(|| Duration::from_millis(self.task_timeout_ms)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub tick_ms: u64,
    pub recovery_ms: u64,
    pub broadcast_ms: u64,
    pub history_len: usize,
    pub lifetime_attempt_ceiling: u32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            tick_ms: 2_000,
            recovery_ms: 30_000,
            broadcast_ms: 60_000,
            history_len: 100,
            lifetime_attempt_ceiling: 9,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub check_timeout_ms: u64,
    pub heartbeat_stale_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self { check_timeout_ms: 2_000, heartbeat_stale_ms: 30_000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub failure_rate: f64,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { failure_rate: 0.1, min_duration_ms: 200, max_duration_ms: 1_500 }
    }
}

impl ControlPlaneConfig {
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => default_config_path().filter(|path| path.is_file()),
        };

        let Some(path) = path else {
            return Ok(Self::default());
        };

        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = Self::from_toml(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.executor.concurrency_limit >= 1, "executor.concurrency_limit must be >= 1");
        anyhow::ensure!(self.executor.batch_size >= 1, "executor.batch_size must be >= 1");
        anyhow::ensure!(self.executor.max_retries >= 1, "executor.max_retries must be >= 1");
        anyhow::ensure!(self.generator.history_len >= 1, "generator.history_len must be >= 1");
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.worker.failure_rate),
            "worker.failure_rate must be within 0.0..=1.0"
        );
        anyhow::ensure!(
            self.worker.min_duration_ms <= self.worker.max_duration_ms,
            "worker.min_duration_ms must not exceed worker.max_duration_ms"
        );
        Ok(())
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = ControlPlaneConfig::from_toml("").unwrap();
        assert_eq!(config.port, 8900);
        assert_eq!(config.executor.concurrency_limit, 3);
        assert_eq!(config.generator.history_len, 100);
        assert!(!config.executor.preempt_on_stop);
    }

    #[test]
    fn sections_override_individual_fields() {
        let config = ControlPlaneConfig::from_toml(
            r#"
            port = 9100

            [executor]
            concurrency_limit = 5
            preempt_on_stop = true

            [generator]
            tick_ms = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.port, 9100);
        assert_eq!(config.executor.concurrency_limit, 5);
        assert_eq!(config.executor.batch_size, 10);
        assert!(config.executor.preempt_on_stop);
        assert_eq!(config.generator.tick_ms, 500);
        assert_eq!(config.generator.recovery_ms, 30_000);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = ControlPlaneConfig::from_toml("[executor]\nconcurrency_limit = 0\n").unwrap_err();
        assert!(err.to_string().contains("concurrency_limit"));
    }

    #[test]
    fn executor_section_builds_the_retry_policy() {
        let config = ControlPlaneConfig::from_toml("[executor]\nmax_retries = 5\ntask_timeout_ms = 0\n").unwrap();
        let policy = config.executor.retry_policy();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.base, Duration::from_secs(1));
        assert_eq!(policy.attempt_timeout, None);
        assert_eq!(policy.max_delay, None);

        let capped = ControlPlaneConfig::from_toml("[executor]\nbackoff_max_ms = 5000\n").unwrap();
        assert_eq!(capped.executor.retry_policy().max_delay, Some(Duration::from_secs(5)));
    }
}
