//! Per-dispatch retry loop with exponential backoff.
//!
//! The delay after failed attempt `n` (1-indexed) is `base × 2^n`, clamped to
//! `max_delay` only when one is set. No delay follows the final attempt, and only
//! retryable errors are retried. This loop lives inside a single dispatch cycle and is
//! unrelated to the recovery sweep, which re-admits failed tasks into a new cycle.

use crate::{error::DispatchError, worker::TaskWorker};
use lynx_core::{Task, TransitionError, now_ms};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub max_delay: Option<Duration>,
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_secs(1),
            max_delay: None,
            attempt_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let delay = Duration::try_from_secs_f64(self.base.as_secs_f64() * 2f64.powi(exp))
            .unwrap_or(Duration::MAX);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Drives a pending task to `completed` or `failed`.
    pub async fn execute(
        &self,
        task: &mut Task,
        worker: &dyn TaskWorker,
        cancel: &CancellationToken,
    ) -> Result<(), TransitionError> {
        task.start(now_ms())?;
        let max_attempts = self.max_retries.max(1);

        let mut attempt = 0;
        let last_error = loop {
            attempt += 1;
            task.record_attempt();

            let err = match self.attempt(task, worker, cancel).await {
                Ok(result) => {
                    debug!(task_id = %task.id, attempt, "task completed");
                    return task.complete(now_ms(), result);
                }
                Err(err) => err,
            };

            warn!(task_id = %task.id, attempt, max_attempts, error = %err, "dispatch attempt failed");
            if !err.is_retryable() || attempt >= max_attempts {
                break err;
            }

            let delay = self.delay_for(attempt);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break DispatchError::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        };

        task.fail(now_ms(), last_error.to_string())
    }

    async fn attempt(
        &self,
        task: &Task,
        worker: &dyn TaskWorker,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, DispatchError> {
        let dispatch = async {
            match self.attempt_timeout {
                Some(limit) => tokio::time::timeout(limit, worker.dispatch(task))
                    .await
                    .unwrap_or(Err(DispatchError::TimedOut(limit))),
                None => worker.dispatch(task).await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DispatchError::Cancelled),
            outcome = dispatch => outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorConfig;
    use async_trait::async_trait;
    use lynx_core::{TaskKind, TaskStatus};
    use std::sync::{
        Mutex,
        atomic::{AtomicU32, Ordering},
    };
    use tokio::time::Instant;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base: Duration::from_millis(1_000),
            max_delay: Some(Duration::from_secs(600)),
            attempt_timeout: None,
        }
    }

    struct AlwaysFails {
        attempts_at: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl TaskWorker for AlwaysFails {
        async fn dispatch(&self, _task: &Task) -> Result<serde_json::Value, DispatchError> {
            self.attempts_at.lock().unwrap().push(Instant::now());
            Err(DispatchError::Transient("carrier api unavailable".to_string()))
        }
    }

    struct FailsThenSucceeds {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl TaskWorker for FailsThenSucceeds {
        async fn dispatch(&self, _task: &Task) -> Result<serde_json::Value, DispatchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(DispatchError::Transient(format!("failure {call}")))
            } else {
                Ok(serde_json::json!({ "call": call }))
            }
        }
    }

    struct Permanent {
        calls: AtomicU32,
    }

    #[async_trait]
    impl TaskWorker for Permanent {
        async fn dispatch(&self, _task: &Task) -> Result<serde_json::Value, DispatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(DispatchError::Permanent("schema mismatch".to_string()))
        }
    }

    struct Hangs;

    #[async_trait]
    impl TaskWorker for Hangs {
        async fn dispatch(&self, _task: &Task) -> Result<serde_json::Value, DispatchError> {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Ok(serde_json::Value::Null)
        }
    }

    #[test]
    fn delay_doubles_per_attempt_and_clamps() {
        let policy = RetryPolicy { max_delay: Some(Duration::from_secs(5)), ..policy(10) };
        assert_eq!(policy.delay_for(1), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(4_000));
        assert_eq!(policy.delay_for(3), Duration::from_secs(5));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_exactly_max_retries_with_exponential_gaps() {
        let worker = AlwaysFails { attempts_at: Mutex::new(Vec::new()) };
        let mut task = Task::new(TaskKind::Backend, "code-agent");

        policy(4).execute(&mut task, &worker, &CancellationToken::new()).await.unwrap();

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempt_count, 4);
        assert!(task.error.as_deref().unwrap().contains("carrier api unavailable"));

        let at = worker.attempts_at.lock().unwrap();
        let gaps: Vec<Duration> = at.windows(2).map(|pair| pair[1] - pair[0]).collect();
        assert_eq!(
            gaps,
            vec![Duration::from_secs(2), Duration::from_secs(4), Duration::from_secs(8)]
        );
    }

    #[test]
    fn uncapped_delay_keeps_doubling() {
        let policy = RetryPolicy { max_delay: None, ..policy(10) };
        assert_eq!(policy.delay_for(6), Duration::from_secs(64));
        assert_eq!(policy.delay_for(u32::MAX), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn default_config_backs_off_without_a_ceiling() {
        let policy = RetryPolicy {
            max_retries: 8,
            attempt_timeout: None,
            ..ExecutorConfig::default().retry_policy()
        };
        let worker = AlwaysFails { attempts_at: Mutex::new(Vec::new()) };
        let mut task = Task::new(TaskKind::Research, "monitoring-agent");

        policy.execute(&mut task, &worker, &CancellationToken::new()).await.unwrap();

        assert_eq!(task.attempt_count, 8);
        let at = worker.attempts_at.lock().unwrap();
        let gaps: Vec<u64> = at.windows(2).map(|pair| (pair[1] - pair[0]).as_secs()).collect();
        assert_eq!(gaps, vec![2, 4, 8, 16, 32, 64, 128]);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_attempt() {
        let worker = FailsThenSucceeds { failures: 2, calls: AtomicU32::new(0) };
        let mut task = Task::new(TaskKind::Deployment, "performance-agent");

        policy(3).execute(&mut task, &worker, &CancellationToken::new()).await.unwrap();

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.attempt_count, 3);
        assert_eq!(task.result, Some(serde_json::json!({ "call": 3 })));
        assert!(task.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn success_short_circuits_remaining_attempts() {
        let worker = FailsThenSucceeds { failures: 0, calls: AtomicU32::new(0) };
        let mut task = Task::new(TaskKind::Api, "network-agent");

        policy(5).execute(&mut task, &worker, &CancellationToken::new()).await.unwrap();

        assert_eq!(worker.calls.load(Ordering::SeqCst), 1);
        assert_eq!(task.attempt_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let worker = Permanent { calls: AtomicU32::new(0) };
        let mut task = Task::new(TaskKind::Database, "database-agent");

        let started = Instant::now();
        policy(5).execute(&mut task, &worker, &CancellationToken::new()).await.unwrap();

        assert_eq!(worker.calls.load(Ordering::SeqCst), 1);
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_attempts_time_out_and_retry() {
        let policy = RetryPolicy { attempt_timeout: Some(Duration::from_secs(1)), ..policy(2) };
        let mut task = Task::new(TaskKind::Testing, "ui-agent");

        policy.execute(&mut task, &Hangs, &CancellationToken::new()).await.unwrap();

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempt_count, 2);
        assert!(task.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_fails_the_task() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut task = Task::new(TaskKind::Portal, "style-agent");

        policy(3).execute(&mut task, &Hangs, &cancel).await.unwrap();

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempt_count, 1);
        assert!(task.error.as_deref().unwrap().contains("cancelled"));
    }

    #[tokio::test]
    async fn only_pending_tasks_can_be_executed() {
        let worker = FailsThenSucceeds { failures: 0, calls: AtomicU32::new(0) };
        let mut task = Task::new(TaskKind::Api, "network-agent");
        task.start(1).unwrap();

        let err = policy(1).execute(&mut task, &worker, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.from, TaskStatus::Running);
        assert_eq!(worker.calls.load(Ordering::SeqCst), 0);
    }
}
