//! Global stop, resume and degrade switches.
//!
//! Every operation is a best-effort sweep over a fixed key list: a failed write
//! is logged and recorded in the [`SweepReport`], and the sweep moves on to the
//! next key. Operations are idempotent because each write is an upsert of a
//! constant value.

use crate::{
    error::FlagWriteError,
    store::{self, FlagStore},
};
use lynx_core::{ControlFlag, GLOBAL_SCOPE, keys, now_ms};
use lynx_protocol::{ControlAction, ControlChanged, ControlStatus, Envelope, FlagEntry, MessageKind};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub action: ControlAction,
    pub applied: Vec<String>,
    pub failed: Vec<FlagWriteError>,
}

impl SweepReport {
    fn new(action: ControlAction) -> Self {
        Self { action, applied: Vec::new(), failed: Vec::new() }
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Clone)]
pub struct EmergencyControl {
    store: Arc<dyn FlagStore>,
    owner: String,
    events: Option<broadcast::Sender<Envelope>>,
}

impl EmergencyControl {
    pub fn new(store: Arc<dyn FlagStore>, owner: impl Into<String>) -> Self {
        Self { store, owner: owner.into(), events: None }
    }

    #[must_use]
    pub fn with_events(mut self, events: broadcast::Sender<Envelope>) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn stop(&self, reason: Option<&str>) -> SweepReport {
        let mut writes = vec![
            (keys::EMERGENCY_STOP.to_string(), json!(true)),
            (keys::AUTONOMOUS_ENABLED.to_string(), json!(false)),
        ];
        writes.extend(keys::autonomy_feature_keys().into_iter().map(|key| (key, json!(false))));
        self.sweep(ControlAction::Stop, writes, reason).await
    }

    /// Clears the stop. Per-portal switches stay off until re-enabled individually.
    pub async fn resume(&self, reason: Option<&str>) -> SweepReport {
        let writes = vec![
            (keys::EMERGENCY_STOP.to_string(), json!(false)),
            (keys::AUTONOMOUS_ENABLED.to_string(), json!(true)),
        ];
        self.sweep(ControlAction::Resume, writes, reason).await
    }

    pub async fn degrade(&self, reason: Option<&str>) -> SweepReport {
        let writes = vec![
            (keys::MAX_CONCURRENCY.to_string(), json!(keys::DEGRADED_MAX_CONCURRENCY)),
            (keys::REPLAY_BUDGET_PER_5M.to_string(), json!(keys::DEGRADED_REPLAY_BUDGET_PER_5M)),
        ];
        self.sweep(ControlAction::Degrade, writes, reason).await
    }

    pub async fn status(&self) -> ControlStatus {
        let mut status = ControlStatus::default();
        for key in keys::status_keys() {
            match self.store.get(key, GLOBAL_SCOPE).await {
                Ok(Some(flag)) => status.flags.push(FlagEntry::from(flag)),
                Ok(None) => status.flags.push(FlagEntry::missing(key)),
                Err(err) => {
                    warn!(%key, error = %err, "failed to read control flag");
                    status.flags.push(FlagEntry::missing(key));
                    status.errors.push(format!("{key}: {err}"));
                }
            }
        }
        status
    }

    async fn sweep(
        &self,
        action: ControlAction,
        writes: Vec<(String, Value)>,
        reason: Option<&str>,
    ) -> SweepReport {
        let mut report = SweepReport::new(action);
        let reason = reason.map(str::to_string);

        for (key, value) in writes {
            let flag = ControlFlag::global(key.clone(), value, reason.clone(), self.owner.clone());
            match self.store.upsert(flag).await {
                Ok(()) => report.applied.push(key),
                Err(err) => {
                    error!(%key, action = action.as_str(), error = %err, "control flag write failed, continuing sweep");
                    report.failed.push(FlagWriteError { key, message: err.to_string() });
                }
            }
        }

        info!(
            action = action.as_str(),
            applied = report.applied.len(),
            failed = report.failed.len(),
            "control sweep finished"
        );

        if let Some(events) = &self.events {
            let changed = ControlChanged {
                action,
                applied: report.applied.len(),
                failed: report.failed.len(),
            };
            let _ = events.send(Envelope::new(
                self.owner.clone(),
                MessageKind::ControlChanged(changed),
                now_ms(),
            ));
        }

        report
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchGate {
    pub emergency_stop: bool,
    pub autonomous_enabled: bool,
    pub max_concurrency: Option<usize>,
}

impl DispatchGate {
    /// Reads the gate flags. Unreadable stop flags fail safe to "stopped".
    pub async fn read(store: &dyn FlagStore) -> Self {
        let emergency_stop = match store::read_bool(store, keys::EMERGENCY_STOP).await {
            Ok(value) => value.unwrap_or(false),
            Err(err) => {
                warn!(error = %err, "emergency stop flag unreadable, treating as stopped");
                true
            }
        };
        let autonomous_enabled = match store::read_bool(store, keys::AUTONOMOUS_ENABLED).await {
            Ok(value) => value.unwrap_or(true),
            Err(err) => {
                warn!(error = %err, "autonomy flag unreadable, treating as disabled");
                false
            }
        };
        let max_concurrency = match store::read_u64(store, keys::MAX_CONCURRENCY).await {
            Ok(value) => value.map(|cap| cap as usize),
            Err(err) => {
                warn!(error = %err, "concurrency cap unreadable, using configured limit");
                None
            }
        };

        Self { emergency_stop, autonomous_enabled, max_concurrency }
    }

    #[must_use]
    pub fn allows_dispatch(&self) -> bool {
        !self.emergency_stop && self.autonomous_enabled
    }

    /// `agents.maxConcurrency` only ever lowers the configured limit.
    #[must_use]
    pub fn concurrency(&self, configured: usize) -> usize {
        self.max_concurrency.map_or(configured, |cap| cap.min(configured)).max(1)
    }
}
