use lynx_core::{ControlFlag, Task, TaskId, TaskKind, TaskStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: Uuid,
    pub task_id: Option<TaskId>,
    pub from: String,
    pub kind: MessageKind,
    pub sent_at_ms: u64,
}

impl Envelope {
    #[must_use]
    pub fn new(from: impl Into<String>, kind: MessageKind, sent_at_ms: u64) -> Self {
        let task_id = match &kind {
            MessageKind::TaskSettled(record) => Some(record.id),
            _ => None,
        };
        Self { message_id: Uuid::new_v4(), task_id, from: from.into(), kind, sent_at_ms }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum MessageKind {
    TaskSettled(TaskLogRecord),
    StatusSummary(StatusSummary),
    ControlChanged(ControlChanged),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLogRecord {
    pub id: TaskId,
    pub agent_id: String,
    pub task_type: TaskKind,
    pub status: TaskStatus,
    pub completion_time_ms: Option<u64>,
    pub timestamp: u64,
}

impl From<&Task> for TaskLogRecord {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            agent_id: task.agent_id.clone(),
            task_type: task.kind,
            status: task.status,
            completion_time_ms: task.completion_time_ms(),
            timestamp: task.updated_at_ms,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub generated_at_ms: u64,
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead: usize,
    pub success_rate: Option<f64>,
    pub avg_completion_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Stop,
    Resume,
    Degrade,
}

impl ControlAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Resume => "resume",
            Self::Degrade => "degrade",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlChanged {
    pub action: ControlAction,
    pub applied: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthChecks {
    pub database: bool,
    pub outbox_backlog: Option<u64>,
    pub dlq_backlog: Option<u64>,
    pub agents_alive: bool,
    #[serde(rename = "emergencyStop_clear")]
    pub emergency_stop_clear: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub ready: bool,
    pub timestamp: u64,
    pub checks: HealthChecks,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagEntry {
    pub key: String,
    pub value: Option<serde_json::Value>,
    pub owner: Option<String>,
    pub reason: Option<String>,
    pub updated_at_ms: Option<u64>,
}

impl FlagEntry {
    #[must_use]
    pub fn missing(key: impl Into<String>) -> Self {
        Self { key: key.into(), value: None, owner: None, reason: None, updated_at_ms: None }
    }
}

impl From<ControlFlag> for FlagEntry {
    fn from(flag: ControlFlag) -> Self {
        Self {
            key: flag.key,
            value: Some(flag.value),
            owner: Some(flag.owner),
            reason: flag.reason,
            updated_at_ms: Some(flag.updated_at_ms),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlStatus {
    pub flags: Vec<FlagEntry>,
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_snapshot_uses_wire_field_names() {
        let snapshot = HealthSnapshot {
            ready: false,
            timestamp: 7,
            checks: HealthChecks {
                database: true,
                outbox_backlog: Some(3),
                dlq_backlog: None,
                agents_alive: true,
                emergency_stop_clear: false,
            },
            errors: vec!["emergency stop is active".to_string()],
        };

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["checks"]["emergencyStop_clear"], false);
        assert_eq!(json["checks"]["outbox_backlog"], 3);
        assert!(json["checks"]["dlq_backlog"].is_null());
    }

    #[test]
    fn envelope_carries_task_id_for_settled_tasks() {
        let mut task = Task::new(TaskKind::Api, "network-agent");
        task.start(100).unwrap();
        task.complete(160, serde_json::Value::Null).unwrap();

        let envelope = Envelope::new(
            "dispatcher",
            MessageKind::TaskSettled(TaskLogRecord::from(&task)),
            170,
        );
        assert_eq!(envelope.task_id, Some(task.id));

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["kind"]["type"], "task_settled");
        assert_eq!(json["kind"]["payload"]["completion_time_ms"], 60);
    }
}
