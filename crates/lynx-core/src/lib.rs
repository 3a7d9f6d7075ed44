use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

pub mod keys;

pub const GLOBAL_SCOPE: &str = "global";

pub const AGENTS: [&str; 8] = [
    "ui-agent",
    "style-agent",
    "performance-agent",
    "code-agent",
    "monitoring-agent",
    "network-agent",
    "security-agent",
    "database-agent",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Research,
    Frontend,
    Backend,
    Database,
    Testing,
    Deployment,
    Uiux,
    Portal,
    Api,
    Security,
}

impl TaskKind {
    pub const ALL: [TaskKind; 10] = [
        Self::Research,
        Self::Frontend,
        Self::Backend,
        Self::Database,
        Self::Testing,
        Self::Deployment,
        Self::Uiux,
        Self::Portal,
        Self::Api,
        Self::Security,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Frontend => "frontend",
            Self::Backend => "backend",
            Self::Database => "database",
            Self::Testing => "testing",
            Self::Deployment => "deployment",
            Self::Uiux => "uiux",
            Self::Portal => "portal",
            Self::Api => "api",
            Self::Security => "security",
        }
    }

    #[must_use]
    pub fn default_agent(self) -> &'static str {
        match self {
            Self::Frontend | Self::Uiux => "ui-agent",
            Self::Portal => "style-agent",
            Self::Research | Self::Testing => "monitoring-agent",
            Self::Backend => "code-agent",
            Self::Database => "database-agent",
            Self::Deployment => "performance-agent",
            Self::Api => "network-agent",
            Self::Security => "security-agent",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl TaskPriority {
    pub const ALL: [TaskPriority; 4] = [Self::Low, Self::Medium, Self::High, Self::Critical];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Terminal: the task exhausted its lifetime attempt ceiling.
    Dead,
}

impl TaskStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }

    #[must_use]
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Dead)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal task transition {from} -> {to}")]
pub struct TransitionError {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub agent_id: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub dependencies: Vec<TaskId>,
    /// Attempts made in the current dispatch cycle.
    pub attempt_count: u32,
    /// Attempts made across every dispatch cycle, including recovered ones.
    pub lifetime_attempts: u32,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub started_at_ms: Option<u64>,
    pub completed_at_ms: Option<u64>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl Task {
    #[must_use]
    pub fn new(kind: TaskKind, agent_id: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: TaskId::new(),
            kind,
            agent_id: agent_id.into(),
            status: TaskStatus::Pending,
            priority: TaskPriority::default(),
            dependencies: Vec::new(),
            attempt_count: 0,
            lifetime_attempts: 0,
            created_at_ms: now,
            updated_at_ms: now,
            started_at_ms: None,
            completed_at_ms: None,
            result: None,
            error: None,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_dependencies(mut self, dependencies: Vec<TaskId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn start(&mut self, now: u64) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Pending, TaskStatus::Running)?;
        self.started_at_ms = Some(now);
        self.updated_at_ms = now;
        Ok(())
    }

    pub fn record_attempt(&mut self) {
        self.attempt_count += 1;
        self.lifetime_attempts += 1;
    }

    pub fn complete(&mut self, now: u64, result: serde_json::Value) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Running, TaskStatus::Completed)?;
        self.result = Some(result);
        self.error = None;
        self.completed_at_ms = Some(now);
        self.updated_at_ms = now;
        Ok(())
    }

    pub fn fail(&mut self, now: u64, error: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Running, TaskStatus::Failed)?;
        self.error = Some(error.into());
        self.completed_at_ms = Some(now);
        self.updated_at_ms = now;
        Ok(())
    }

    /// Recovery path back into a fresh dispatch cycle.
    pub fn requeue(&mut self, now: u64) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Failed, TaskStatus::Pending)?;
        self.attempt_count = 0;
        self.started_at_ms = None;
        self.completed_at_ms = None;
        self.updated_at_ms = now;
        Ok(())
    }

    pub fn bury(&mut self, now: u64) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Failed, TaskStatus::Dead)?;
        self.updated_at_ms = now;
        Ok(())
    }

    /// Retires a task that can never run, such as one whose dependency died.
    pub fn abandon(&mut self, now: u64, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Pending, TaskStatus::Dead)?;
        self.error = Some(reason.into());
        self.completed_at_ms = Some(now);
        self.updated_at_ms = now;
        Ok(())
    }

    #[must_use]
    pub fn completion_time_ms(&self) -> Option<u64> {
        match (self.started_at_ms, self.completed_at_ms) {
            (Some(started), Some(completed)) => Some(completed.saturating_sub(started)),
            _ => None,
        }
    }

    fn transition(&mut self, from: TaskStatus, to: TaskStatus) -> Result<(), TransitionError> {
        if self.status != from {
            return Err(TransitionError { from: self.status, to });
        }
        self.status = to;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlFlag {
    pub key: String,
    pub scope: String,
    pub value: serde_json::Value,
    pub reason: Option<String>,
    pub owner: String,
    pub updated_at_ms: u64,
}

impl ControlFlag {
    #[must_use]
    pub fn global(
        key: impl Into<String>,
        value: serde_json::Value,
        reason: Option<String>,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            scope: GLOBAL_SCOPE.to_string(),
            value,
            reason,
            owner: owner.into(),
            updated_at_ms: now_ms(),
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        self.value.as_bool()
    }

    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        self.value.as_u64()
    }
}

#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}
