use lynx_core::{Task, TaskId, TaskStatus};
use lynx_protocol::StatusSummary;
use std::collections::VecDeque;

#[derive(Debug)]
pub struct TaskHistory {
    capacity: usize,
    entries: VecDeque<Task>,
}

impl TaskHistory {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { capacity, entries: VecDeque::with_capacity(capacity) }
    }

    /// Replaces the entry with the same id in place, or appends and retires the oldest.
    pub fn record(&mut self, task: Task) {
        if let Some(existing) = self.entries.iter_mut().find(|entry| entry.id == task.id) {
            *existing = task;
            return;
        }

        self.entries.push_back(task);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    #[must_use]
    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.entries.iter().find(|entry| entry.id == *id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Task> {
        self.entries.iter_mut()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<Task> {
        self.entries.iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn summary(&self, generated_at_ms: u64) -> StatusSummary {
        let count = |status: TaskStatus| self.entries.iter().filter(|task| task.status == status).count();
        let completed = count(TaskStatus::Completed);
        let failed = count(TaskStatus::Failed);
        let dead = count(TaskStatus::Dead);

        let settled = completed + failed + dead;
        let success_rate = (settled > 0).then(|| completed as f64 / settled as f64);

        let durations: Vec<u64> = self
            .entries
            .iter()
            .filter(|task| task.status == TaskStatus::Completed)
            .filter_map(Task::completion_time_ms)
            .collect();
        let avg_completion_ms = (!durations.is_empty())
            .then(|| durations.iter().sum::<u64>() / durations.len() as u64);

        StatusSummary {
            generated_at_ms,
            total: self.entries.len(),
            pending: count(TaskStatus::Pending),
            running: count(TaskStatus::Running),
            completed,
            failed,
            dead,
            success_rate,
            avg_completion_ms,
        }
    }
}
