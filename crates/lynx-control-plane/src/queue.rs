use lynx_core::{Task, TaskId, TaskStatus, now_ms};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::warn;

pub const DEFAULT_RETENTION: usize = 1024;

/// Insertion-ordered backlog. Outcomes are kept for the newest `retention`
/// settled tasks, plus any older one a queued task still waits on.
#[derive(Debug)]
pub struct TaskQueue {
    backlog: VecDeque<Task>,
    in_flight: HashSet<TaskId>,
    settled: HashMap<TaskId, TaskStatus>,
    settled_order: VecDeque<TaskId>,
    retention: usize,
    orphaned: Vec<Task>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

enum Readiness {
    Ready,
    Waiting,
    Orphaned(String),
}

impl TaskQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_retention(retention: usize) -> Self {
        Self {
            backlog: VecDeque::new(),
            in_flight: HashSet::new(),
            settled: HashMap::new(),
            settled_order: VecDeque::new(),
            retention: retention.max(1),
            orphaned: Vec::new(),
        }
    }

    pub fn enqueue(&mut self, task: Task) {
        // A recovered task is live again.
        if self.settled.remove(&task.id).is_some() {
            self.settled_order.retain(|id| *id != task.id);
        }
        self.backlog.push_back(task);
    }

    /// Removes up to `n` tasks, earliest first, leaving tasks with unfinished
    /// dependencies in place for a later batch. Tasks that depend on a dead or
    /// unknown task are retired as `dead` and parked for [`Self::take_orphaned`].
    pub fn dequeue_batch(&mut self, n: usize) -> Vec<Task> {
        let mut batch = Vec::with_capacity(n.min(self.backlog.len()));
        let mut deferred = VecDeque::with_capacity(self.backlog.len());

        while let Some(mut task) = self.backlog.pop_front() {
            match self.readiness(&task, &deferred) {
                Readiness::Ready if batch.len() < n => {
                    self.in_flight.insert(task.id);
                    batch.push(task);
                }
                Readiness::Ready | Readiness::Waiting => deferred.push_back(task),
                Readiness::Orphaned(reason) => {
                    warn!(task_id = %task.id, %reason, "task can never run");
                    if let Err(err) = task.abandon(now_ms(), reason) {
                        warn!(task_id = %task.id, error = %err, "could not retire orphaned task");
                        continue;
                    }
                    self.remember(task.id, TaskStatus::Dead);
                    self.orphaned.push(task);
                }
            }
        }

        self.backlog = deferred;
        self.evict();
        batch
    }

    /// Records how a dequeued task ended. Only `completed` unblocks dependents.
    pub fn settle(&mut self, id: TaskId, status: TaskStatus) {
        self.in_flight.remove(&id);
        if status.is_settled() {
            self.remember(id, status);
            self.evict();
        }
    }

    pub fn take_orphaned(&mut self) -> Vec<Task> {
        std::mem::take(&mut self.orphaned)
    }

    #[must_use]
    pub fn knows(&self, id: &TaskId) -> bool {
        self.in_flight.contains(id)
            || self.settled.contains_key(id)
            || self.backlog.iter().any(|task| task.id == *id)
    }

    #[must_use]
    pub fn is_completed(&self, id: &TaskId) -> bool {
        self.settled.get(id) == Some(&TaskStatus::Completed)
    }

    #[must_use]
    pub fn settled_len(&self) -> usize {
        self.settled.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.backlog.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backlog.is_empty()
    }

    fn readiness(&self, task: &Task, deferred: &VecDeque<Task>) -> Readiness {
        let mut ready = true;
        for dep in &task.dependencies {
            match self.settled.get(dep) {
                Some(TaskStatus::Completed) => {}
                Some(TaskStatus::Dead) => return Readiness::Orphaned(format!("dependency {dep} is dead")),
                Some(_) => ready = false,
                None if self.in_flight.contains(dep)
                    || self.backlog.iter().chain(deferred).any(|queued| queued.id == *dep) =>
                {
                    ready = false;
                }
                None => return Readiness::Orphaned(format!("unknown dependency {dep}")),
            }
        }
        if ready { Readiness::Ready } else { Readiness::Waiting }
    }

    fn remember(&mut self, id: TaskId, status: TaskStatus) {
        if self.settled.insert(id, status).is_none() {
            self.settled_order.push_back(id);
        }
    }

    fn evict(&mut self) {
        if self.settled.len() <= self.retention {
            return;
        }
        let referenced: HashSet<TaskId> =
            self.backlog.iter().flat_map(|task| task.dependencies.iter().copied()).collect();
        let mut kept = Vec::new();
        while self.settled.len() > self.retention {
            let Some(id) = self.settled_order.pop_front() else { break };
            if referenced.contains(&id) && self.settled.contains_key(&id) {
                kept.push(id);
            } else {
                self.settled.remove(&id);
            }
        }
        for id in kept.into_iter().rev() {
            self.settled_order.push_front(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lynx_core::TaskKind;

    fn task() -> Task {
        Task::new(TaskKind::Frontend, "ui-agent")
    }

    #[test]
    fn dequeues_in_insertion_order() {
        let mut queue = TaskQueue::new();
        let tasks: Vec<Task> = (0..5).map(|_| task()).collect();
        for task in &tasks {
            queue.enqueue(task.clone());
        }

        let first = queue.dequeue_batch(3);
        let ids: Vec<TaskId> = first.iter().map(|task| task.id).collect();
        assert_eq!(ids, tasks[..3].iter().map(|task| task.id).collect::<Vec<_>>());
        assert_eq!(queue.len(), 2);

        let rest = queue.dequeue_batch(10);
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].id, tasks[3].id);
        assert!(queue.is_empty());
    }

    #[test]
    fn blocked_tasks_are_deferred_without_losing_position() {
        let mut queue = TaskQueue::new();
        let parent = task();
        let child = task().with_dependencies(vec![parent.id]);
        let sibling = task();

        queue.enqueue(child.clone());
        queue.enqueue(parent.clone());
        queue.enqueue(sibling.clone());

        let batch = queue.dequeue_batch(5);
        assert_eq!(batch.iter().map(|task| task.id).collect::<Vec<_>>(), vec![parent.id, sibling.id]);
        assert_eq!(queue.len(), 1);

        assert!(queue.dequeue_batch(5).is_empty());

        queue.settle(parent.id, TaskStatus::Completed);
        let batch = queue.dequeue_batch(5);
        assert_eq!(batch[0].id, child.id);
    }

    #[test]
    fn a_task_is_never_handed_out_twice() {
        let mut queue = TaskQueue::new();
        for _ in 0..4 {
            queue.enqueue(task());
        }

        let a = queue.dequeue_batch(2);
        let b = queue.dequeue_batch(2);
        let seen: HashSet<TaskId> = a.iter().chain(b.iter()).map(|task| task.id).collect();
        assert_eq!(seen.len(), 4);
        assert!(queue.dequeue_batch(2).is_empty());
    }

    #[test]
    fn failed_dependency_waits_for_recovery() {
        let mut queue = TaskQueue::new();
        let parent = task();
        let child = task().with_dependencies(vec![parent.id]);
        queue.enqueue(parent.clone());
        queue.enqueue(child.clone());

        queue.dequeue_batch(1);
        queue.settle(parent.id, TaskStatus::Failed);
        assert!(queue.dequeue_batch(5).is_empty());
        assert!(queue.take_orphaned().is_empty());

        queue.enqueue(parent.clone());
        assert_eq!(queue.dequeue_batch(5)[0].id, parent.id);
        queue.settle(parent.id, TaskStatus::Completed);
        assert_eq!(queue.dequeue_batch(5)[0].id, child.id);
    }

    #[test]
    fn dependents_of_a_dead_task_are_retired() {
        let mut queue = TaskQueue::new();
        let parent = task();
        let child = task().with_dependencies(vec![parent.id]);
        let grandchild = task().with_dependencies(vec![child.id]);
        queue.enqueue(parent.clone());
        queue.enqueue(child.clone());
        queue.enqueue(grandchild.clone());

        queue.dequeue_batch(1);
        queue.settle(parent.id, TaskStatus::Dead);

        assert!(queue.dequeue_batch(5).is_empty());
        assert!(queue.is_empty());
        let orphaned = queue.take_orphaned();
        assert_eq!(orphaned.iter().map(|task| task.id).collect::<Vec<_>>(), vec![child.id, grandchild.id]);
        assert!(orphaned.iter().all(|task| task.status == TaskStatus::Dead));
        assert!(orphaned[0].error.as_deref().unwrap().contains("is dead"));
        assert!(queue.take_orphaned().is_empty());
    }

    #[test]
    fn unknown_dependency_is_retired_instead_of_deferred_forever() {
        let mut queue = TaskQueue::new();
        let ghost = TaskId::new();
        queue.enqueue(task().with_dependencies(vec![ghost]));

        assert!(queue.dequeue_batch(5).is_empty());
        assert!(queue.is_empty());
        let orphaned = queue.take_orphaned();
        assert_eq!(orphaned.len(), 1);
        assert_eq!(orphaned[0].error.as_deref(), Some(format!("unknown dependency {ghost}").as_str()));
    }

    #[test]
    fn settled_outcomes_are_bounded_by_retention() {
        let mut queue = TaskQueue::with_retention(8);
        for _ in 0..100 {
            queue.enqueue(task());
            for dequeued in queue.dequeue_batch(1) {
                queue.settle(dequeued.id, TaskStatus::Completed);
            }
        }
        assert_eq!(queue.settled_len(), 8);
    }

    #[test]
    fn retention_keeps_outcomes_a_queued_task_still_needs() {
        let mut queue = TaskQueue::with_retention(2);
        let parent = task();
        let child = task().with_dependencies(vec![parent.id]);
        queue.enqueue(child.clone());
        queue.settle(parent.id, TaskStatus::Completed);
        for _ in 0..10 {
            queue.settle(TaskId::new(), TaskStatus::Completed);
        }

        assert!(queue.is_completed(&parent.id));
        assert_eq!(queue.settled_len(), 2);
        assert_eq!(queue.dequeue_batch(5)[0].id, child.id);
    }
}
