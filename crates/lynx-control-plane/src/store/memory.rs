use super::{BacklogSource, FlagStore, TaskSink};
use crate::error::StoreError;
use async_trait::async_trait;
use lynx_core::ControlFlag;
use lynx_protocol::TaskLogRecord;
use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

#[derive(Debug, Default)]
pub struct MemoryStore {
    flags: Mutex<BTreeMap<(String, String), ControlFlag>>,
    failing_writes: Mutex<HashSet<String>>,
    unreachable: AtomicBool,
    outbox: AtomicU64,
    dlq: AtomicU64,
    records: Mutex<Vec<TaskLogRecord>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every upsert of `key` fail until cleared.
    pub fn fail_writes_for(&self, key: impl Into<String>) {
        lock(&self.failing_writes).insert(key.into());
    }

    pub fn clear_write_failures(&self) {
        lock(&self.failing_writes).clear();
    }

    /// Simulates a lost database connection for every operation.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_backlog(&self, outbox: u64, dlq: u64) {
        self.outbox.store(outbox, Ordering::SeqCst);
        self.dlq.store(dlq, Ordering::SeqCst);
    }

    #[must_use]
    pub fn values(&self) -> BTreeMap<String, serde_json::Value> {
        lock(&self.flags)
            .values()
            .map(|flag| (flag.key.clone(), flag.value.clone()))
            .collect()
    }

    #[must_use]
    pub fn records(&self) -> Vec<TaskLogRecord> {
        lock(&self.records).clone()
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[async_trait]
impl FlagStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check_reachable()
    }

    async fn get(&self, key: &str, scope: &str) -> Result<Option<ControlFlag>, StoreError> {
        self.check_reachable()?;
        Ok(lock(&self.flags).get(&(key.to_string(), scope.to_string())).cloned())
    }

    async fn upsert(&self, flag: ControlFlag) -> Result<(), StoreError> {
        self.check_reachable()?;
        if lock(&self.failing_writes).contains(&flag.key) {
            return Err(StoreError::Unavailable(format!("write rejected for {}", flag.key)));
        }
        lock(&self.flags).insert((flag.key.clone(), flag.scope.clone()), flag);
        Ok(())
    }
}

#[async_trait]
impl BacklogSource for MemoryStore {
    async fn outbox_depth(&self) -> Result<u64, StoreError> {
        self.check_reachable()?;
        Ok(self.outbox.load(Ordering::SeqCst))
    }

    async fn dlq_depth(&self) -> Result<u64, StoreError> {
        self.check_reachable()?;
        Ok(self.dlq.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl TaskSink for MemoryStore {
    async fn record(&self, record: &TaskLogRecord) -> Result<(), StoreError> {
        self.check_reachable()?;
        lock(&self.records).push(record.clone());
        Ok(())
    }
}
