//! Flag writes are last-writer-wins upserts keyed by `(key, scope)`.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::StoreError;
use async_trait::async_trait;
use lynx_core::{ControlFlag, GLOBAL_SCOPE};
use lynx_protocol::TaskLogRecord;

#[async_trait]
pub trait FlagStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    async fn get(&self, key: &str, scope: &str) -> Result<Option<ControlFlag>, StoreError>;

    async fn upsert(&self, flag: ControlFlag) -> Result<(), StoreError>;
}

#[async_trait]
pub trait BacklogSource: Send + Sync {
    async fn outbox_depth(&self) -> Result<u64, StoreError>;

    async fn dlq_depth(&self) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait TaskSink: Send + Sync {
    async fn record(&self, record: &TaskLogRecord) -> Result<(), StoreError>;
}

pub async fn read_bool(store: &dyn FlagStore, key: &str) -> Result<Option<bool>, StoreError> {
    match store.get(key, GLOBAL_SCOPE).await? {
        None => Ok(None),
        Some(flag) => flag.as_bool().map(Some).ok_or_else(|| StoreError::InvalidValue {
            key: key.to_string(),
            reason: format!("expected bool, found {}", flag.value),
        }),
    }
}

pub async fn read_u64(store: &dyn FlagStore, key: &str) -> Result<Option<u64>, StoreError> {
    match store.get(key, GLOBAL_SCOPE).await? {
        None => Ok(None),
        Some(flag) => flag.as_u64().map(Some).ok_or_else(|| StoreError::InvalidValue {
            key: key.to_string(),
            reason: format!("expected unsigned integer, found {}", flag.value),
        }),
    }
}
