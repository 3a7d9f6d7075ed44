use super::{BacklogSource, FlagStore, TaskSink};
use crate::error::StoreError;
use async_trait::async_trait;
use lynx_core::{ControlFlag, now_ms};
use lynx_protocol::TaskLogRecord;
use rusqlite::{Connection, OptionalExtension, params};
use std::{fs, path::Path, sync::Arc};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS feature_flags (
              key TEXT NOT NULL,
              scope TEXT NOT NULL,
              value TEXT NOT NULL,
              reason TEXT,
              owner TEXT NOT NULL,
              updated_at_ms INTEGER NOT NULL,
              PRIMARY KEY (key, scope)
            );

            CREATE TABLE IF NOT EXISTS outbox (
              id TEXT PRIMARY KEY,
              topic TEXT NOT NULL,
              payload TEXT NOT NULL,
              status TEXT NOT NULL DEFAULT 'pending',
              created_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS dead_letters (
              id TEXT PRIMARY KEY,
              topic TEXT NOT NULL,
              payload TEXT NOT NULL,
              error TEXT NOT NULL,
              failed_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS task_log (
              id TEXT NOT NULL,
              agent_id TEXT NOT NULL,
              task_type TEXT NOT NULL,
              status TEXT NOT NULL,
              completion_time_ms INTEGER,
              timestamp INTEGER NOT NULL
            );
            ",
        )?;
        Ok(Self { db: Arc::new(Mutex::new(conn)) })
    }

    pub async fn push_outbox(&self, topic: &str, payload: &serde_json::Value) -> Result<(), StoreError> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO outbox (id, topic, payload, status, created_at_ms) VALUES (?1, ?2, ?3, 'pending', ?4)",
            params![Uuid::new_v4().to_string(), topic, payload.to_string(), now_ms()],
        )?;
        Ok(())
    }

    pub async fn push_dead_letter(
        &self,
        topic: &str,
        payload: &serde_json::Value,
        error: &str,
    ) -> Result<(), StoreError> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO dead_letters (id, topic, payload, error, failed_at_ms) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![Uuid::new_v4().to_string(), topic, payload.to_string(), error, now_ms()],
        )?;
        Ok(())
    }

    pub async fn task_log(&self) -> Result<Vec<TaskLogRecord>, StoreError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "
            SELECT id, agent_id, task_type, status, completion_time_ms, timestamp
            FROM task_log
            ORDER BY rowid
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<i64>>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, agent_id, task_type, status, completion_time_ms, timestamp) = row?;
            records.push(TaskLogRecord {
                id: serde_json::from_value(serde_json::Value::String(id))?,
                agent_id,
                task_type: serde_json::from_value(serde_json::Value::String(task_type))?,
                status: serde_json::from_value(serde_json::Value::String(status))?,
                completion_time_ms: completion_time_ms.map(|v| v as u64),
                timestamp: timestamp as u64,
            });
        }
        Ok(records)
    }
}

#[async_trait]
impl FlagStore for SqliteStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let db = self.db.lock().await;
        db.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    async fn get(&self, key: &str, scope: &str) -> Result<Option<ControlFlag>, StoreError> {
        let db = self.db.lock().await;
        let row = db
            .query_row(
                "
                SELECT key, scope, value, reason, owner, updated_at_ms
                FROM feature_flags WHERE key = ?1 AND scope = ?2
                ",
                params![key, scope],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((key, scope, value, reason, owner, updated_at_ms)) = row else {
            return Ok(None);
        };
        Ok(Some(ControlFlag {
            key,
            scope,
            value: serde_json::from_str(&value)?,
            reason,
            owner,
            updated_at_ms: updated_at_ms as u64,
        }))
    }

    async fn upsert(&self, flag: ControlFlag) -> Result<(), StoreError> {
        let db = self.db.lock().await;
        db.execute(
            "
            INSERT INTO feature_flags (key, scope, value, reason, owner, updated_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(key, scope) DO UPDATE SET
              value=excluded.value,
              reason=excluded.reason,
              owner=excluded.owner,
              updated_at_ms=excluded.updated_at_ms
            ",
            params![
                flag.key,
                flag.scope,
                flag.value.to_string(),
                flag.reason,
                flag.owner,
                flag.updated_at_ms
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl BacklogSource for SqliteStore {
    async fn outbox_depth(&self) -> Result<u64, StoreError> {
        let db = self.db.lock().await;
        let count: i64 =
            db.query_row("SELECT COUNT(*) FROM outbox WHERE status = 'pending'", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    async fn dlq_depth(&self) -> Result<u64, StoreError> {
        let db = self.db.lock().await;
        let count: i64 = db.query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

#[async_trait]
impl TaskSink for SqliteStore {
    async fn record(&self, record: &TaskLogRecord) -> Result<(), StoreError> {
        let db = self.db.lock().await;
        db.execute(
            "
            INSERT INTO task_log (id, agent_id, task_type, status, completion_time_ms, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                record.id.to_string(),
                record.agent_id,
                record.task_type.as_str(),
                record.status.as_str(),
                record.completion_time_ms.map(|v| v as i64),
                record.timestamp
            ],
        )?;
        Ok(())
    }
}
