//! Per-instance private state and the task handle kept in it.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::task::{TaskHandle, TaskKind};

/// Key under which the current task handle lives.
pub const CURRENT_TASK_KEY: &str = "current_task";

/// Opaque key/value state private to one managed instance.
///
/// Values are read and written whole.
#[async_trait]
pub trait PrivateState: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// `None` removes the key.
    async fn put(&self, key: &str, value: Option<Vec<u8>>) -> Result<()>;
}

/// In-memory private state, for embedding in a framework that persists the
/// blob itself.
#[derive(Default)]
pub struct MemoryState {
    values: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw bytes under `key`, bypassing decoding.
    pub async fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.values.lock().await.get(key).cloned()
    }
}

#[async_trait]
impl PrivateState for MemoryState {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Option<Vec<u8>>) -> Result<()> {
        let mut values = self.values.lock().await;
        match value {
            Some(v) => values.insert(key.to_string(), v),
            None => values.remove(key),
        };
        Ok(())
    }
}

/// SQLite-backed private state for all instances managed by one process.
///
/// Survives restarts between reconciliation passes.
#[derive(Clone)]
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    pub async fn new(state_dir: &Path) -> Result<Self> {
        let db_path = state_dir.join("state.db");
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
        Self::connect(&db_url).await
    }

    /// Private in-memory database, mainly for tests.
    pub async fn in_memory() -> Result<Self> {
        // One connection, otherwise each would see its own empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn connect(db_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS private_state (
                instance_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (instance_id, key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Private state scoped to one managed instance.
    pub fn instance(&self, instance_id: &str) -> InstanceState {
        InstanceState {
            pool: self.pool.clone(),
            instance_id: instance_id.to_string(),
        }
    }

    /// Every instance currently holding a value under `key`.
    pub async fn list(&self, key: &str) -> Result<Vec<StateEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT instance_id, value, updated_at
            FROM private_state WHERE key = ? ORDER BY instance_id
            "#,
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| StateEntry {
                instance_id: r.get("instance_id"),
                value: r.get("value"),
                updated_at: r.get("updated_at"),
            })
            .collect())
    }

    /// Drop `key` for an instance. Returns whether anything was removed.
    pub async fn forget(&self, instance_id: &str, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM private_state WHERE instance_id = ? AND key = ?")
            .bind(instance_id)
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[derive(Debug, Clone)]
pub struct StateEntry {
    pub instance_id: String,
    pub value: Vec<u8>,
    pub updated_at: String,
}

/// One instance's slice of a [`SqliteStateStore`].
#[derive(Clone)]
pub struct InstanceState {
    pool: SqlitePool,
    instance_id: String,
}

impl InstanceState {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

#[async_trait]
impl PrivateState for InstanceState {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value FROM private_state WHERE instance_id = ? AND key = ?")
            .bind(&self.instance_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get("value")))
    }

    async fn put(&self, key: &str, value: Option<Vec<u8>>) -> Result<()> {
        match value {
            Some(value) => {
                sqlx::query(
                    r#"
                    INSERT INTO private_state (instance_id, key, value, updated_at)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT (instance_id, key)
                    DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
                    "#,
                )
                .bind(&self.instance_id)
                .bind(key)
                .bind(value)
                .bind(Utc::now().to_rfc3339())
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM private_state WHERE instance_id = ? AND key = ?")
                    .bind(&self.instance_id)
                    .bind(key)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }
}

/// Handle as persisted: `{"kind": "...", "id": N}`.
///
/// The kind stays a string so that a value written by another version can
/// still be read and cleared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredHandle {
    pub kind: String,
    pub id: i64,
}

impl StoredHandle {
    /// Typed handle, `None` if the kind is not one this build knows.
    pub fn resolve(&self) -> Option<TaskHandle> {
        self.kind
            .parse::<TaskKind>()
            .ok()
            .map(|kind| TaskHandle::new(kind, self.id))
    }

    /// Decode a raw value. Empty bytes and `id == 0` mean "no task".
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>> {
        if bytes.is_empty() {
            return Ok(None);
        }
        let stored: StoredHandle =
            serde_json::from_slice(bytes).map_err(|e| Error::CorruptHandle(e.to_string()))?;
        if stored.id == 0 {
            return Ok(None);
        }
        Ok(Some(stored))
    }
}

impl From<TaskHandle> for StoredHandle {
    fn from(handle: TaskHandle) -> Self {
        Self {
            kind: handle.kind.as_str().to_string(),
            id: handle.id,
        }
    }
}

/// The single "current task" slot of a managed instance.
pub struct TaskHandleStore<'a> {
    state: &'a dyn PrivateState,
}

impl<'a> TaskHandleStore<'a> {
    pub fn new(state: &'a dyn PrivateState) -> Self {
        Self { state }
    }

    /// Record `handle`, replacing whatever was there.
    pub async fn set(&self, handle: TaskHandle) -> Result<()> {
        let bytes = serde_json::to_vec(&StoredHandle::from(handle))?;
        self.state.put(CURRENT_TASK_KEY, Some(bytes)).await?;
        debug!(task_kind = %handle.kind, task_id = handle.id, "Recorded task handle");
        Ok(())
    }

    pub async fn get(&self) -> Result<Option<StoredHandle>> {
        match self.state.get(CURRENT_TASK_KEY).await? {
            Some(bytes) => StoredHandle::decode(&bytes),
            None => Ok(None),
        }
    }

    /// Current handle, if it names a known kind.
    pub async fn current(&self) -> Result<Option<TaskHandle>> {
        let Some(stored) = self.get().await? else {
            return Ok(None);
        };
        match stored.resolve() {
            Some(handle) => Ok(Some(handle)),
            None => {
                warn!(kind = %stored.kind, task_id = stored.id, "Stored task handle has unknown kind");
                Ok(None)
            }
        }
    }

    pub async fn clear(&self) -> Result<()> {
        self.state.put(CURRENT_TASK_KEY, None).await?;
        debug!("Cleared task handle");
        Ok(())
    }
}
