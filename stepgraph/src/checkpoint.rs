//! Checkpointing for persistent graph state
//!
//! A checkpoint records the state after a step together with the node that
//! ran and the node pending next. Stores keep an ordered history per thread
//! and return it newest first. Writes for one thread must be serialized by the
//! caller; different threads are independent.

use crate::error::{GraphError, Result};
use crate::serializer::{JsonStateSerializer, StateSerializer};
use crate::state::State;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Snapshot of a thread's state and position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique checkpoint ID
    pub id: String,
    /// Thread this checkpoint belongs to
    pub thread_id: String,
    /// Last node executed
    pub node_id: String,
    /// Node pending next; `None` when the outgoing edge is still to be evaluated
    pub next_node_id: Option<String>,
    /// State snapshot
    pub state: State,
    /// Checkpoint this one was forked from
    pub parent_id: Option<String>,
    /// Step number within the run that wrote it
    pub step: usize,
    /// Metadata
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Save time
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Create a new checkpoint
    pub fn new(
        thread_id: &str,
        node_id: &str,
        next_node_id: Option<&str>,
        state: State,
        step: usize,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            thread_id: thread_id.to_string(),
            node_id: node_id.to_string(),
            next_node_id: next_node_id.map(str::to_string),
            state,
            parent_id: None,
            step,
            metadata: HashMap::new(),
            saved_at: Utc::now(),
        }
    }

    /// Add metadata
    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// A new checkpoint derived from this one, linked through `parent_id`
    pub fn fork(&self) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id: Some(self.id.clone()),
            saved_at: Utc::now(),
            ..self.clone()
        }
    }
}

/// History of a thread taken out of circulation by [`Checkpointer::release`]
#[derive(Debug, Clone)]
pub struct ReleasedThread {
    /// Released thread id
    pub thread_id: String,
    /// The thread's checkpoints, newest first
    pub checkpoints: Vec<Checkpoint>,
    /// When the thread was released
    pub released_at: DateTime<Utc>,
}

impl ReleasedThread {
    fn new(thread_id: &str, checkpoints: Vec<Checkpoint>) -> Self {
        Self { thread_id: thread_id.to_string(), checkpoints, released_at: Utc::now() }
    }
}

/// Checkpointer trait for persistence
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// All checkpoints of a thread, newest first
    async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint>>;

    /// Load a specific checkpoint by ID
    async fn get(&self, checkpoint_id: &str) -> Result<Option<Checkpoint>>;

    /// Add a checkpoint at the head of its thread, creating the thread if absent
    async fn append(&self, checkpoint: &Checkpoint) -> Result<String>;

    /// Overwrite an existing checkpoint in place, keeping its id and position
    async fn replace(&self, checkpoint_id: &str, checkpoint: &Checkpoint) -> Result<String>;

    /// Hide a thread's history; later runs on the same id start fresh
    async fn release(&self, thread_id: &str) -> Result<ReleasedThread>;

    /// Newest checkpoint of a thread
    async fn latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.history(thread_id).await?.into_iter().next())
    }
}

/// A checkpoint with its state kept in serialized form
#[derive(Clone)]
struct StoredCheckpoint {
    header: Checkpoint,
    state: Vec<u8>,
}

/// In-memory checkpointer for development and testing.
///
/// Clones share the same storage.
#[derive(Clone)]
pub struct MemoryCheckpointer {
    threads: Arc<RwLock<HashMap<String, Vec<StoredCheckpoint>>>>,
    serializer: Arc<dyn StateSerializer>,
}

impl MemoryCheckpointer {
    /// Create a new in-memory checkpointer
    pub fn new() -> Self {
        Self::with_serializer(JsonStateSerializer)
    }

    /// Create a checkpointer that stores state with `serializer`
    pub fn with_serializer<S: StateSerializer + 'static>(serializer: S) -> Self {
        Self { threads: Arc::new(RwLock::new(HashMap::new())), serializer: Arc::new(serializer) }
    }

    fn encode(&self, checkpoint: &Checkpoint) -> Result<StoredCheckpoint> {
        let state = self.serializer.serialize(&checkpoint.state)?;
        let header = Checkpoint { state: State::new(), ..checkpoint.clone() };
        Ok(StoredCheckpoint { header, state })
    }

    fn decode(&self, stored: &StoredCheckpoint) -> Result<Checkpoint> {
        let state = self.serializer.deserialize(&stored.state)?;
        Ok(Checkpoint { state, ..stored.header.clone() })
    }
}

impl Default for MemoryCheckpointer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Checkpointer for MemoryCheckpointer {
    async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        let threads = self.threads.read().await;
        let Some(stored) = threads.get(thread_id) else {
            return Ok(Vec::new());
        };
        stored.iter().rev().map(|s| self.decode(s)).collect()
    }

    async fn get(&self, checkpoint_id: &str) -> Result<Option<Checkpoint>> {
        let threads = self.threads.read().await;
        threads
            .values()
            .flat_map(|stored| stored.iter())
            .find(|s| s.header.id == checkpoint_id)
            .map(|s| self.decode(s))
            .transpose()
    }

    async fn append(&self, checkpoint: &Checkpoint) -> Result<String> {
        let stored = self.encode(checkpoint)?;
        let mut threads = self.threads.write().await;
        threads.entry(checkpoint.thread_id.clone()).or_default().push(stored);
        Ok(checkpoint.id.clone())
    }

    async fn replace(&self, checkpoint_id: &str, checkpoint: &Checkpoint) -> Result<String> {
        let mut stored = self.encode(checkpoint)?;
        stored.header.id = checkpoint_id.to_string();

        let mut threads = self.threads.write().await;
        let slot = threads
            .get_mut(&checkpoint.thread_id)
            .and_then(|history| history.iter_mut().find(|s| s.header.id == checkpoint_id))
            .ok_or_else(|| GraphError::CheckpointNotFound(checkpoint_id.to_string()))?;
        *slot = stored;
        Ok(checkpoint_id.to_string())
    }

    async fn release(&self, thread_id: &str) -> Result<ReleasedThread> {
        let stored = self.threads.write().await.remove(thread_id).unwrap_or_default();
        let checkpoints = stored.iter().rev().map(|s| self.decode(s)).collect::<Result<Vec<_>>>()?;
        Ok(ReleasedThread::new(thread_id, checkpoints))
    }
}

/// SQLite checkpointer for production use
#[cfg(feature = "sqlite")]
pub struct SqliteCheckpointer {
    pool: sqlx::SqlitePool,
    serializer: Arc<dyn StateSerializer>,
}

#[cfg(feature = "sqlite")]
type CheckpointRow =
    (String, String, String, Option<String>, Option<String>, i64, Vec<u8>, String, String);

#[cfg(feature = "sqlite")]
const SELECT_COLUMNS: &str =
    "SELECT id, thread_id, node_id, next_node_id, parent_id, step, state, metadata, saved_at \
     FROM graph_checkpoints";

#[cfg(feature = "sqlite")]
impl SqliteCheckpointer {
    /// Create a new SQLite checkpointer
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = sqlx::SqlitePool::connect(database_url).await?;
        Self::with_pool(pool).await
    }

    /// Create an in-memory SQLite checkpointer (for testing)
    pub async fn in_memory() -> Result<Self> {
        // Every connection to `:memory:` opens a separate database.
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool).await
    }

    /// Use an existing pool, creating the table if needed
    pub async fn with_pool(pool: sqlx::SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS graph_checkpoints (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                thread_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                next_node_id TEXT,
                parent_id TEXT,
                step INTEGER NOT NULL,
                state BLOB NOT NULL,
                metadata TEXT NOT NULL,
                saved_at TEXT NOT NULL,
                released INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_graph_checkpoints_thread
            ON graph_checkpoints(thread_id, released, seq DESC)
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool, serializer: Arc::new(JsonStateSerializer) })
    }

    /// Store state with `serializer`
    pub fn with_serializer<S: StateSerializer + 'static>(mut self, serializer: S) -> Self {
        self.serializer = Arc::new(serializer);
        self
    }

    fn from_row(&self, row: CheckpointRow) -> Result<Checkpoint> {
        let (id, thread_id, node_id, next_node_id, parent_id, step, state, metadata, saved_at) =
            row;
        Ok(Checkpoint {
            id,
            thread_id,
            node_id,
            next_node_id,
            parent_id,
            step: step as usize,
            state: self.serializer.deserialize(&state)?,
            metadata: serde_json::from_str(&metadata)?,
            saved_at: DateTime::parse_from_rfc3339(&saved_at)
                .map_err(|e| GraphError::CheckpointError(e.to_string()))?
                .with_timezone(&Utc),
        })
    }
}

#[cfg(feature = "sqlite")]
#[async_trait]
impl Checkpointer for SqliteCheckpointer {
    async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        let rows: Vec<CheckpointRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE thread_id = ? AND released = 0 ORDER BY seq DESC"
        ))
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|row| self.from_row(row)).collect()
    }

    async fn get(&self, checkpoint_id: &str) -> Result<Option<Checkpoint>> {
        let row: Option<CheckpointRow> =
            sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = ? AND released = 0"))
                .bind(checkpoint_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|row| self.from_row(row)).transpose()
    }

    async fn append(&self, checkpoint: &Checkpoint) -> Result<String> {
        let state = self.serializer.serialize(&checkpoint.state)?;
        let metadata = serde_json::to_string(&checkpoint.metadata)?;

        sqlx::query(
            r#"
            INSERT INTO graph_checkpoints
                (id, thread_id, node_id, next_node_id, parent_id, step, state, metadata, saved_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&checkpoint.id)
        .bind(&checkpoint.thread_id)
        .bind(&checkpoint.node_id)
        .bind(&checkpoint.next_node_id)
        .bind(&checkpoint.parent_id)
        .bind(checkpoint.step as i64)
        .bind(&state)
        .bind(&metadata)
        .bind(checkpoint.saved_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(checkpoint.id.clone())
    }

    async fn replace(&self, checkpoint_id: &str, checkpoint: &Checkpoint) -> Result<String> {
        let state = self.serializer.serialize(&checkpoint.state)?;
        let metadata = serde_json::to_string(&checkpoint.metadata)?;

        let result = sqlx::query(
            r#"
            UPDATE graph_checkpoints
            SET node_id = ?, next_node_id = ?, parent_id = ?, step = ?, state = ?,
                metadata = ?, saved_at = ?
            WHERE id = ? AND thread_id = ? AND released = 0
            "#,
        )
        .bind(&checkpoint.node_id)
        .bind(&checkpoint.next_node_id)
        .bind(&checkpoint.parent_id)
        .bind(checkpoint.step as i64)
        .bind(&state)
        .bind(&metadata)
        .bind(checkpoint.saved_at.to_rfc3339())
        .bind(checkpoint_id)
        .bind(&checkpoint.thread_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(GraphError::CheckpointNotFound(checkpoint_id.to_string()));
        }
        Ok(checkpoint_id.to_string())
    }

    async fn release(&self, thread_id: &str) -> Result<ReleasedThread> {
        let checkpoints = self.history(thread_id).await?;
        sqlx::query("UPDATE graph_checkpoints SET released = 1 WHERE thread_id = ? AND released = 0")
            .bind(thread_id)
            .execute(&self.pool)
            .await?;
        Ok(ReleasedThread::new(thread_id, checkpoints))
    }
}
