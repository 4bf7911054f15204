//! Durable queue on top of relational storage.
//!
//! All message types share one physical table; each row carries its type,
//! a dedup key, a JSON payload and an optional target consumer group. Every
//! consumer group tracks its own offset per message type, and reads and
//! offset advances happen in the same transaction.

pub mod db_queue;
pub mod memory;
pub mod pool;
pub mod postgres;
pub mod storage;

use chrono::{DateTime, Utc};
use runway_core::models::{Execution, WorkerTask, WorkerTaskResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use db_queue::{DbQueue, Receiver};
pub use memory::MemoryQueueStorage;
pub use pool::PollerPool;
pub use postgres::PgQueueStorage;
pub use storage::QueueStorage;

/// A payload that can travel through a [`DbQueue`].
pub trait QueueMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Discriminator stored in the `type` column.
    const QUEUE_TYPE: &'static str;

    /// When set, every emit also upserts the payload into the queue index
    /// under this kind, in the same transaction.
    const INDEX_KIND: Option<&'static str> = None;

    /// Dedup and partition key.
    fn key(&self) -> String;
}

impl QueueMessage for Execution {
    const QUEUE_TYPE: &'static str = "runway.execution";
    const INDEX_KIND: Option<&'static str> = Some("execution");

    fn key(&self) -> String {
        self.id.clone()
    }
}

impl QueueMessage for WorkerTask {
    const QUEUE_TYPE: &'static str = "runway.worker-task";

    fn key(&self) -> String {
        self.task_run.id.clone()
    }
}

impl QueueMessage for WorkerTaskResult {
    const QUEUE_TYPE: &'static str = "runway.worker-task-result";

    fn key(&self) -> String {
        self.task_run.id.clone()
    }
}

/// One persisted queue row.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct QueueRecord {
    pub offset: i64,
    #[sqlx(rename = "type")]
    pub queue_type: String,
    pub key: String,
    pub value: serde_json::Value,
    pub consumer_group: Option<String>,
    pub updated: DateTime<Utc>,
}

/// Row to insert; the storage assigns the offset.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub queue_type: String,
    pub key: String,
    pub value: serde_json::Value,
    pub consumer_group: Option<String>,
}

/// Secondary lookup row written together with a message.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub kind: String,
    pub key: String,
    pub value: serde_json::Value,
}
