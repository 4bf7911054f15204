//! Storage backend contract of the queue.

use async_trait::async_trait;

use crate::error::AppResult;
use crate::queue::{IndexEntry, NewRecord, QueueRecord};

/// Callback invoked for each fetched row, in offset order, while the fetch
/// transaction is still open.
pub type Deliver<'a> = &'a mut (dyn FnMut(QueueRecord) + Send);

#[async_trait]
pub trait QueueStorage: Send + Sync + 'static {
    /// Insert `record`, plus `index` when given, atomically. Returns the new offset.
    async fn insert(&self, record: NewRecord, index: Option<IndexEntry>) -> AppResult<i64>;

    /// Delete every row of `queue_type` with `key`.
    async fn delete(&self, queue_type: &str, key: &str) -> AppResult<u64>;

    /// Register `group` on `queue_type` at the current maximum offset unless
    /// it already exists. Returns the stored offset.
    async fn register_group(&self, group: &str, queue_type: &str) -> AppResult<i64>;

    /// Fetch up to `limit` rows after the group's offset, hand them to
    /// `deliver`, and advance the offset to the last one, in one transaction.
    /// Returns the number of rows delivered.
    async fn poll(
        &self,
        group: &str,
        queue_type: &str,
        limit: i64,
        deliver: Deliver<'_>,
    ) -> AppResult<usize>;

    async fn group_offset(&self, group: &str, queue_type: &str) -> AppResult<Option<i64>>;

    /// Delete rows every registered group of `queue_type` has consumed.
    async fn truncate(&self, queue_type: &str) -> AppResult<u64>;

    async fn find_index(&self, kind: &str, key: &str) -> AppResult<Option<serde_json::Value>>;

    async fn list_index(&self, kind: &str) -> AppResult<Vec<serde_json::Value>>;
}
