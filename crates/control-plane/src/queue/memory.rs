//! In-memory queue storage for tests and single-process embedding.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::{AppError, AppResult};
use crate::queue::storage::{Deliver, QueueStorage};
use crate::queue::{IndexEntry, NewRecord, QueueRecord};

#[derive(Default)]
struct Inner {
    last_offset: i64,
    rows: Vec<QueueRecord>,
    offsets: HashMap<(String, String), i64>,
    index: HashMap<(String, String), serde_json::Value>,
}

impl Inner {
    fn max_offset(&self, queue_type: &str) -> i64 {
        self.rows
            .iter()
            .filter(|r| r.queue_type == queue_type)
            .map(|r| r.offset)
            .max()
            .unwrap_or(0)
    }
}

/// Queue storage kept behind one async mutex; every call is a transaction.
#[derive(Default)]
pub struct MemoryQueueStorage {
    inner: Mutex<Inner>,
}

impl MemoryQueueStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows currently stored for `queue_type`.
    pub async fn count(&self, queue_type: &str) -> usize {
        let inner = self.inner.lock().await;
        inner.rows.iter().filter(|r| r.queue_type == queue_type).count()
    }
}

#[async_trait]
impl QueueStorage for MemoryQueueStorage {
    async fn insert(&self, record: NewRecord, index: Option<IndexEntry>) -> AppResult<i64> {
        let mut inner = self.inner.lock().await;
        if let Some(index) = index {
            inner.index.insert((index.kind, index.key), index.value);
        }

        inner.last_offset += 1;
        let offset = inner.last_offset;
        inner.rows.push(QueueRecord {
            offset,
            queue_type: record.queue_type,
            key: record.key,
            value: record.value,
            consumer_group: record.consumer_group,
            updated: Utc::now(),
        });
        Ok(offset)
    }

    async fn delete(&self, queue_type: &str, key: &str) -> AppResult<u64> {
        let mut inner = self.inner.lock().await;
        let before = inner.rows.len();
        inner
            .rows
            .retain(|r| !(r.queue_type == queue_type && r.key == key));
        Ok((before - inner.rows.len()) as u64)
    }

    async fn register_group(&self, group: &str, queue_type: &str) -> AppResult<i64> {
        let mut inner = self.inner.lock().await;
        let max = inner.max_offset(queue_type);
        let offset = *inner
            .offsets
            .entry((group.to_string(), queue_type.to_string()))
            .or_insert(max);
        Ok(offset)
    }

    async fn poll(
        &self,
        group: &str,
        queue_type: &str,
        limit: i64,
        deliver: Deliver<'_>,
    ) -> AppResult<usize> {
        let mut inner = self.inner.lock().await;
        let slot = (group.to_string(), queue_type.to_string());
        let current = *inner.offsets.get(&slot).ok_or_else(|| {
            AppError::Queue(format!(
                "consumer group '{}' is not registered on {}",
                group, queue_type
            ))
        })?;

        let rows: Vec<QueueRecord> = inner
            .rows
            .iter()
            .filter(|r| r.queue_type == queue_type && r.offset > current)
            .filter(|r| r.consumer_group.as_deref().map_or(true, |g| g == group))
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect();

        let count = rows.len();
        if let Some(last) = rows.last().map(|r| r.offset) {
            inner.offsets.insert(slot, last);
        }
        for row in rows {
            deliver(row);
        }
        Ok(count)
    }

    async fn group_offset(&self, group: &str, queue_type: &str) -> AppResult<Option<i64>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .offsets
            .get(&(group.to_string(), queue_type.to_string()))
            .copied())
    }

    async fn truncate(&self, queue_type: &str) -> AppResult<u64> {
        let mut inner = self.inner.lock().await;
        let Some(min) = inner
            .offsets
            .iter()
            .filter(|((_, t), _)| t == queue_type)
            .map(|(_, offset)| *offset)
            .min()
        else {
            return Ok(0);
        };

        let before = inner.rows.len();
        inner
            .rows
            .retain(|r| !(r.queue_type == queue_type && r.offset <= min));
        Ok((before - inner.rows.len()) as u64)
    }

    async fn find_index(&self, kind: &str, key: &str) -> AppResult<Option<serde_json::Value>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .index
            .get(&(kind.to_string(), key.to_string()))
            .cloned())
    }

    async fn list_index(&self, kind: &str) -> AppResult<Vec<serde_json::Value>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .index
            .iter()
            .filter(|((k, _), _)| k == kind)
            .map(|(_, value)| value.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(queue_type: &str, key: &str, group: Option<&str>) -> NewRecord {
        NewRecord {
            queue_type: queue_type.to_string(),
            key: key.to_string(),
            value: json!({"key": key}),
            consumer_group: group.map(str::to_string),
        }
    }

    async fn collect(storage: &MemoryQueueStorage, group: &str, queue_type: &str) -> Vec<String> {
        let mut keys = Vec::new();
        storage
            .poll(group, queue_type, 100, &mut |r: QueueRecord| keys.push(r.key))
            .await
            .unwrap();
        keys
    }

    #[tokio::test]
    async fn test_register_group_keeps_stored_offset() {
        let storage = MemoryQueueStorage::new();
        assert_eq!(storage.register_group("g", "a").await.unwrap(), 0);

        storage.insert(record("a", "1", None), None).await.unwrap();
        storage.insert(record("b", "2", None), None).await.unwrap();
        assert_eq!(storage.register_group("g", "a").await.unwrap(), 0);
        assert_eq!(storage.register_group("g", "b").await.unwrap(), 2);
        assert_eq!(collect(&storage, "g", "a").await, vec!["1"]);
    }

    #[tokio::test]
    async fn test_group_starts_at_max_offset() {
        let storage = MemoryQueueStorage::new();
        storage.insert(record("a", "1", None), None).await.unwrap();
        storage.insert(record("a", "2", None), None).await.unwrap();

        assert_eq!(storage.register_group("g", "a").await.unwrap(), 2);
        assert!(collect(&storage, "g", "a").await.is_empty());

        storage.insert(record("a", "3", None), None).await.unwrap();
        assert_eq!(collect(&storage, "g", "a").await, vec!["3"]);
        assert_eq!(storage.group_offset("g", "a").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_queue_types_advance_independently() {
        let storage = MemoryQueueStorage::new();
        storage.register_group("g", "a").await.unwrap();
        storage.register_group("g", "b").await.unwrap();
        storage.insert(record("a", "1", None), None).await.unwrap();
        storage.insert(record("b", "2", None), None).await.unwrap();

        assert_eq!(collect(&storage, "g", "a").await, vec!["1"]);
        assert_eq!(storage.group_offset("g", "b").await.unwrap(), Some(0));
        assert_eq!(collect(&storage, "g", "b").await, vec!["2"]);
    }

    #[tokio::test]
    async fn test_targeted_rows_reach_one_group() {
        let storage = MemoryQueueStorage::new();
        storage.register_group("left", "a").await.unwrap();
        storage.register_group("right", "a").await.unwrap();
        storage.insert(record("a", "1", Some("left")), None).await.unwrap();
        storage.insert(record("a", "2", None), None).await.unwrap();

        assert_eq!(collect(&storage, "left", "a").await, vec!["1", "2"]);
        assert_eq!(collect(&storage, "right", "a").await, vec!["2"]);
    }

    #[tokio::test]
    async fn test_unregistered_group_is_an_error() {
        let storage = MemoryQueueStorage::new();
        let result = storage.poll("g", "a", 10, &mut |_: QueueRecord| {}).await;
        assert!(matches!(result, Err(AppError::Queue(_))));
    }

    #[tokio::test]
    async fn test_truncate_keeps_unconsumed_rows() {
        let storage = MemoryQueueStorage::new();
        storage.register_group("fast", "a").await.unwrap();
        storage.register_group("slow", "a").await.unwrap();
        for key in ["1", "2", "3"] {
            storage.insert(record("a", key, None), None).await.unwrap();
        }
        collect(&storage, "fast", "a").await;
        storage
            .poll("slow", "a", 1, &mut |_: QueueRecord| {})
            .await
            .unwrap();

        assert_eq!(tokio_test::assert_ok!(storage.truncate("a").await), 1);
        assert_eq!(storage.count("a").await, 2);
    }

    #[tokio::test]
    async fn test_index_written_with_message() {
        let storage = MemoryQueueStorage::new();
        let index = IndexEntry {
            kind: "execution".to_string(),
            key: "1".to_string(),
            value: json!({"v": 2}),
        };
        storage.insert(record("a", "1", None), Some(index)).await.unwrap();

        assert_eq!(
            storage.find_index("execution", "1").await.unwrap(),
            Some(json!({"v": 2}))
        );
        assert_eq!(storage.list_index("execution").await.unwrap().len(), 1);
        assert_eq!(storage.delete("a", "1").await.unwrap(), 1);
        assert!(storage.find_index("execution", "1").await.unwrap().is_some());
    }
}
