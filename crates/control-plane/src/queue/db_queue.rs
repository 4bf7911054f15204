//! Typed queue handle and its adaptive poller.

use std::marker::PhantomData;
use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::error::AppResult;
use crate::queue::storage::QueueStorage;
use crate::queue::{IndexEntry, NewRecord, PollerPool, QueueMessage, QueueRecord};

/// Queue of `T` messages over a shared [`QueueStorage`].
pub struct DbQueue<T: QueueMessage> {
    storage: Arc<dyn QueueStorage>,
    config: QueueConfig,
    pool: PollerPool,
    token: CancellationToken,
    tracker: TaskTracker,
    _marker: PhantomData<fn() -> T>,
}

/// Handle of one consumer registered with [`DbQueue::receive`].
#[derive(Debug, Clone)]
pub struct Receiver {
    token: CancellationToken,
}

impl Receiver {
    /// Stop polling after the current fetch completes.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl<T: QueueMessage> DbQueue<T> {
    pub fn new(storage: Arc<dyn QueueStorage>, config: QueueConfig, pool: &PollerPool) -> Self {
        Self {
            storage,
            config,
            token: pool.child_token(),
            pool: pool.clone(),
            tracker: TaskTracker::new(),
            _marker: PhantomData,
        }
    }

    pub(crate) fn storage(&self) -> &Arc<dyn QueueStorage> {
        &self.storage
    }

    async fn insert(&self, message: &T, group: Option<&str>, indexed: bool) -> AppResult<i64> {
        let key = message.key();
        let value = serde_json::to_value(message)?;
        let index = match T::INDEX_KIND {
            Some(kind) if indexed => Some(IndexEntry {
                kind: kind.to_string(),
                key: key.clone(),
                value: value.clone(),
            }),
            _ => None,
        };

        let offset = self
            .storage
            .insert(
                NewRecord {
                    queue_type: T::QUEUE_TYPE.to_string(),
                    key: key.clone(),
                    value,
                    consumer_group: group.map(str::to_string),
                },
                index,
            )
            .await?;

        debug!(queue = T::QUEUE_TYPE, key = %key, offset, group, "Message emitted");
        Ok(offset)
    }

    /// Emit to every consumer group, updating the index for indexed types.
    pub async fn emit(&self, message: &T) -> AppResult<i64> {
        self.insert(message, None, true).await
    }

    /// Emit a message only `group` will receive.
    pub async fn emit_to(&self, group: &str, message: &T) -> AppResult<i64> {
        self.insert(message, Some(group), true).await
    }

    /// Emit without touching the index.
    pub async fn emit_only(&self, message: &T) -> AppResult<i64> {
        self.insert(message, None, false).await
    }

    /// Retract every pending row with the message's key.
    pub async fn delete(&self, message: &T) -> AppResult<u64> {
        self.storage.delete(T::QUEUE_TYPE, &message.key()).await
    }

    /// Drop rows every consumer group has already received.
    pub async fn truncate(&self) -> AppResult<u64> {
        let deleted = self.storage.truncate(T::QUEUE_TYPE).await?;
        if deleted > 0 {
            info!(queue = T::QUEUE_TYPE, deleted, "Queue truncated");
        }
        Ok(deleted)
    }

    /// Register `group` and start polling for it in the background.
    ///
    /// A group seen for the first time starts after the current last message.
    pub async fn receive<F>(&self, group: &str, consumer: F) -> AppResult<Receiver>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let offset = self.storage.register_group(group, T::QUEUE_TYPE).await?;
        info!(queue = T::QUEUE_TYPE, group, offset, "Consumer registered");

        let token = self.token.child_token();
        let poller = Poller {
            storage: self.storage.clone(),
            config: self.config.clone(),
            group: group.to_string(),
            token: token.clone(),
            consumer,
            _marker: PhantomData::<fn() -> T>,
        };
        self.pool.spawn(self.tracker.track_future(poller.run()));

        Ok(Receiver { token })
    }

    /// Stop every poller of this queue after their current fetch.
    pub fn pause(&self) {
        self.token.cancel();
    }

    /// Stop every poller of this queue and wait for them to exit.
    pub async fn close(&self) {
        self.pause();
        self.tracker.close();
        self.tracker.wait().await;
        debug!(queue = T::QUEUE_TYPE, "Queue closed");
    }
}

struct Poller<T, F> {
    storage: Arc<dyn QueueStorage>,
    config: QueueConfig,
    group: String,
    token: CancellationToken,
    consumer: F,
    _marker: PhantomData<fn() -> T>,
}

impl<T, F> Poller<T, F>
where
    T: QueueMessage,
    F: Fn(T) + Send + Sync + 'static,
{
    fn deliver(&self, record: QueueRecord) {
        match serde_json::from_value::<T>(record.value) {
            Ok(message) => (self.consumer)(message),
            Err(e) => warn!(
                queue = T::QUEUE_TYPE,
                offset = record.offset,
                key = %record.key,
                error = %e,
                "Unable to deserialize message, skipping"
            ),
        }
    }

    async fn run(self) {
        let mut last_message = Instant::now();

        while !self.token.is_cancelled() {
            let result = self
                .storage
                .poll(
                    &self.group,
                    T::QUEUE_TYPE,
                    self.config.poll_size,
                    &mut |record: QueueRecord| self.deliver(record),
                )
                .await;

            match result {
                Ok(0) => {}
                Ok(count) => {
                    last_message = Instant::now();
                    debug!(queue = T::QUEUE_TYPE, group = %self.group, count, "Messages received");
                }
                Err(e) => warn!(
                    queue = T::QUEUE_TYPE,
                    group = %self.group,
                    error = %e,
                    "Queue poll failed, retrying"
                ),
            }

            let interval = self.config.next_poll_interval(last_message.elapsed());
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        debug!(queue = T::QUEUE_TYPE, group = %self.group, "Poller stopped");
    }
}
