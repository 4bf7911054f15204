//! PostgreSQL queue storage.
//!
//! Emits of one message type serialise on a transaction-scoped advisory lock,
//! so a `BIGSERIAL` offset never becomes visible after a higher one.

use async_trait::async_trait;
use tracing::debug;

use crate::db::DbPool;
use crate::error::{AppError, AppResult};
use crate::queue::storage::{Deliver, QueueStorage};
use crate::queue::{IndexEntry, NewRecord, QueueRecord};

#[derive(Clone)]
pub struct PgQueueStorage {
    db: DbPool,
}

impl PgQueueStorage {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

async fn lock_queue_type(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    queue_type: &str,
) -> AppResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1)::bigint)")
        .bind(queue_type)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[async_trait]
impl QueueStorage for PgQueueStorage {
    async fn insert(&self, record: NewRecord, index: Option<IndexEntry>) -> AppResult<i64> {
        let mut tx = self.db.begin().await?;
        lock_queue_type(&mut tx, &record.queue_type).await?;

        if let Some(index) = index {
            sqlx::query(
                r#"
                INSERT INTO queue_index (kind, key, value, updated)
                VALUES ($1, $2, $3, now())
                ON CONFLICT (kind, key) DO UPDATE SET value = EXCLUDED.value, updated = now()
                "#,
            )
            .bind(&index.kind)
            .bind(&index.key)
            .bind(&index.value)
            .execute(&mut *tx)
            .await?;
        }

        let offset: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO queues (type, key, value, consumer_group)
            VALUES ($1, $2, $3, $4)
            RETURNING "offset"
            "#,
        )
        .bind(&record.queue_type)
        .bind(&record.key)
        .bind(&record.value)
        .bind(&record.consumer_group)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(offset)
    }

    async fn delete(&self, queue_type: &str, key: &str) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM queues WHERE type = $1 AND key = $2")
            .bind(queue_type)
            .bind(key)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected())
    }

    async fn register_group(&self, group: &str, queue_type: &str) -> AppResult<i64> {
        let mut tx = self.db.begin().await?;
        lock_queue_type(&mut tx, queue_type).await?;

        sqlx::query(
            r#"
            INSERT INTO queue_offsets (consumer_group, queue_type, "offset")
            SELECT $1, $2, COALESCE(MAX("offset"), 0) FROM queues WHERE type = $2
            ON CONFLICT (consumer_group, queue_type) DO NOTHING
            "#,
        )
        .bind(group)
        .bind(queue_type)
        .execute(&mut *tx)
        .await?;

        let offset: i64 = sqlx::query_scalar(
            r#"SELECT "offset" FROM queue_offsets WHERE consumer_group = $1 AND queue_type = $2"#,
        )
        .bind(group)
        .bind(queue_type)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(offset)
    }

    async fn poll(
        &self,
        group: &str,
        queue_type: &str,
        limit: i64,
        deliver: Deliver<'_>,
    ) -> AppResult<usize> {
        let mut tx = self.db.begin().await?;

        let current: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT "offset" FROM queue_offsets
            WHERE consumer_group = $1 AND queue_type = $2
            FOR UPDATE
            "#,
        )
        .bind(group)
        .bind(queue_type)
        .fetch_optional(&mut *tx)
        .await?;
        let current = current.ok_or_else(|| {
            AppError::Queue(format!(
                "consumer group '{}' is not registered on {}",
                group, queue_type
            ))
        })?;

        let rows = sqlx::query_as::<_, QueueRecord>(
            r#"
            SELECT "offset", type, key, value, consumer_group, updated
            FROM queues
            WHERE type = $1
              AND "offset" > $2
              AND (consumer_group IS NULL OR consumer_group = $3)
            ORDER BY "offset"
            LIMIT $4
            "#,
        )
        .bind(queue_type)
        .bind(current)
        .bind(group)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        let count = rows.len();
        let last = rows.last().map(|r| r.offset);
        for row in rows {
            deliver(row);
        }

        if let Some(last) = last {
            sqlx::query(
                r#"
                UPDATE queue_offsets SET "offset" = $3, updated = now()
                WHERE consumer_group = $1 AND queue_type = $2
                "#,
            )
            .bind(group)
            .bind(queue_type)
            .bind(last)
            .execute(&mut *tx)
            .await?;
            debug!(group, queue_type, count, offset = last, "Advanced consumer offset");
        }

        tx.commit().await?;
        Ok(count)
    }

    async fn group_offset(&self, group: &str, queue_type: &str) -> AppResult<Option<i64>> {
        let offset: Option<i64> = sqlx::query_scalar(
            r#"SELECT "offset" FROM queue_offsets WHERE consumer_group = $1 AND queue_type = $2"#,
        )
        .bind(group)
        .bind(queue_type)
        .fetch_optional(&self.db)
        .await?;
        Ok(offset)
    }

    async fn truncate(&self, queue_type: &str) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM queues
            WHERE type = $1
              AND "offset" <= (SELECT MIN("offset") FROM queue_offsets WHERE queue_type = $1)
            "#,
        )
        .bind(queue_type)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected())
    }

    async fn find_index(&self, kind: &str, key: &str) -> AppResult<Option<serde_json::Value>> {
        let value: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT value FROM queue_index WHERE kind = $1 AND key = $2")
                .bind(kind)
                .bind(key)
                .fetch_optional(&self.db)
                .await?;
        Ok(value)
    }

    async fn list_index(&self, kind: &str) -> AppResult<Vec<serde_json::Value>> {
        let values: Vec<serde_json::Value> =
            sqlx::query_scalar("SELECT value FROM queue_index WHERE kind = $1 ORDER BY updated")
                .bind(kind)
                .fetch_all(&self.db)
                .await?;
        Ok(values)
    }
}
