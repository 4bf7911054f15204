//! PostgreSQL repositories. Rows keep the full model as JSONB next to the
//! columns used for lookups.

use async_trait::async_trait;
use runway_core::models::{Flow, ServiceInstance, TriggerContext};
use runway_core::triggers::MultipleConditionWindow;
use sqlx::types::Json;

use crate::db::DbPool;
use crate::error::AppResult;
use crate::repository::{
    stale_instance, FlowRepository, MultipleConditionStorage, ServiceInstanceRepository,
    TriggerContextStore,
};

#[derive(Clone)]
pub struct PgFlowRepository {
    db: DbPool,
}

impl PgFlowRepository {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl FlowRepository for PgFlowRepository {
    async fn save_revision(&self, flow: &Flow) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO flows (namespace, id, revision, deleted, value, updated)
            VALUES ($1, $2, $3, $4, $5, now())
            ON CONFLICT (namespace, id, revision, deleted)
            DO UPDATE SET value = EXCLUDED.value, updated = now()
            "#,
        )
        .bind(&flow.namespace)
        .bind(&flow.id)
        .bind(flow.revision)
        .bind(flow.deleted)
        .bind(Json(flow))
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn find_revisions(&self, namespace: &str, id: &str) -> AppResult<Vec<Flow>> {
        let rows: Vec<Json<Flow>> = sqlx::query_scalar(
            r#"
            SELECT value FROM flows
            WHERE namespace = $1 AND id = $2
            ORDER BY revision
            "#,
        )
        .bind(namespace)
        .bind(id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(|Json(flow)| flow).collect())
    }

    async fn find_all_revisions(&self) -> AppResult<Vec<Flow>> {
        let rows: Vec<Json<Flow>> =
            sqlx::query_scalar("SELECT value FROM flows ORDER BY namespace, id, revision")
                .fetch_all(&self.db)
                .await?;
        Ok(rows.into_iter().map(|Json(flow)| flow).collect())
    }
}

#[derive(Clone)]
pub struct PgMultipleConditionStorage {
    db: DbPool,
}

impl PgMultipleConditionStorage {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MultipleConditionStorage for PgMultipleConditionStorage {
    async fn get(
        &self,
        namespace: &str,
        flow_id: &str,
        condition_id: &str,
    ) -> AppResult<Option<MultipleConditionWindow>> {
        let row: Option<Json<MultipleConditionWindow>> = sqlx::query_scalar(
            r#"
            SELECT value FROM multiple_condition_windows
            WHERE namespace = $1 AND flow_id = $2 AND condition_id = $3
            "#,
        )
        .bind(namespace)
        .bind(flow_id)
        .bind(condition_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(|Json(window)| window))
    }

    async fn find_all(&self) -> AppResult<Vec<MultipleConditionWindow>> {
        let rows: Vec<Json<MultipleConditionWindow>> =
            sqlx::query_scalar("SELECT value FROM multiple_condition_windows")
                .fetch_all(&self.db)
                .await?;
        Ok(rows.into_iter().map(|Json(window)| window).collect())
    }

    async fn save(&self, windows: &[MultipleConditionWindow]) -> AppResult<()> {
        let mut tx = self.db.begin().await?;
        for window in windows {
            sqlx::query(
                r#"
                INSERT INTO multiple_condition_windows
                    (namespace, flow_id, condition_id, start_date, end_date, value)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (namespace, flow_id, condition_id)
                DO UPDATE SET start_date = EXCLUDED.start_date,
                              end_date = EXCLUDED.end_date,
                              value = EXCLUDED.value
                "#,
            )
            .bind(&window.namespace)
            .bind(&window.flow_id)
            .bind(&window.condition_id)
            .bind(window.start)
            .bind(window.end)
            .bind(Json(window))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, window: &MultipleConditionWindow) -> AppResult<()> {
        sqlx::query(
            r#"
            DELETE FROM multiple_condition_windows
            WHERE namespace = $1 AND flow_id = $2 AND condition_id = $3
            "#,
        )
        .bind(&window.namespace)
        .bind(&window.flow_id)
        .bind(&window.condition_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct PgTriggerContextStore {
    db: DbPool,
}

impl PgTriggerContextStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TriggerContextStore for PgTriggerContextStore {
    async fn find(&self, uid: &str) -> AppResult<Option<TriggerContext>> {
        let row: Option<Json<TriggerContext>> =
            sqlx::query_scalar("SELECT value FROM trigger_contexts WHERE uid = $1")
                .bind(uid)
                .fetch_optional(&self.db)
                .await?;
        Ok(row.map(|Json(context)| context))
    }

    async fn save(&self, context: &TriggerContext) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO trigger_contexts (uid, value, updated)
            VALUES ($1, $2, now())
            ON CONFLICT (uid) DO UPDATE SET value = EXCLUDED.value, updated = now()
            "#,
        )
        .bind(context.uid())
        .bind(Json(context))
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn delete(&self, uid: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM trigger_contexts WHERE uid = $1")
            .bind(uid)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct PgServiceInstanceRepository {
    db: DbPool,
}

impl PgServiceInstanceRepository {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ServiceInstanceRepository for PgServiceInstanceRepository {
    async fn find_by_id(&self, id: &str) -> AppResult<Option<ServiceInstance>> {
        let row: Option<Json<ServiceInstance>> =
            sqlx::query_scalar("SELECT value FROM service_instances WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.db)
                .await?;
        Ok(row.map(|Json(instance)| instance))
    }

    async fn find_all(&self) -> AppResult<Vec<ServiceInstance>> {
        let rows: Vec<Json<ServiceInstance>> =
            sqlx::query_scalar("SELECT value FROM service_instances ORDER BY updated_at")
                .fetch_all(&self.db)
                .await?;
        Ok(rows.into_iter().map(|Json(instance)| instance).collect())
    }

    async fn save(&self, instance: &ServiceInstance) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO service_instances (id, type, state, seq_id, updated_at, value)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
            SET type = EXCLUDED.type,
                state = EXCLUDED.state,
                seq_id = EXCLUDED.seq_id,
                updated_at = EXCLUDED.updated_at,
                value = EXCLUDED.value
            WHERE service_instances.seq_id < EXCLUDED.seq_id
            "#,
        )
        .bind(&instance.id)
        .bind(instance.service_type.as_str())
        .bind(instance.state.as_str())
        .bind(instance.seq_id)
        .bind(instance.updated_at)
        .bind(Json(instance))
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(stale_instance(instance));
        }
        Ok(())
    }
}
