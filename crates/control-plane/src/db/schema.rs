//! Schema migrations embedded at build time from `migrations/`.

use tracing::info;

use crate::db::DbPool;
use crate::error::{AppError, AppResult};

/// Create the queue, index and repository tables if they are missing.
pub async fn migrate(pool: &DbPool) -> AppResult<()> {
    info!("Running database migrations");
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| AppError::Database(e.into()))?;
    info!("Migrations completed");
    Ok(())
}
