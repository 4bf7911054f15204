//! Runway Control Plane Library
//!
//! Durable plumbing and long-running services around `runway-core`:
//!
//! - **Queue**: relational message queue with consumer groups and adaptive
//!   polling, plus an in-memory storage for tests
//! - **Repositories**: versioned flows, trigger state and service instances
//! - **Executor**: reduces execution updates and worker results into new
//!   execution states and worker tasks
//! - **Scheduler** and **flow triggers**: start executions from cron
//!   schedules and from other executions terminating
//! - **Liveness**: heartbeats and the sweep of silent instances
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading from environment variables
//! - [`db`]: Connection pool and migrations
//! - [`error`]: Error type shared by every module
//! - [`queue`]: [`queue::DbQueue`] and its storages
//! - [`repository`]: Storage traits with PostgreSQL and in-memory backends
//! - [`services`]: Executor, scheduler, flow triggers, liveness, flow loading
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use runway_control_plane::{
//!     config::{DatabaseConfig, QueueConfig},
//!     db::{create_pool, migrate},
//!     queue::{DbQueue, PgQueueStorage, PollerPool},
//! };
//! use runway_core::models::Execution;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let db_pool = create_pool(&DatabaseConfig::from_env()?).await?;
//!     migrate(&db_pool).await?;
//!     let pool = PollerPool::new();
//!     let executions: DbQueue<Execution> = DbQueue::new(
//!         Arc::new(PgQueueStorage::new(db_pool)),
//!         QueueConfig::default(),
//!         &pool,
//!     );
//!     executions.receive("audit", |execution| println!("{}", execution.id)).await?;
//!     // ...
//!     pool.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod queue;
pub mod repository;
pub mod result_ext;
pub mod services;

pub use error::{AppError, AppResult};
pub use result_ext::{OptionResultExt, ResultExt};
