//! Configuration for the Runway control plane.
//!
//! Every struct is loaded from environment variables with `envy`; a missing
//! variable falls back to its default.

mod app;
mod database;
mod queue;
mod retry;

pub use app::AppConfig;
pub use database::DatabaseConfig;
pub use queue::QueueConfig;
pub use retry::RetryConfig;
