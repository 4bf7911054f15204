//! Database connectivity and schema for the Runway control plane.

pub mod pool;
pub mod schema;

pub use pool::{create_pool, DbPool};
pub use schema::migrate;
