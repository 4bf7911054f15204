//! Runway core.
//!
//! Data model and pure logic of the orchestrator:
//! - `models`: flows, tasks, executions, task runs, triggers and conditions
//! - `engine`: next-task resolution and the executor merge step
//! - `triggers`: cron schedules and multi-flow conditions
//! - `retry`: retry policies and the async retry runner
//! - `run_context`: variables and template rendering
//!
//! Nothing here performs I/O; queues and storage live in the control plane.

pub mod engine;
pub mod error;
pub mod models;
pub mod retry;
pub mod run_context;
pub mod triggers;

pub use error::{CoreError, CoreResult};
