//! Runway Worker
//!
//! Runs task runs received from the worker task queue and sends their
//! results back to the executor.
//!
//! This crate provides:
//! - A registry of runnable task types with the built-in debug tasks
//! - A task runner applying timeouts, retry policies and working directories
//! - The worker loop bounding concurrency and heartbeating its service instance

pub mod config;
pub mod error;
pub mod runner;
pub mod tasks;
pub mod worker;

pub use config::WorkerConfig;
pub use error::TaskError;
pub use runner::TaskRunner;
pub use tasks::{RunnableTask, TaskContext, TaskRegistry};
pub use worker::Worker;
