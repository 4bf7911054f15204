//! Execution engine: next-task resolution and the executor merge step.

pub mod executor;
pub mod flowable;
pub mod resolver;
pub mod service;

pub use executor::{merge_execution, Executor, ExecutorSnapshot};
pub use flowable::FlowableTask;
pub use service::{ExecutorService, DEFAULT_MAX_PASSES};
