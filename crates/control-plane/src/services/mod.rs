//! Long-running components of the control plane.
//!
//! Each runner owns its subscriptions and loops; all of them are spawned on
//! the shared [`crate::queue::PollerPool`] and stop when it shuts down.

pub mod executor;
pub mod flow_loader;
pub mod flow_trigger;
pub mod liveness;
pub mod scheduler;

pub use executor::{ExecutorMessage, ExecutorRunner};
pub use flow_loader::FlowLoader;
pub use flow_trigger::FlowTriggerRunner;
pub use liveness::LivenessService;
pub use scheduler::Scheduler;
