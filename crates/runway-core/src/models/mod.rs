//! Workflow data model.

pub mod condition;
pub mod execution;
pub mod flow;
pub mod service;
pub mod state;
pub mod task;
pub mod trigger;
pub mod worker;

pub use condition::{Condition, ConditionContext, DayInMonth, DayOfWeek, MultipleCondition};
pub use execution::{Execution, ExecutionFailure, TaskRun, TaskRunAttempt};
pub use flow::{keep_last_version, keep_last_version_of, Flow};
pub use service::{
    LivenessConfig, ServerInfo, ServiceEvent, ServiceInstance, ServiceState, ServiceType,
};
pub use state::{History, State, StateType};
pub use task::{ResolvedTask, Task, TaskKind};
pub use trigger::{Backfill, FlowTrigger, Schedule, Trigger, TriggerContext};
pub use worker::{WorkerTask, WorkerTaskResult};

/// New random identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
