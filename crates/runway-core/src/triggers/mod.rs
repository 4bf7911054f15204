//! Trigger evaluation: cron schedules and flow triggers.

pub mod flow;
pub mod multiple;
pub mod schedule;

pub use flow::{flow_trigger_executions, multiple_flow_to_delete, multiple_flow_trigger};
pub use multiple::{window_uid, MultipleConditionWindow};
pub use schedule::{parse_cron, ScheduleTolerance};
