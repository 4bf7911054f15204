//! Debug tasks: return a rendered value, log messages, fail on purpose.

use async_trait::async_trait;
use runway_core::run_context::RunContext;
use serde_json::{Map, Value};

use super::{RunnableTask, TaskContext};
use crate::error::TaskError;

/// `runway.debug.Return`: renders `format` into the `value` output.
pub struct Return;

#[async_trait]
impl RunnableTask for Return {
    fn type_name(&self) -> &'static str {
        "runway.debug.Return"
    }

    async fn run(&self, ctx: &TaskContext<'_>) -> Result<Map<String, Value>, TaskError> {
        let value = ctx.require_property("format")?;
        let mut outputs = Map::new();
        outputs.insert("value".to_string(), Value::String(value));
        Ok(outputs)
    }
}

/// `runway.debug.Log`: logs `message` (a template or a list of templates)
/// at `level` (default `INFO`).
pub struct Log;

#[async_trait]
impl RunnableTask for Log {
    fn type_name(&self) -> &'static str {
        "runway.debug.Log"
    }

    async fn run(&self, ctx: &TaskContext<'_>) -> Result<Map<String, Value>, TaskError> {
        let level = match ctx.property("level") {
            None => "INFO".to_string(),
            Some(Value::String(level)) => level.to_uppercase(),
            Some(other) => {
                return Err(TaskError::InvalidConfig(format!(
                    "level must be a string, got {}",
                    other
                )))
            }
        };

        let templates: Vec<&str> = match ctx.property("message") {
            Some(Value::String(message)) => vec![message.as_str()],
            Some(Value::Array(messages)) => messages
                .iter()
                .map(|m| {
                    m.as_str().ok_or_else(|| {
                        TaskError::InvalidConfig("message list must contain strings".to_string())
                    })
                })
                .collect::<Result<_, _>>()?,
            _ => {
                return Err(TaskError::InvalidConfig(
                    "missing property 'message'".to_string(),
                ))
            }
        };

        let execution_id = ctx.run_context.execution_id().unwrap_or_default();
        for template in templates {
            let message = ctx.run_context.render(template)?;
            match level.as_str() {
                "TRACE" => tracing::trace!(execution_id, "{}", message),
                "DEBUG" => tracing::debug!(execution_id, "{}", message),
                "INFO" => tracing::info!(execution_id, "{}", message),
                "WARN" | "WARNING" => tracing::warn!(execution_id, "{}", message),
                "ERROR" => tracing::error!(execution_id, "{}", message),
                other => {
                    return Err(TaskError::InvalidConfig(format!(
                        "unknown log level '{}'",
                        other
                    )))
                }
            }
        }

        Ok(Map::new())
    }
}

/// `runway.debug.Fail`: always fails with the rendered `message`.
pub struct Fail;

#[async_trait]
impl RunnableTask for Fail {
    fn type_name(&self) -> &'static str {
        "runway.debug.Fail"
    }

    async fn run(&self, ctx: &TaskContext<'_>) -> Result<Map<String, Value>, TaskError> {
        let message = ctx
            .render_property("message")?
            .unwrap_or_else(|| "Task failure".to_string());
        Err(TaskError::Failed(message))
    }
}
