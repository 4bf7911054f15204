//! Runnable task plugins and their registry.

mod debug;

pub use debug::{Fail, Log, Return};

use async_trait::async_trait;
use runway_core::run_context::{RunContext, TaskRunContext};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::TaskError;

/// What a task sees while it runs.
pub struct TaskContext<'a> {
    /// Variables of the execution narrowed to this task run.
    pub run_context: &'a TaskRunContext,

    /// Properties declared on the task.
    pub properties: &'a Map<String, Value>,

    /// Directory shared with sibling tasks of a working-directory group.
    pub working_dir: Option<&'a Path>,
}

impl TaskContext<'_> {
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// Render a property as a template. Non-string values render as JSON.
    pub fn render_property(&self, name: &str) -> Result<Option<String>, TaskError> {
        match self.properties.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(template)) => Ok(Some(self.run_context.render(template)?)),
            Some(other) => Ok(Some(other.to_string())),
        }
    }

    /// Like [`TaskContext::render_property`] but the property is mandatory.
    pub fn require_property(&self, name: &str) -> Result<String, TaskError> {
        self.render_property(name)?
            .ok_or_else(|| TaskError::InvalidConfig(format!("missing property '{}'", name)))
    }
}

/// A task type a worker can run.
#[async_trait]
pub trait RunnableTask: Send + Sync {
    /// Type tag used in flow definitions, e.g. `runway.debug.Return`.
    fn type_name(&self) -> &'static str;

    /// Run one attempt and return the outputs.
    async fn run(&self, ctx: &TaskContext<'_>) -> Result<Map<String, Value>, TaskError>;
}

/// Registry of runnable task types.
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<dyn RunnableTask>>,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }

    /// Registry with the built-in debug tasks.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Return);
        registry.register(Log);
        registry.register(Fail);
        registry
    }

    /// Register a task type. A later registration of the same type wins.
    pub fn register<T: RunnableTask + 'static>(&mut self, task: T) {
        self.tasks
            .insert(task.type_name().to_string(), Arc::new(task));
    }

    pub fn get(&self, type_name: &str) -> Option<Arc<dyn RunnableTask>> {
        self.tasks.get(type_name).cloned()
    }

    pub fn has(&self, type_name: &str) -> bool {
        self.tasks.contains_key(type_name)
    }

    /// Registered type names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Run the task registered under `type_name`.
    pub async fn run(
        &self,
        type_name: &str,
        ctx: &TaskContext<'_>,
    ) -> Result<Map<String, Value>, TaskError> {
        let task = self
            .get(type_name)
            .ok_or_else(|| TaskError::NotFound(type_name.to_string()))?;
        task.run(ctx).await
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.list())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl RunnableTask for Echo {
        fn type_name(&self) -> &'static str {
            "test.Echo"
        }

        async fn run(&self, ctx: &TaskContext<'_>) -> Result<Map<String, Value>, TaskError> {
            Ok(ctx.properties.clone())
        }
    }

    fn context_vars() -> TaskRunContext {
        let mut variables = Map::new();
        variables.insert("flow".to_string(), json!({"id": "hello", "namespace": "io.runway"}));
        TaskRunContext::new(variables)
    }

    #[test]
    fn test_registry_defaults() {
        let registry = TaskRegistry::with_defaults();
        assert_eq!(
            registry.list(),
            vec!["runway.debug.Fail", "runway.debug.Log", "runway.debug.Return"]
        );
        assert!(registry.has("runway.debug.Return"));
        assert!(!registry.has("test.Echo"));
    }

    #[tokio::test]
    async fn test_registry_runs_registered_task() {
        let mut registry = TaskRegistry::new();
        registry.register(Echo);

        let run_context = context_vars();
        let properties = json!({"a": 1}).as_object().cloned().unwrap();
        let ctx = TaskContext {
            run_context: &run_context,
            properties: &properties,
            working_dir: None,
        };
        let outputs = registry.run("test.Echo", &ctx).await.unwrap();
        assert_eq!(outputs["a"], 1);

        let missing = registry.run("test.Missing", &ctx).await;
        assert!(matches!(missing, Err(TaskError::NotFound(t)) if t == "test.Missing"));
    }

    #[test]
    fn test_render_property() {
        let run_context = context_vars();
        let properties = json!({"name": "{{ flow.namespace }}.{{ flow.id }}", "count": 3})
            .as_object()
            .cloned()
            .unwrap();
        let ctx = TaskContext {
            run_context: &run_context,
            properties: &properties,
            working_dir: None,
        };

        assert_eq!(
            ctx.render_property("name").unwrap().as_deref(),
            Some("io.runway.hello")
        );
        assert_eq!(ctx.render_property("count").unwrap().as_deref(), Some("3"));
        assert!(ctx.render_property("absent").unwrap().is_none());
        assert!(matches!(
            ctx.require_property("absent"),
            Err(TaskError::InvalidConfig(_))
        ));
    }
}
