//! Run context and template rendering.
//!
//! A [`RunContext`] exposes the variables visible to a task or condition and
//! renders `{{ }}` expressions against them. [`TaskRunContext`] is the
//! serializable implementation that travels inside a `WorkerTask`.

use std::sync::Arc;

use minijinja::{Environment, Error, ErrorKind, Value};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};

use crate::error::{CoreError, CoreResult};
use crate::models::{Execution, Flow, Task, TaskRun};

/// Variables and rendering available while running a task or testing a condition.
pub trait RunContext: Send + Sync {
    /// All variables visible to templates.
    fn variables(&self) -> &Map<String, serde_json::Value>;

    /// Render `template` against [`RunContext::variables`] merged with `extra`.
    fn render_with(
        &self,
        template: &str,
        extra: &Map<String, serde_json::Value>,
    ) -> CoreResult<String>;

    /// Render `template` against [`RunContext::variables`].
    fn render(&self, template: &str) -> CoreResult<String> {
        self.render_with(template, &Map::new())
    }

    /// Id of the flow this context belongs to, as `namespace.id`.
    fn flow_uid(&self) -> Option<String> {
        let flow = self.variables().get("flow")?;
        Some(format!(
            "{}.{}",
            flow.get("namespace")?.as_str()?,
            flow.get("id")?.as_str()?
        ))
    }

    /// Execution id, if the context was built for an execution.
    fn execution_id(&self) -> Option<&str> {
        self.variables().get("execution")?.get("id")?.as_str()
    }
}

/// Jinja-style renderer with the filters used in flow definitions.
#[derive(Debug)]
pub struct TemplateRenderer {
    env: Environment<'static>,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();

        env.add_filter("tojson", filter_tojson);
        env.add_filter("fromjson", filter_fromjson);
        env.add_filter("int", filter_int);
        env.add_filter("string", filter_string);

        Self { env }
    }

    /// Render a template string with the given variables.
    pub fn render(
        &self,
        template: &str,
        variables: &Map<String, serde_json::Value>,
    ) -> CoreResult<String> {
        if !contains_template_syntax(template) {
            return Ok(template.to_string());
        }

        let ctx = Value::from_serialize(variables);
        self.env
            .render_str(template, ctx)
            .map_err(|e| CoreError::Evaluation(format!("unable to render '{}': {}", template, e)))
    }
}

fn contains_template_syntax(s: &str) -> bool {
    (s.contains("{{") && s.contains("}}")) || (s.contains("{%") && s.contains("%}"))
}

fn filter_tojson(value: &Value) -> Result<String, Error> {
    serde_json::to_string(value)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("tojson error: {}", e)))
}

fn filter_fromjson(value: &Value) -> Result<Value, Error> {
    let parsed: serde_json::Value = serde_json::from_str(&value.to_string()).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("fromjson error: {}", e),
        )
    })?;
    Ok(Value::from_serialize(&parsed))
}

fn filter_int(value: &Value) -> Result<i64, Error> {
    if let Some(i) = value.as_i64() {
        return Ok(i);
    }
    let s = value.to_string();
    if let Ok(f) = s.parse::<f64>() {
        return Ok(f as i64);
    }
    s.parse::<i64>()
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("int error: {}", e)))
}

fn filter_string(value: &Value) -> String {
    value.to_string()
}

/// Serializable run context carried by a worker task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRunContext {
    variables: Map<String, serde_json::Value>,

    #[serde(skip)]
    renderer: Arc<TemplateRenderer>,
}

impl PartialEq for TaskRunContext {
    fn eq(&self, other: &Self) -> bool {
        self.variables == other.variables
    }
}

impl TaskRunContext {
    pub fn new(variables: Map<String, serde_json::Value>) -> Self {
        Self {
            variables,
            renderer: Arc::new(TemplateRenderer::new()),
        }
    }

    /// Context of an execution: flow and execution metadata, trigger
    /// variables, and outputs of every task run that produced some.
    pub fn of_execution(flow: &Flow, execution: &Execution) -> Self {
        let mut variables = execution.variables.clone();

        variables.insert(
            "flow".to_string(),
            json!({
                "id": flow.id,
                "namespace": flow.namespace,
                "revision": flow.revision,
            }),
        );
        variables.insert(
            "execution".to_string(),
            json!({
                "id": execution.id,
                "startDate": execution.state.start_date(),
            }),
        );
        variables.insert("outputs".to_string(), collect_outputs(execution));

        Self::new(variables)
    }

    /// Execution context narrowed to one task run.
    pub fn of_task_run(flow: &Flow, execution: &Execution, task: &Task, task_run: &TaskRun) -> Self {
        Self::of_execution(flow, execution).for_task_run(task, task_run)
    }

    /// Copy of this context with `task` and `taskrun` variables set.
    pub fn for_task_run(&self, task: &Task, task_run: &TaskRun) -> Self {
        let mut variables = self.variables.clone();
        variables.insert(
            "task".to_string(),
            json!({
                "id": task.id,
                "type": task.type_name(),
            }),
        );
        variables.insert(
            "taskrun".to_string(),
            json!({
                "id": task_run.id,
                "value": task_run.value,
                "parentId": task_run.parent_task_run_id,
                "attemptsCount": task_run.attempts.len(),
            }),
        );
        Self {
            variables,
            renderer: self.renderer.clone(),
        }
    }

    /// Copy of this context with one more top-level variable.
    pub fn with_variable(&self, key: &str, value: serde_json::Value) -> Self {
        let mut variables = self.variables.clone();
        variables.insert(key.to_string(), value);
        Self {
            variables,
            renderer: self.renderer.clone(),
        }
    }
}

impl RunContext for TaskRunContext {
    fn variables(&self) -> &Map<String, serde_json::Value> {
        &self.variables
    }

    fn render_with(
        &self,
        template: &str,
        extra: &Map<String, serde_json::Value>,
    ) -> CoreResult<String> {
        if extra.is_empty() {
            return self.renderer.render(template, &self.variables);
        }
        let mut variables = self.variables.clone();
        for (k, v) in extra {
            variables.insert(k.clone(), v.clone());
        }
        self.renderer.render(template, &variables)
    }
}

/// `outputs.<taskId>` for plain runs, `outputs.<taskId>.<value>` for loop iterations.
fn collect_outputs(execution: &Execution) -> serde_json::Value {
    let mut outputs = Map::new();
    for task_run in &execution.task_run_list {
        let Some(task_outputs) = &task_run.outputs else {
            continue;
        };
        let task_outputs = serde_json::Value::Object(task_outputs.clone());
        match &task_run.value {
            None => {
                outputs.insert(task_run.task_id.clone(), task_outputs);
            }
            Some(value) => {
                let entry = outputs
                    .entry(task_run.task_id.clone())
                    .or_insert_with(|| serde_json::Value::Object(Map::new()));
                if let serde_json::Value::Object(per_value) = entry {
                    per_value.insert(value.clone(), task_outputs);
                }
            }
        }
    }
    serde_json::Value::Object(outputs)
}
