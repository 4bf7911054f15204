//! Task definitions.
//!
//! A task is either flowable (composes children and is driven by the
//! executor) or runnable (dispatched to a worker). The variant is chosen from
//! the `type` discriminator when the definition is deserialized; any type
//! that is not a built-in flowable is a runnable handled by the worker's task
//! registry.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, CoreResult};
use crate::models::TaskRun;
use crate::retry::RetryPolicy;

pub const SEQUENTIAL: &str = "runway.flow.Sequential";
pub const PARALLEL: &str = "runway.flow.Parallel";
pub const EACH_SEQUENTIAL: &str = "runway.flow.EachSequential";
pub const WORKING_DIRECTORY: &str = "runway.flow.WorkingDirectory";

/// Immutable task node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TaskDefinition", into = "TaskDefinition")]
pub struct Task {
    /// Unique within its sibling scope.
    pub id: String,
    pub description: Option<String>,
    pub retry: Option<RetryPolicy>,
    /// Timeout in seconds for a single attempt.
    pub timeout: Option<u64>,
    /// Disabled tasks are skipped by the resolver.
    pub disabled: bool,
    pub kind: TaskKind,
}

/// Capability set of a task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskKind {
    Sequential(Sequential),
    Parallel(Parallel),
    EachSequential(EachSequential),
    WorkingDirectory(WorkingDirectory),
    Runnable(Runnable),
}

/// Runs children one after the other.
#[derive(Debug, Clone, PartialEq)]
pub struct Sequential {
    pub tasks: Vec<Task>,
    pub errors: Vec<Task>,
}

/// Runs children at the same time, optionally capped by `concurrent`.
#[derive(Debug, Clone, PartialEq)]
pub struct Parallel {
    pub tasks: Vec<Task>,
    pub errors: Vec<Task>,
    /// Zero means unlimited.
    pub concurrent: usize,
}

/// Runs children sequentially once per item of `value`.
#[derive(Debug, Clone, PartialEq)]
pub struct EachSequential {
    /// A JSON array, or a template rendering to one.
    pub value: Value,
    pub tasks: Vec<Task>,
    pub errors: Vec<Task>,
}

/// Runs children on one worker sharing a working directory.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkingDirectory {
    pub tasks: Vec<Task>,
    pub errors: Vec<Task>,
}

/// Task executed by a worker plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct Runnable {
    pub type_name: String,
    pub properties: Map<String, Value>,
}

impl Task {
    /// Shorthand for a runnable task.
    pub fn runnable(id: &str, type_name: &str, properties: Map<String, Value>) -> Self {
        Self::of(
            id,
            TaskKind::Runnable(Runnable {
                type_name: type_name.to_string(),
                properties,
            }),
        )
    }

    pub fn of(id: &str, kind: TaskKind) -> Self {
        Self {
            id: id.to_string(),
            description: None,
            retry: None,
            timeout: None,
            disabled: false,
            kind,
        }
    }

    pub fn type_name(&self) -> &str {
        match &self.kind {
            TaskKind::Sequential(_) => SEQUENTIAL,
            TaskKind::Parallel(_) => PARALLEL,
            TaskKind::EachSequential(_) => EACH_SEQUENTIAL,
            TaskKind::WorkingDirectory(_) => WORKING_DIRECTORY,
            TaskKind::Runnable(r) => &r.type_name,
        }
    }

    pub fn is_flowable(&self) -> bool {
        !matches!(self.kind, TaskKind::Runnable(_))
    }

    /// Runnable tasks and working-directory groups are dispatched to a worker.
    pub fn runs_on_worker(&self) -> bool {
        matches!(
            self.kind,
            TaskKind::Runnable(_) | TaskKind::WorkingDirectory(_)
        )
    }

    /// Static children, empty for runnable tasks.
    pub fn tasks(&self) -> &[Task] {
        match &self.kind {
            TaskKind::Sequential(t) => &t.tasks,
            TaskKind::Parallel(t) => &t.tasks,
            TaskKind::EachSequential(t) => &t.tasks,
            TaskKind::WorkingDirectory(t) => &t.tasks,
            TaskKind::Runnable(_) => &[],
        }
    }

    /// Error-handler children, empty for runnable tasks.
    pub fn errors(&self) -> &[Task] {
        match &self.kind {
            TaskKind::Sequential(t) => &t.errors,
            TaskKind::Parallel(t) => &t.errors,
            TaskKind::EachSequential(t) => &t.errors,
            TaskKind::WorkingDirectory(t) => &t.errors,
            TaskKind::Runnable(_) => &[],
        }
    }

    /// Depth-first lookup through children, then error handlers.
    pub fn find_by_id(&self, id: &str) -> Option<&Task> {
        if self.id == id {
            return Some(self);
        }
        find_in(self.tasks(), id).or_else(|| find_in(self.errors(), id))
    }
}

/// Depth-first lookup over a list of sibling tasks.
pub fn find_in<'a>(tasks: &'a [Task], id: &str) -> Option<&'a Task> {
    tasks.iter().find_map(|t| t.find_by_id(id))
}

static ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_-]*$").expect("literal id pattern"));

/// Reject ids that are empty or contain anything but `[A-Za-z0-9_-]`.
pub fn validate_id(kind: &str, id: &str) -> CoreResult<()> {
    if !ID_PATTERN.is_match(id) {
        return Err(CoreError::Validation(format!(
            "invalid {} id '{}'",
            kind, id
        )));
    }
    Ok(())
}

/// Sibling ids must be unique across both children and error handlers.
pub fn validate_unique_ids(scope: &str, tasks: &[Task], errors: &[Task]) -> CoreResult<()> {
    let mut seen = HashSet::new();
    for task in tasks.iter().chain(errors) {
        if !seen.insert(task.id.as_str()) {
            return Err(CoreError::Validation(format!(
                "duplicate task id '{}' in {}",
                task.id, scope
            )));
        }
    }
    Ok(())
}

/// One child selected for resolution: a task plus the loop value it runs for.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTask {
    pub task: Task,
    pub value: Option<String>,
    pub iteration: Option<u32>,
    pub parent_id: Option<String>,
}

impl ResolvedTask {
    pub fn of(task: &Task, parent: Option<&TaskRun>) -> Self {
        Self {
            task: task.clone(),
            value: None,
            iteration: None,
            parent_id: parent.map(|p| p.id.clone()),
        }
    }

    /// All enabled tasks of a list, in declaration order.
    pub fn of_all(tasks: &[Task], parent: Option<&TaskRun>) -> Vec<Self> {
        tasks
            .iter()
            .filter(|t| !t.disabled)
            .map(|t| Self::of(t, parent))
            .collect()
    }

    /// Whether `task_run` is the run of this resolved task.
    pub fn matches(&self, task_run: &TaskRun) -> bool {
        task_run.task_id == self.task.id
            && task_run.value == self.value
            && task_run.iteration == self.iteration
            && task_run.parent_task_run_id == self.parent_id
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskDefinition {
    id: String,
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    disabled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tasks: Vec<Task>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    errors: Vec<Task>,
    #[serde(flatten)]
    properties: Map<String, Value>,
}

fn check_flowable(
    id: &str,
    type_name: &str,
    tasks: &[Task],
    errors: &[Task],
    properties: &Map<String, Value>,
) -> CoreResult<()> {
    if tasks.is_empty() {
        return Err(CoreError::Validation(format!(
            "flowable task '{}' ({}) has no tasks",
            id, type_name
        )));
    }
    if let Some(key) = properties.keys().next() {
        return Err(CoreError::Validation(format!(
            "unknown property '{}' on task '{}' ({})",
            key, id, type_name
        )));
    }
    validate_unique_ids(&format!("task '{}'", id), tasks, errors)
}

impl TryFrom<TaskDefinition> for Task {
    type Error = CoreError;

    fn try_from(def: TaskDefinition) -> Result<Self, Self::Error> {
        validate_id("task", &def.id)?;
        if let Some(retry) = &def.retry {
            retry.validate()?;
        }

        let TaskDefinition {
            id,
            type_name,
            description,
            retry,
            timeout,
            disabled,
            tasks,
            errors,
            mut properties,
        } = def;

        let kind = match type_name.as_str() {
            SEQUENTIAL => {
                check_flowable(&id, &type_name, &tasks, &errors, &properties)?;
                TaskKind::Sequential(Sequential { tasks, errors })
            }
            PARALLEL => {
                let concurrent = match properties.remove("concurrent") {
                    None => 0,
                    Some(v) => v.as_u64().ok_or_else(|| {
                        CoreError::Validation(format!(
                            "task '{}': concurrent must be a positive integer",
                            id
                        ))
                    })? as usize,
                };
                check_flowable(&id, &type_name, &tasks, &errors, &properties)?;
                TaskKind::Parallel(Parallel {
                    tasks,
                    errors,
                    concurrent,
                })
            }
            EACH_SEQUENTIAL => {
                let value = properties.remove("value").ok_or_else(|| {
                    CoreError::Validation(format!("task '{}' requires a value", id))
                })?;
                if !(value.is_array() || value.is_string()) {
                    return Err(CoreError::Validation(format!(
                        "task '{}': value must be a list or a template",
                        id
                    )));
                }
                check_flowable(&id, &type_name, &tasks, &errors, &properties)?;
                TaskKind::EachSequential(EachSequential {
                    value,
                    tasks,
                    errors,
                })
            }
            WORKING_DIRECTORY => {
                check_flowable(&id, &type_name, &tasks, &errors, &properties)?;
                if let Some(nested) = tasks.iter().find(|t| t.is_flowable()) {
                    return Err(CoreError::Validation(format!(
                        "task '{}' can only contain runnable tasks, found '{}'",
                        id, nested.id
                    )));
                }
                TaskKind::WorkingDirectory(WorkingDirectory { tasks, errors })
            }
            _ => {
                if !tasks.is_empty() || !errors.is_empty() {
                    return Err(CoreError::Validation(format!(
                        "runnable task '{}' ({}) cannot declare children",
                        id, type_name
                    )));
                }
                if type_name.trim().is_empty() {
                    return Err(CoreError::Validation(format!(
                        "task '{}' has an empty type",
                        id
                    )));
                }
                TaskKind::Runnable(Runnable {
                    type_name,
                    properties,
                })
            }
        };

        Ok(Task {
            id,
            description,
            retry,
            timeout,
            disabled,
            kind,
        })
    }
}

impl From<Task> for TaskDefinition {
    fn from(task: Task) -> Self {
        let type_name = task.type_name().to_string();
        let mut properties = Map::new();

        let (tasks, errors) = match task.kind {
            TaskKind::Sequential(t) => (t.tasks, t.errors),
            TaskKind::Parallel(t) => {
                if t.concurrent > 0 {
                    properties.insert("concurrent".to_string(), Value::from(t.concurrent));
                }
                (t.tasks, t.errors)
            }
            TaskKind::EachSequential(t) => {
                properties.insert("value".to_string(), t.value);
                (t.tasks, t.errors)
            }
            TaskKind::WorkingDirectory(t) => (t.tasks, t.errors),
            TaskKind::Runnable(r) => {
                properties = r.properties;
                (Vec::new(), Vec::new())
            }
        };

        TaskDefinition {
            id: task.id,
            type_name,
            description: task.description,
            retry: task.retry,
            timeout: task.timeout,
            disabled: task.disabled,
            tasks,
            errors,
            properties,
        }
    }
}
