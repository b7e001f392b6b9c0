//! Workflow instances and the tasks they are made of.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Handler for `custom` tasks, registered by name on the engine. The value
/// it returns is published with `workflow.task.completed`.
pub type TaskHandler =
    Arc<dyn Fn(WorkflowTask) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

pub fn task_handler<F, Fut>(f: F) -> TaskHandler
where
    F: Fn(WorkflowTask) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |task| Box::pin(f(task)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Handed to an external executor through `workflow.task.ready`.
    Container,
    /// Built-in `delay`, `log` and `emit` actions.
    System,
    /// Runs the handler named by `parameters.handler`.
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTask {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    #[serde(default)]
    pub target: String,
    pub action: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub priority: i32,
    /// Milliseconds.
    #[serde(default, rename = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry_count: u32,
    /// Milliseconds.
    #[serde(default, rename = "retryDelay")]
    pub retry_delay_ms: u64,
    #[serde(default = "pending")]
    pub status: TaskStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn pending() -> TaskStatus {
    TaskStatus::Pending
}

impl WorkflowTask {
    fn new(id: impl Into<String>, kind: TaskKind, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            target: String::new(),
            action: action.into(),
            parameters: Map::new(),
            priority: 0,
            timeout_ms: None,
            retry_count: 0,
            retry_delay_ms: 0,
            status: TaskStatus::Pending,
            attempts: 0,
            error: None,
        }
    }

    pub fn container(
        id: impl Into<String>,
        target: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        let mut task = Self::new(id, TaskKind::Container, action);
        task.target = target.into();
        task
    }

    pub fn system(id: impl Into<String>, action: impl Into<String>) -> Self {
        Self::new(id, TaskKind::System, action)
    }

    pub fn custom(id: impl Into<String>, handler: impl Into<String>) -> Self {
        Self::new(id, TaskKind::Custom, "custom")
            .with_parameter("handler", Value::String(handler.into()))
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_retries(mut self, retry_count: u32, retry_delay: Duration) -> Self {
        self.retry_count = retry_count;
        self.retry_delay_ms = retry_delay.as_millis() as u64;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub(crate) fn parameter_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstance {
    pub id: String,
    pub name: String,
    pub status: WorkflowStatus,
    pub tasks: Vec<WorkflowTask>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowInstance {
    pub(crate) fn new(name: &str, tasks: Vec<WorkflowTask>) -> Self {
        Self {
            id: format!("wf-{}", uuid::Uuid::new_v4().simple()),
            name: name.to_string(),
            status: WorkflowStatus::Pending,
            tasks,
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
            error: None,
        }
    }

    pub fn task(&self, id: &str) -> Option<&WorkflowTask> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub(crate) fn task_mut(&mut self, id: &str) -> Option<&mut WorkflowTask> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// First failed task wins; otherwise completed once every task is.
    pub(crate) fn settled(&self) -> Option<(WorkflowStatus, Option<String>)> {
        if let Some(failed) = self
            .tasks
            .iter()
            .find(|t| t.status == TaskStatus::Failed)
        {
            let reason = failed.error.as_deref().unwrap_or("unknown error");
            return Some((
                WorkflowStatus::Failed,
                Some(format!("task '{}' failed: {reason}", failed.id)),
            ));
        }
        self.tasks
            .iter()
            .all(|t| t.status == TaskStatus::Completed)
            .then_some((WorkflowStatus::Completed, None))
    }

    pub(crate) fn finish(&mut self, status: WorkflowStatus, error: Option<String>) {
        self.status = status;
        self.end_time = Some(Utc::now());
        self.error = error;
    }
}
