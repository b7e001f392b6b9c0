//! Rules: event types to listen on, an optional condition, and the actions
//! to run when it holds.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;

use super::condition::Condition;

/// Async condition over the event view.
pub type Predicate = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

/// Callback over the event view, used by `then` and custom actions.
pub type RuleCallback = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub fn callback<F, Fut>(f: F) -> RuleCallback
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |view| Box::pin(f(view)))
}

#[derive(Clone)]
pub enum RuleCondition {
    Expression(Condition),
    Predicate(Predicate),
}

#[derive(Clone)]
pub enum RuleAction {
    /// Publish a derived event. The payload gains `triggeredBy` with the id
    /// of the triggering message.
    Emit { event_type: String, payload: Value },
    Delay(Duration),
    Custom(RuleCallback),
    StartWorkflow { workflow_id: String },
    CancelWorkflow {
        workflow_id: String,
        reason: Option<String>,
    },
}

impl RuleAction {
    pub fn emit(event_type: impl Into<String>, payload: Value) -> Self {
        RuleAction::Emit {
            event_type: event_type.into(),
            payload,
        }
    }

    pub fn custom<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        RuleAction::Custom(callback(f))
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            RuleAction::Emit { .. } => "emit",
            RuleAction::Delay(_) => "delay",
            RuleAction::Custom(_) => "custom",
            RuleAction::StartWorkflow { .. } => "start",
            RuleAction::CancelWorkflow { .. } => "stop",
        }
    }
}

impl fmt::Debug for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleAction::Emit { event_type, .. } => write!(f, "Emit({event_type})"),
            RuleAction::Delay(d) => write!(f, "Delay({d:?})"),
            RuleAction::Custom(_) => f.write_str("Custom"),
            RuleAction::StartWorkflow { workflow_id } => write!(f, "StartWorkflow({workflow_id})"),
            RuleAction::CancelWorkflow { workflow_id, .. } => {
                write!(f, "CancelWorkflow({workflow_id})")
            }
        }
    }
}

impl fmt::Debug for RuleCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleCondition::Expression(c) => f.debug_tuple("Expression").field(c).finish(),
            RuleCondition::Predicate(_) => f.write_str("Predicate"),
        }
    }
}

#[derive(Clone)]
pub struct WorkflowRule {
    pub id: String,
    pub when_event_types: Vec<String>,
    pub condition: Option<RuleCondition>,
    pub then: Option<RuleCallback>,
    pub actions: Vec<RuleAction>,
    pub priority: i32,
    pub enabled: bool,
}

impl WorkflowRule {
    pub fn new<I, S>(id: impl Into<String>, when_event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            when_event_types: when_event_types.into_iter().map(Into::into).collect(),
            condition: None,
            then: None,
            actions: Vec::new(),
            priority: 0,
            enabled: true,
        }
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(RuleCondition::Expression(condition));
        self
    }

    pub fn when_async<F, Fut>(mut self, predicate: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        self.condition = Some(RuleCondition::Predicate(Arc::new(move |view| {
            Box::pin(predicate(view))
        })));
        self
    }

    pub fn then<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.then = Some(callback(f));
        self
    }

    pub fn action(mut self, action: RuleAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

impl fmt::Debug for WorkflowRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRule")
            .field("id", &self.id)
            .field("when_event_types", &self.when_event_types)
            .field("condition", &self.condition)
            .field("then", &self.then.is_some())
            .field("actions", &self.actions)
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// One entry in the engine's bounded evaluation log.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleEvaluation {
    pub rule_id: String,
    pub event_type: String,
    pub message_id: String,
    pub condition_met: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
