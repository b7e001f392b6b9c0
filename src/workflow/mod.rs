//! Rules and workflows driven by broker events.
//!
//! Rules subscribe to event types and run actions when their condition
//! holds. Workflows are named lists of tasks executed through a shared
//! queue by a polling processor.

pub mod condition;
pub mod engine;
pub mod rule;
pub mod task;

pub use condition::{CompareOp, Condition, event_view};
pub use engine::{
    TASK_COMPLETED, TASK_FAILED, TASK_READY, TASK_RETRY, WORKFLOW_CANCELLED, WORKFLOW_COMPLETED,
    WORKFLOW_COMPONENT, WORKFLOW_FAILED, WORKFLOW_STARTED, WorkflowEngine,
};
pub use rule::{RuleAction, RuleCallback, RuleCondition, RuleEvaluation, WorkflowRule, callback};
pub use task::{
    TaskHandler, TaskKind, TaskStatus, WorkflowInstance, WorkflowStatus, WorkflowTask,
    task_handler,
};
