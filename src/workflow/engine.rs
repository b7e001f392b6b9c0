//! Workflow engine
//!
//! The engine reacts to broker events through rules and drives workflow
//! instances through a shared FIFO task queue.
//!
//! Concurrency and usage notes:
//! - `WorkflowEngine` is a cheap cloneable handle. Broker subscriptions and
//!   the processing loop only hold a `Weak` reference to the shared state.
//! - Rules, instances, the queue and the evaluation log each have their own
//!   lock, never held across an await.
//! - The processing loop polls on a fixed interval and dequeues at most one
//!   task per tick. Each dequeued task runs on its own tokio task.
//! - Cancellation is cooperative: a task already running is not interrupted,
//!   its instance just stops scheduling further tasks.
//! - Settling scans every running instance after each task completion or
//!   failure, so its cost is O(instances x tasks) per event.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::condition::event_view;
use super::rule::{RuleAction, RuleCondition, RuleEvaluation, WorkflowRule};
use super::task::{
    TaskHandler, TaskKind, TaskStatus, WorkflowInstance, WorkflowStatus, WorkflowTask,
    task_handler,
};
use crate::broker::message::into_object;
use crate::broker::{Broker, Message, MessageSource, PublishOptions, SubscribeOptions, SubscriptionId};
use crate::config::WorkflowSettings;
use crate::utils::error::{WorkflowError, WorkflowResult};

/// Component name used as the source of engine-generated messages.
pub const WORKFLOW_COMPONENT: &str = "workflow-engine";

pub const WORKFLOW_STARTED: &str = "workflow.started";
pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
pub const WORKFLOW_FAILED: &str = "workflow.failed";
pub const WORKFLOW_CANCELLED: &str = "workflow.cancelled";
pub const TASK_READY: &str = "workflow.task.ready";
pub const TASK_COMPLETED: &str = "workflow.task.completed";
pub const TASK_FAILED: &str = "workflow.task.failed";
pub const TASK_RETRY: &str = "workflow.task.retry";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct RegisteredRule {
    enabled: Arc<AtomicBool>,
    subscriptions: Vec<SubscriptionId>,
}

#[derive(Debug)]
struct QueuedTask {
    workflow_id: String,
    task_id: String,
}

struct Processor {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

enum FailureOutcome {
    Retry { retries_left: u32, delay: Duration },
    Failed,
}

struct Inner {
    broker: Arc<Broker>,
    settings: WorkflowSettings,
    source: MessageSource,
    rules: Mutex<HashMap<String, RegisteredRule>>,
    evaluations: Mutex<VecDeque<RuleEvaluation>>,
    instances: Mutex<HashMap<String, WorkflowInstance>>,
    queue: Mutex<VecDeque<QueuedTask>>,
    task_handlers: RwLock<HashMap<String, TaskHandler>>,
    processor: Mutex<Option<Processor>>,
}

#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<Inner>,
}

impl WorkflowEngine {
    pub fn new(broker: Arc<Broker>, settings: WorkflowSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                broker,
                settings,
                source: MessageSource::new(WORKFLOW_COMPONENT),
                rules: Mutex::new(HashMap::new()),
                evaluations: Mutex::new(VecDeque::new()),
                instances: Mutex::new(HashMap::new()),
                queue: Mutex::new(VecDeque::new()),
                task_handlers: RwLock::new(HashMap::new()),
                processor: Mutex::new(None),
            }),
        }
    }

    /// Attach `rule` with one broker subscription per event type. A rule
    /// with the same id is replaced.
    pub fn add_rule(&self, rule: WorkflowRule) -> WorkflowResult<()> {
        let rule = Arc::new(rule);
        let enabled = Arc::new(AtomicBool::new(rule.enabled));
        let mut subscriptions = Vec::with_capacity(rule.when_event_types.len());

        for event_type in &rule.when_event_types {
            let weak = Arc::downgrade(&self.inner);
            let rule_ref = Arc::clone(&rule);
            let enabled_ref = Arc::clone(&enabled);
            let subscribed = self.inner.broker.subscribe(
                event_type,
                move |message: Message| {
                    let weak = weak.clone();
                    let rule = Arc::clone(&rule_ref);
                    let enabled = Arc::clone(&enabled_ref);
                    async move {
                        if !enabled.load(Ordering::Acquire) {
                            return Ok(());
                        }
                        if let Some(inner) = weak.upgrade() {
                            inner.evaluate(&rule, message).await;
                        }
                        Ok(())
                    }
                },
                SubscribeOptions::default().with_priority(rule.priority),
            );

            match subscribed {
                Ok(id) => subscriptions.push(id),
                Err(e) => {
                    for id in &subscriptions {
                        self.inner.broker.unsubscribe(id);
                    }
                    return Err(e.into());
                }
            }
        }

        tracing::info!(
            rule_id = %rule.id,
            event_types = ?rule.when_event_types,
            priority = rule.priority,
            "rule added"
        );
        let previous = lock(&self.inner.rules).insert(
            rule.id.clone(),
            RegisteredRule {
                enabled,
                subscriptions,
            },
        );
        if let Some(previous) = previous {
            self.inner.detach(&previous);
        }
        Ok(())
    }

    /// Detach exactly the subscriptions created for rule `id`.
    pub fn remove_rule(&self, id: &str) -> bool {
        let removed = lock(&self.inner.rules).remove(id);
        match removed {
            Some(registered) => {
                self.inner.detach(&registered);
                tracing::info!(rule_id = id, "rule removed");
                true
            }
            None => false,
        }
    }

    pub fn set_rule_enabled(&self, id: &str, enabled: bool) -> bool {
        match lock(&self.inner.rules).get(id) {
            Some(registered) => {
                registered.enabled.store(enabled, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn rule_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.inner.rules).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Most recent rule evaluations, oldest first.
    pub fn evaluations(&self) -> Vec<RuleEvaluation> {
        lock(&self.inner.evaluations).iter().cloned().collect()
    }

    /// Make `f` available to custom tasks whose `parameters.handler` is `name`.
    pub fn register_task_handler<F, Fut>(&self, name: &str, f: F)
    where
        F: Fn(WorkflowTask) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.inner
            .task_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), task_handler(f));
    }

    /// Allocate a pending instance and return its id.
    pub fn create_workflow(&self, name: &str, tasks: Vec<WorkflowTask>) -> String {
        let instance = WorkflowInstance::new(name, tasks);
        let id = instance.id.clone();
        tracing::debug!(workflow_id = %id, name, tasks = instance.tasks.len(), "workflow created");
        lock(&self.inner.instances).insert(id.clone(), instance);
        id
    }

    pub async fn start_workflow(&self, id: &str) -> WorkflowResult<()> {
        self.inner.start_workflow(id).await
    }

    /// Move the instance to `cancelled` whatever its current status.
    pub async fn cancel_workflow(&self, id: &str, reason: Option<&str>) -> WorkflowResult<()> {
        self.inner.cancel_workflow(id, reason).await
    }

    pub fn get_workflow(&self, id: &str) -> Option<WorkflowInstance> {
        lock(&self.inner.instances).get(id).cloned()
    }

    /// Every instance, oldest first.
    pub fn list_workflows(&self) -> Vec<WorkflowInstance> {
        let mut instances: Vec<WorkflowInstance> =
            lock(&self.inner.instances).values().cloned().collect();
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        instances
    }

    /// Tasks waiting for the processor, across all workflows.
    pub fn queued_tasks(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    /// Stop the processing loop and detach every rule.
    pub async fn shutdown(&self) {
        let processor = lock(&self.inner.processor).take();
        if let Some(Processor { shutdown, handle }) = processor {
            let _ = shutdown.send(true);
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "task processor ended abnormally");
            }
        }

        let rules: Vec<RegisteredRule> = lock(&self.inner.rules)
            .drain()
            .map(|(_, registered)| registered)
            .collect();
        for registered in &rules {
            self.inner.detach(registered);
        }
        tracing::info!(rules = rules.len(), "workflow engine shut down");
    }
}

impl Inner {
    fn detach(&self, registered: &RegisteredRule) {
        for id in &registered.subscriptions {
            self.broker.unsubscribe(id);
        }
    }

    fn source_for(&self, workflow_id: &str) -> MessageSource {
        self.source.clone().with_workflow(workflow_id)
    }

    /// Publish an engine event. Failures are logged and otherwise ignored.
    async fn emit(&self, event_type: &str, payload: Value, workflow_id: &str) {
        if let Err(e) = self
            .broker
            .publish(event_type, payload, self.source_for(workflow_id))
            .await
        {
            tracing::warn!(event_type, workflow_id, error = %e, "failed to publish workflow event");
        }
    }

    async fn evaluate(self: &Arc<Self>, rule: &WorkflowRule, message: Message) {
        let view = event_view(&message);
        let started_at = Utc::now();

        let condition = match &rule.condition {
            None => Ok(true),
            Some(RuleCondition::Expression(condition)) => Ok(condition.evaluate(&view)),
            Some(RuleCondition::Predicate(predicate)) => predicate(view.clone()).await,
        };
        let (condition_met, outcome) = match condition {
            Ok(true) => (true, self.run_actions(rule, &message, &view).await),
            Ok(false) => (false, Ok(())),
            Err(e) => (false, Err(e)),
        };

        let error = outcome.err().map(|e| format!("{e:#}"));
        match &error {
            Some(error) => tracing::warn!(
                rule_id = %rule.id,
                event_type = %message.message_type,
                error = %error,
                "rule evaluation failed"
            ),
            None => tracing::debug!(
                rule_id = %rule.id,
                event_type = %message.message_type,
                condition_met,
                "rule evaluated"
            ),
        }

        self.record_evaluation(RuleEvaluation {
            rule_id: rule.id.clone(),
            event_type: message.message_type.clone(),
            message_id: message.id.clone(),
            condition_met,
            started_at,
            finished_at: Utc::now(),
            success: error.is_none(),
            error,
        });
    }

    async fn run_actions(
        self: &Arc<Self>,
        rule: &WorkflowRule,
        message: &Message,
        view: &Value,
    ) -> anyhow::Result<()> {
        if let Some(then) = &rule.then {
            then(view.clone()).await?;
        }

        for action in &rule.actions {
            tracing::trace!(rule_id = %rule.id, action = action.kind(), "running rule action");
            match action {
                RuleAction::Emit {
                    event_type,
                    payload,
                } => {
                    let mut payload = into_object(payload.clone());
                    payload.insert("triggeredBy".to_string(), Value::String(message.id.clone()));
                    let options = PublishOptions {
                        parent_id: Some(message.id.clone()),
                        ..PublishOptions::default()
                    };
                    self.broker
                        .publish_with(
                            event_type,
                            Value::Object(payload),
                            self.source.clone(),
                            options,
                        )
                        .await?;
                }
                RuleAction::Delay(duration) => tokio::time::sleep(*duration).await,
                RuleAction::Custom(callback) => callback(view.clone()).await?,
                RuleAction::StartWorkflow { workflow_id } => {
                    self.start_workflow(workflow_id).await?
                }
                RuleAction::CancelWorkflow {
                    workflow_id,
                    reason,
                } => self.cancel_workflow(workflow_id, reason.as_deref()).await?,
            }
        }
        Ok(())
    }

    fn record_evaluation(&self, evaluation: RuleEvaluation) {
        let limit = self.settings.max_evaluations;
        let mut evaluations = lock(&self.evaluations);
        evaluations.push_back(evaluation);
        while evaluations.len() > limit {
            evaluations.pop_front();
        }
    }

    async fn start_workflow(self: &Arc<Self>, id: &str) -> WorkflowResult<()> {
        let (name, task_ids) = {
            let mut instances = lock(&self.instances);
            let instance = instances
                .get_mut(id)
                .ok_or_else(|| WorkflowError::NotFound(id.to_string()))?;
            if instance.status != WorkflowStatus::Pending {
                return Err(WorkflowError::InvalidState {
                    id: id.to_string(),
                    status: instance.status.to_string(),
                });
            }

            instance.status = WorkflowStatus::Running;
            instance.start_time = Some(Utc::now());
            for task in &mut instance.tasks {
                task.id = format!("{id}_{}", task.id);
                task.status = TaskStatus::Pending;
            }
            let task_ids: Vec<String> = instance.tasks.iter().map(|t| t.id.clone()).collect();
            (instance.name.clone(), task_ids)
        };

        lock(&self.queue).extend(task_ids.iter().map(|task_id| QueuedTask {
            workflow_id: id.to_string(),
            task_id: task_id.clone(),
        }));

        tracing::info!(workflow_id = id, name = %name, tasks = task_ids.len(), "workflow started");
        self.emit(
            WORKFLOW_STARTED,
            json!({ "workflowId": id, "name": name, "taskCount": task_ids.len() }),
            id,
        )
        .await;

        self.ensure_processor();
        // an instance without tasks completes right away
        self.settle().await;
        Ok(())
    }

    async fn cancel_workflow(&self, id: &str, reason: Option<&str>) -> WorkflowResult<()> {
        let previous = {
            let mut instances = lock(&self.instances);
            let instance = instances
                .get_mut(id)
                .ok_or_else(|| WorkflowError::NotFound(id.to_string()))?;
            let previous = instance.status;
            instance.finish(WorkflowStatus::Cancelled, reason.map(str::to_string));
            previous
        };
        lock(&self.queue).retain(|queued| queued.workflow_id != id);

        tracing::info!(workflow_id = id, previous = %previous, reason, "workflow cancelled");
        self.emit(
            WORKFLOW_CANCELLED,
            json!({ "workflowId": id, "previousStatus": previous, "reason": reason }),
            id,
        )
        .await;
        Ok(())
    }

    fn ensure_processor(self: &Arc<Self>) {
        let mut processor = lock(&self.processor);
        if processor
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
        {
            return;
        }

        let (shutdown, rx) = watch::channel(false);
        let interval = self
            .settings
            .poll_interval()
            .max(Duration::from_millis(1));
        let handle = tokio::spawn(run_processor(Arc::downgrade(self), interval, rx));
        *processor = Some(Processor { shutdown, handle });
        tracing::debug!(?interval, "task processor started");
    }

    /// Dequeue one task and run it on its own tokio task. Tasks of instances
    /// that are no longer running are dropped.
    fn process_next(self: &Arc<Self>) {
        let Some(queued) = lock(&self.queue).pop_front() else {
            return;
        };

        let task = {
            let mut instances = lock(&self.instances);
            let Some(instance) = instances.get_mut(&queued.workflow_id) else {
                return;
            };
            if instance.status != WorkflowStatus::Running {
                tracing::debug!(
                    workflow_id = %queued.workflow_id,
                    task_id = %queued.task_id,
                    status = %instance.status,
                    "skipping task of inactive workflow"
                );
                return;
            }
            let Some(task) = instance.task_mut(&queued.task_id) else {
                return;
            };
            task.status = TaskStatus::Processing;
            task.attempts += 1;
            task.clone()
        };

        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.execute_task(queued.workflow_id, task).await });
    }

    async fn execute_task(self: Arc<Self>, workflow_id: String, task: WorkflowTask) {
        tracing::debug!(
            workflow_id = %workflow_id,
            task_id = %task.id,
            kind = ?task.kind,
            attempt = task.attempts,
            "executing task"
        );

        let run = self.run_task(&workflow_id, &task);
        let outcome = match task.timeout() {
            Some(limit) => tokio::time::timeout(limit, run).await.unwrap_or_else(|_| {
                Err(anyhow!("task timed out after {} ms", limit.as_millis()))
            }),
            None => run.await,
        };

        match outcome {
            Ok(result) => self.complete_task(&workflow_id, &task.id, result).await,
            Err(e) => {
                self.fail_task(&workflow_id, &task.id, format!("{e:#}"))
                    .await
            }
        }
    }

    async fn run_task(&self, workflow_id: &str, task: &WorkflowTask) -> anyhow::Result<Value> {
        match task.kind {
            TaskKind::Container => {
                self.broker
                    .publish(
                        TASK_READY,
                        json!({
                            "workflowId": workflow_id,
                            "taskId": task.id,
                            "target": task.target,
                            "action": task.action,
                            "parameters": task.parameters,
                            "priority": task.priority,
                        }),
                        self.source_for(workflow_id),
                    )
                    .await?;
                Ok(Value::Null)
            }
            TaskKind::System => self.run_system_task(workflow_id, task).await,
            TaskKind::Custom => {
                let name = task
                    .parameter_str("handler")
                    .ok_or_else(|| anyhow!("custom task '{}' names no handler", task.id))?;
                let handler = self
                    .task_handlers
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(name)
                    .cloned()
                    .ok_or_else(|| anyhow!("no task handler registered as '{name}'"))?;
                handler(task.clone()).await
            }
        }
    }

    async fn run_system_task(&self, workflow_id: &str, task: &WorkflowTask) -> anyhow::Result<Value> {
        match task.action.as_str() {
            "delay" => {
                let millis = task
                    .parameters
                    .get("duration")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(json!({ "delayed": millis }))
            }
            "log" => {
                let message = task.parameter_str("message").unwrap_or_default();
                tracing::info!(workflow_id, task_id = %task.id, "{message}");
                Ok(Value::Null)
            }
            "emit" => {
                let event_type = task
                    .parameter_str("eventType")
                    .ok_or_else(|| anyhow!("emit task '{}' has no eventType", task.id))?;
                let payload = task.parameters.get("payload").cloned().unwrap_or(Value::Null);
                let message_id = self
                    .broker
                    .publish(event_type, payload, self.source_for(workflow_id))
                    .await?;
                Ok(json!({ "messageId": message_id }))
            }
            other => Err(anyhow!("unknown system action '{other}'")),
        }
    }

    async fn complete_task(&self, workflow_id: &str, task_id: &str, result: Value) {
        let updated = {
            let mut instances = lock(&self.instances);
            match instances
                .get_mut(workflow_id)
                .and_then(|instance| instance.task_mut(task_id))
            {
                Some(task) => {
                    task.status = TaskStatus::Completed;
                    task.error = None;
                    true
                }
                None => false,
            }
        };
        if !updated {
            return;
        }

        tracing::debug!(workflow_id, task_id, "task completed");
        self.emit(
            TASK_COMPLETED,
            json!({ "workflowId": workflow_id, "taskId": task_id, "result": result }),
            workflow_id,
        )
        .await;
        self.settle().await;
    }

    async fn fail_task(self: &Arc<Self>, workflow_id: &str, task_id: &str, error: String) {
        let (outcome, attempts) = {
            let mut instances = lock(&self.instances);
            let Some(instance) = instances.get_mut(workflow_id) else {
                return;
            };
            let running = instance.status == WorkflowStatus::Running;
            let Some(task) = instance.task_mut(task_id) else {
                return;
            };

            task.error = Some(error.clone());
            let outcome = if running && task.retry_count > 0 {
                task.retry_count -= 1;
                task.status = TaskStatus::Pending;
                FailureOutcome::Retry {
                    retries_left: task.retry_count,
                    delay: task.retry_delay(),
                }
            } else {
                task.status = TaskStatus::Failed;
                FailureOutcome::Failed
            };
            (outcome, task.attempts)
        };

        match outcome {
            FailureOutcome::Retry {
                retries_left,
                delay,
            } => {
                tracing::warn!(
                    workflow_id,
                    task_id,
                    attempts,
                    retries_left,
                    error = %error,
                    "task failed, retrying"
                );
                self.emit(
                    TASK_RETRY,
                    json!({
                        "workflowId": workflow_id,
                        "taskId": task_id,
                        "error": error,
                        "attempts": attempts,
                        "retriesLeft": retries_left,
                        "retryDelay": delay.as_millis() as u64,
                    }),
                    workflow_id,
                )
                .await;
                self.requeue(workflow_id, task_id, delay);
            }
            FailureOutcome::Failed => {
                tracing::warn!(workflow_id, task_id, attempts, error = %error, "task failed");
                self.emit(
                    TASK_FAILED,
                    json!({
                        "workflowId": workflow_id,
                        "taskId": task_id,
                        "error": error,
                        "attempts": attempts,
                    }),
                    workflow_id,
                )
                .await;
                self.settle().await;
            }
        }
    }

    /// Put a task back at the end of the queue, after `delay` when non-zero.
    fn requeue(self: &Arc<Self>, workflow_id: &str, task_id: &str, delay: Duration) {
        let queued = QueuedTask {
            workflow_id: workflow_id.to_string(),
            task_id: task_id.to_string(),
        };
        if delay.is_zero() {
            lock(&self.queue).push_back(queued);
            return;
        }

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                lock(&inner.queue).push_back(queued);
            }
        });
    }

    /// Finish every running instance whose tasks have settled.
    async fn settle(&self) {
        let settled: Vec<(String, String, WorkflowStatus, Option<String>)> = {
            let mut instances = lock(&self.instances);
            instances
                .values_mut()
                .filter(|instance| instance.status == WorkflowStatus::Running)
                .filter_map(|instance| {
                    let (status, error) = instance.settled()?;
                    instance.finish(status, error.clone());
                    Some((instance.id.clone(), instance.name.clone(), status, error))
                })
                .collect()
        };

        for (id, name, status, error) in settled {
            if status == WorkflowStatus::Failed {
                lock(&self.queue).retain(|queued| queued.workflow_id != id);
                tracing::warn!(workflow_id = %id, name = %name, error = ?error, "workflow failed");
                self.emit(
                    WORKFLOW_FAILED,
                    json!({ "workflowId": id, "name": name, "error": error }),
                    &id,
                )
                .await;
            } else {
                tracing::info!(workflow_id = %id, name = %name, "workflow completed");
                self.emit(
                    WORKFLOW_COMPLETED,
                    json!({ "workflowId": id, "name": name }),
                    &id,
                )
                .await;
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let rules = self
            .rules
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for registered in rules.values() {
            for id in &registered.subscriptions {
                self.broker.unsubscribe(id);
            }
        }
        if let Some(processor) = self
            .processor
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            processor.handle.abort();
        }
    }
}

async fn run_processor(
    inner: Weak<Inner>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.process_next();
    }

    tracing::debug!("task processor exited");
}
