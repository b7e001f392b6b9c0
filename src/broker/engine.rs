//! Broker engine
//!
//! This module contains the in-memory broker responsible for:
//! - keeping the subscription registry, grouped by pattern string
//! - dispatching each published message to every matching subscription
//! - keeping a bounded history of recent messages
//! - queueing selected messages and flushing them to the append-only log
//!
//! Concurrency and usage notes:
//! - The broker is shared as `Arc<Broker>`; every method takes `&self`.
//! - The registry, history and persistence queue each have their own lock.
//!   No lock is held while a handler runs, so handlers may publish,
//!   subscribe and unsubscribe freely.
//! - `publish` returns only after every matched handler has finished.
//!   Handlers of one pattern group run one after another in priority order;
//!   separate pattern groups run concurrently.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use futures::future::join_all;
use serde_json::{Value, json};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::history::{History, HistoryQuery};
use super::lifecycle::{LIFECYCLE_CAPACITY, LifecycleEvent};
use super::message::{Message, MessageSource, PublishOptions, SYSTEM_ERROR};
use super::pattern::Pattern;
use super::stats::{BrokerStats, Counters};
use super::subscription::{
    Handler, PatternGroup, SubscribeOptions, Subscription, SubscriptionId, handler,
};
use crate::config::BrokerSettings;
use crate::persistence::{LogStore, PersistPolicy};
use crate::utils::error::{AppendError, BrokerError, BrokerResult, PersistenceError};

/// Component name used as the source of broker-generated messages.
pub const BROKER_COMPONENT: &str = "broker";

#[derive(Debug, Default)]
struct Registry {
    groups: HashMap<String, PatternGroup>,
    /// subscription id -> pattern string of its group
    index: HashMap<SubscriptionId, String>,
}

#[derive(Debug)]
struct FlushWorker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
struct HandlerFailure {
    subscription_id: SubscriptionId,
    error: String,
}

#[derive(Debug)]
pub struct Broker {
    settings: BrokerSettings,
    policy: PersistPolicy,
    store: Option<Arc<LogStore>>,
    running: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    /// Serializes start/stop and owns the flush task.
    worker: tokio::sync::Mutex<Option<FlushWorker>>,
    registry: RwLock<Registry>,
    history: Mutex<History>,
    queue: Mutex<Vec<Message>>,
    counters: Counters,
    lifecycle: broadcast::Sender<LifecycleEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

impl Broker {
    /// Build a broker from settings. Fails if a persist rule has an invalid
    /// pattern.
    pub fn new(settings: BrokerSettings) -> BrokerResult<Arc<Self>> {
        let policy = PersistPolicy::compile(&settings.persistence.rules)?;
        Ok(Arc::new(Self::build(settings, policy)))
    }

    /// An isolated broker with default settings and persistence disabled.
    pub fn for_tests() -> Arc<Self> {
        Arc::new(Self::build(
            BrokerSettings::default(),
            PersistPolicy::default(),
        ))
    }

    fn build(settings: BrokerSettings, policy: PersistPolicy) -> Self {
        let store = settings
            .persistence
            .enabled
            .then(|| Arc::new(LogStore::new(settings.persistence.directory.clone())));
        let (lifecycle, _) = broadcast::channel(LIFECYCLE_CAPACITY);

        Self {
            history: Mutex::new(History::new(settings.history_limit)),
            settings,
            policy,
            store,
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
            worker: tokio::sync::Mutex::new(None),
            registry: RwLock::new(Registry::default()),
            queue: Mutex::new(Vec::new()),
            counters: Counters::default(),
            lifecycle,
        }
    }

    /// The settings this broker was built with.
    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    /// Whether `start` has run without a matching `stop`.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Receiver for start/stop and persistence-failure notifications.
    pub fn lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    /// Transition `stopped -> running` and start the periodic flush when
    /// persistence is enabled.
    pub async fn start(self: &Arc<Self>) -> BrokerResult<()> {
        let mut worker = self.worker.lock().await;
        if self.is_running() {
            return Err(BrokerError::AlreadyRunning);
        }

        if self.store.is_some() {
            let (shutdown, rx) = watch::channel(false);
            let interval = self
                .settings
                .persistence
                .flush_interval()
                .max(Duration::from_millis(1));
            let handle = tokio::spawn(run_flush_loop(Arc::downgrade(self), interval, rx));
            *worker = Some(FlushWorker { shutdown, handle });
        }

        *lock(&self.started_at) = Some(Instant::now());
        self.running.store(true, Ordering::Release);
        tracing::info!(
            history_limit = self.settings.history_limit,
            persistence = self.store.is_some(),
            "broker started"
        );
        let _ = self.lifecycle.send(LifecycleEvent::Started { at: Utc::now() });
        Ok(())
    }

    /// Stop the flush timer, drain the persistence queue and transition back
    /// to stopped. A no-op when already stopped.
    pub async fn stop(&self) {
        let mut worker = self.worker.lock().await;
        if !self.is_running() {
            return;
        }

        if let Some(FlushWorker { shutdown, handle }) = worker.take() {
            let _ = shutdown.send(true);
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "flush task ended abnormally");
            }
        }

        if let Err(e) = self.flush().await {
            tracing::warn!(
                error = %e,
                queued = lock(&self.queue).len(),
                "final flush failed, messages stay queued"
            );
        }

        self.running.store(false, Ordering::Release);
        *lock(&self.started_at) = None;
        tracing::info!("broker stopped");
        let _ = self.lifecycle.send(LifecycleEvent::Stopped { at: Utc::now() });
    }

    /// Publish with default metadata. See [`Broker::publish_with`].
    pub async fn publish(
        &self,
        message_type: &str,
        payload: Value,
        source: MessageSource,
    ) -> BrokerResult<String> {
        self.publish_with(message_type, payload, source, PublishOptions::default())
            .await
    }

    /// Publish with explicit metadata. Returns the new message id once
    /// dispatch to every matching subscription has settled.
    pub async fn publish_with(
        &self,
        message_type: &str,
        payload: Value,
        source: MessageSource,
        options: PublishOptions,
    ) -> BrokerResult<String> {
        if !self.is_running() {
            return Err(BrokerError::NotRunning);
        }

        let message = self.record(message_type, payload, source, options);
        let failures = self.dispatch(&message).await;

        for failure in failures {
            Counters::incr(&self.counters.handler_errors);
            tracing::error!(
                subscription_id = %failure.subscription_id,
                event_type = %message.message_type,
                error = %failure.error,
                "subscription handler failed"
            );
            if message.message_type != SYSTEM_ERROR {
                let payload = json!({
                    "kind": "handler",
                    "subscriptionId": failure.subscription_id,
                    "eventType": message.message_type,
                    "messageId": message.id,
                    "error": failure.error,
                });
                self.emit_system_error(payload, Some(&message.id)).await;
            }
        }

        Ok(message.id)
    }

    /// Register a handler for every message type matching `pattern`.
    pub fn subscribe<F, Fut>(
        &self,
        pattern: &str,
        f: F,
        options: SubscribeOptions,
    ) -> BrokerResult<SubscriptionId>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe_handler(pattern, handler(f), options)
    }

    /// Register an already boxed handler. `subscribe` wraps a closure and
    /// calls this.
    pub fn subscribe_handler(
        &self,
        pattern: &str,
        handler: Handler,
        options: SubscribeOptions,
    ) -> BrokerResult<SubscriptionId> {
        let mut registry = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if !registry.groups.contains_key(pattern) {
            let compiled = Pattern::compile(pattern)?;
            registry
                .groups
                .insert(pattern.to_string(), PatternGroup::new(compiled));
        }

        let subscription = Arc::new(Subscription::new(pattern, handler, options));
        let id = subscription.id.clone();
        tracing::debug!(
            subscription_id = %id,
            pattern,
            priority = subscription.priority,
            once = subscription.once,
            "subscribed"
        );

        if let Some(group) = registry.groups.get_mut(pattern) {
            group.insert(subscription);
        }
        registry.index.insert(id.clone(), pattern.to_string());
        Ok(id)
    }

    /// Remove one subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: &str) -> bool {
        let mut registry = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let Some(pattern) = registry.index.remove(id) else {
            return false;
        };

        let mut removed = false;
        let mut now_empty = false;
        if let Some(group) = registry.groups.get_mut(&pattern) {
            removed = group.remove(id);
            now_empty = group.is_empty();
        }
        if now_empty {
            registry.groups.remove(&pattern);
        }
        if removed {
            tracing::debug!(subscription_id = id, pattern = %pattern, "unsubscribed");
        }
        removed
    }

    /// Remove every subscription registered with exactly this pattern string.
    pub fn unsubscribe_by_pattern(&self, pattern: &str) -> bool {
        let mut registry = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        match registry.groups.remove(pattern) {
            Some(group) => {
                for subscription in &group.subscriptions {
                    registry.index.remove(&subscription.id);
                }
                tracing::debug!(
                    pattern,
                    removed = group.subscriptions.len(),
                    "unsubscribed pattern"
                );
                true
            }
            None => false,
        }
    }

    /// Number of live subscriptions across all pattern groups.
    pub fn subscription_count(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .index
            .len()
    }

    /// Messages from the bounded history, oldest first.
    pub fn history(&self, query: &HistoryQuery) -> Vec<Message> {
        lock(&self.history).query(query)
    }

    /// Drop every retained message. Queued persistence is unaffected.
    pub fn clear_history(&self) {
        lock(&self.history).clear();
    }

    /// Snapshot of the counters and current sizes.
    pub fn stats(&self) -> BrokerStats {
        let (active_subscriptions, pattern_groups) = {
            let registry = self
                .registry
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            (registry.index.len(), registry.groups.len())
        };
        let uptime_ms = lock(&self.started_at)
            .as_ref()
            .map(|started| started.elapsed().as_millis() as u64)
            .unwrap_or(0);

        BrokerStats {
            messages_sent: Counters::get(&self.counters.sent),
            messages_delivered: Counters::get(&self.counters.delivered),
            messages_persisted: Counters::get(&self.counters.persisted),
            messages_filtered: Counters::get(&self.counters.filtered),
            handler_errors: Counters::get(&self.counters.handler_errors),
            active_subscriptions,
            pattern_groups,
            history_size: lock(&self.history).len(),
            queued_for_persistence: lock(&self.queue).len(),
            uptime_ms,
        }
    }

    /// Write everything queued so far. Records that did not reach the log go
    /// back to the front of the queue and a `system.error` is published.
    pub async fn flush(&self) -> Result<usize, PersistenceError> {
        let Some(store) = self.store.clone() else {
            return Ok(0);
        };

        let batch = std::mem::take(&mut *lock(&self.queue));
        if batch.is_empty() {
            return Ok(0);
        }

        let batch = Arc::new(batch);
        let writing = Arc::clone(&batch);
        let outcome = tokio::task::spawn_blocking(move || store.append(&writing))
            .await
            .unwrap_or_else(|e| {
                Err(AppendError {
                    written: 0,
                    unwritten: batch.to_vec(),
                    source: PersistenceError::Join(e.to_string()),
                })
            });

        match outcome {
            Ok(written) => {
                Counters::add(&self.counters.persisted, written as u64);
                tracing::debug!(written, "flushed message batch");
                Ok(written)
            }
            Err(AppendError {
                written,
                unwritten,
                source,
            }) => {
                Counters::add(&self.counters.persisted, written as u64);
                let batch_size = unwritten.len();
                self.requeue_front(unwritten);

                tracing::error!(
                    error = %source,
                    written,
                    batch_size,
                    "failed to persist message batch"
                );
                let _ = self.lifecycle.send(LifecycleEvent::PersistenceFailed {
                    error: source.to_string(),
                    batch_size,
                });
                self.emit_system_error(
                    json!({
                        "kind": "persistence",
                        "error": source.to_string(),
                        "written": written,
                        "batchSize": batch_size,
                    }),
                    None,
                )
                .await;
                Err(source)
            }
        }
    }

    fn requeue_front(&self, batch: Vec<Message>) {
        let mut queue = lock(&self.queue);
        let newer = std::mem::replace(&mut *queue, batch);
        queue.extend(newer);
    }

    /// Build the message, append it to history and, if the rules say so,
    /// to the persistence queue.
    fn record(
        &self,
        message_type: &str,
        payload: Value,
        source: MessageSource,
        options: PublishOptions,
    ) -> Message {
        let message = Message::new(
            message_type,
            payload,
            source,
            options,
            Utc::now().timestamp_millis(),
        );

        lock(&self.history).push(message.clone());

        if self.store.is_some() {
            let persist = message
                .meta
                .persist
                .unwrap_or_else(|| self.policy.should_persist(&message.message_type));
            if persist {
                lock(&self.queue).push(message.clone());
            }
        }

        Counters::incr(&self.counters.sent);
        tracing::trace!(message_id = %message.id, message_type, "published");
        message
    }

    async fn dispatch(&self, message: &Message) -> Vec<HandlerFailure> {
        let groups: Vec<Vec<Arc<Subscription>>> = {
            let registry = self
                .registry
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            registry
                .groups
                .values()
                .filter(|group| group.pattern.matches(&message.message_type))
                .map(|group| group.subscriptions.clone())
                .collect()
        };

        if groups.is_empty() {
            tracing::trace!(message_type = %message.message_type, "no subscribers");
            return Vec::new();
        }

        join_all(
            groups
                .into_iter()
                .map(|subscriptions| self.dispatch_group(subscriptions, message)),
        )
        .await
        .into_iter()
        .flatten()
        .collect()
    }

    async fn dispatch_group(
        &self,
        subscriptions: Vec<Arc<Subscription>>,
        message: &Message,
    ) -> Vec<HandlerFailure> {
        let mut failures = Vec::new();

        for subscription in subscriptions {
            if let Some(filter) = &subscription.filter {
                match std::panic::catch_unwind(AssertUnwindSafe(|| filter(message))) {
                    Ok(true) => {}
                    Ok(false) => {
                        Counters::incr(&self.counters.filtered);
                        continue;
                    }
                    Err(panic) => {
                        failures.push(HandlerFailure {
                            subscription_id: subscription.id.clone(),
                            error: panic_message(panic),
                        });
                        continue;
                    }
                }
            }

            if !subscription.claim() {
                continue;
            }

            let invocation = std::panic::catch_unwind(AssertUnwindSafe(|| {
                let local = match &subscription.transform {
                    Some(transform) => transform(message.clone()),
                    None => message.clone(),
                };
                (subscription.handler)(local)
            }));

            let outcome = match invocation {
                Ok(future) => AssertUnwindSafe(future)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(anyhow::anyhow!(panic_message(panic)))),
                Err(panic) => Err(anyhow::anyhow!(panic_message(panic))),
            };
            Counters::incr(&self.counters.delivered);

            if subscription.once {
                self.unsubscribe(&subscription.id);
            }

            if let Err(e) = outcome {
                failures.push(HandlerFailure {
                    subscription_id: subscription.id.clone(),
                    error: format!("{e:#}"),
                });
            }
        }

        failures
    }

    /// Publish a `system.error`. Failures of its own handlers are only logged.
    async fn emit_system_error(&self, payload: Value, parent_id: Option<&str>) {
        if !self.is_running() {
            tracing::warn!(%payload, "system error while broker is stopped");
            return;
        }

        let options = PublishOptions {
            parent_id: parent_id.map(str::to_string),
            ..PublishOptions::default()
        };
        let message = self.record(
            SYSTEM_ERROR,
            payload,
            MessageSource::new(BROKER_COMPONENT),
            options,
        );

        for failure in self.dispatch(&message).await {
            Counters::incr(&self.counters.handler_errors);
            tracing::error!(
                subscription_id = %failure.subscription_id,
                error = %failure.error,
                "system.error handler failed"
            );
        }
    }
}

async fn run_flush_loop(
    broker: Weak<Broker>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let Some(broker) = broker.upgrade() else {
            break;
        };
        // failures are already reported inside flush
        let _ = broker.flush().await;
    }

    tracing::debug!("flush loop exited");
}
