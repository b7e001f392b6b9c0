//! Subscriptions and the per-pattern groups they live in.
//!
//! Subscriptions are grouped by the literal pattern string they were
//! registered with. Inside a group they are kept sorted by descending
//! priority, ties broken by registration order.
//!
//! Concurrency note: groups are only mutated under the broker's registry
//! lock. Dispatch works on a cloned snapshot of `Arc<Subscription>`s.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::message::Message;
use super::pattern::Pattern;

pub type SubscriptionId = String;

/// Boxed future returned by a handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A subscriber callback. Each invocation gets its own copy of the message.
pub type Handler = Arc<dyn Fn(Message) -> HandlerFuture + Send + Sync>;

/// Returning `false` skips the handler for that message.
pub type Filter = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// Produces the handler-local view of a message.
pub type Transform = Arc<dyn Fn(Message) -> Message + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

/// Options accepted by [`Broker::subscribe`](super::Broker::subscribe).
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    pub once: bool,
    pub priority: i32,
    pub filter: Option<Filter>,
    pub transform: Option<Transform>,
}

impl SubscribeOptions {
    pub fn once() -> Self {
        Self {
            once: true,
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn with_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(Message) -> Message + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self
    }
}

impl fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("once", &self.once)
            .field("priority", &self.priority)
            .field("filter", &self.filter.is_some())
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

pub struct Subscription {
    pub id: SubscriptionId,
    pub pattern: String,
    pub once: bool,
    pub priority: i32,
    pub(crate) handler: Handler,
    pub(crate) filter: Option<Filter>,
    pub(crate) transform: Option<Transform>,
    fired: AtomicBool,
}

impl Subscription {
    pub(crate) fn new(pattern: &str, handler: Handler, options: SubscribeOptions) -> Self {
        Self {
            id: format!("sub-{}", uuid::Uuid::new_v4()),
            pattern: pattern.to_string(),
            once: options.once,
            priority: options.priority,
            handler,
            filter: options.filter,
            transform: options.transform,
            fired: AtomicBool::new(false),
        }
    }

    /// Claims the right to run. Always true for regular subscriptions; for
    /// `once` subscriptions only the first caller wins, even across
    /// concurrent publishes.
    pub(crate) fn claim(&self) -> bool {
        !self.once || !self.fired.swap(true, Ordering::AcqRel)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .field("once", &self.once)
            .field("priority", &self.priority)
            .finish()
    }
}

#[derive(Debug)]
pub(crate) struct PatternGroup {
    pub(crate) pattern: Pattern,
    pub(crate) subscriptions: Vec<Arc<Subscription>>,
}

impl PatternGroup {
    pub(crate) fn new(pattern: Pattern) -> Self {
        Self {
            pattern,
            subscriptions: Vec::new(),
        }
    }

    /// Insert after every subscription with priority >= the new one, which
    /// keeps equal priorities in registration order.
    pub(crate) fn insert(&mut self, subscription: Arc<Subscription>) {
        let position = self
            .subscriptions
            .iter()
            .position(|s| s.priority < subscription.priority)
            .unwrap_or(self.subscriptions.len());
        self.subscriptions.insert(position, subscription);
    }

    pub(crate) fn remove(&mut self, id: &str) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.id != id);
        self.subscriptions.len() != before
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
