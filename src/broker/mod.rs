//! The broker owns message identity, the subscription registry, the bounded
//! history and the persistence queue. Everything else in the crate talks to
//! it through `publish`/`subscribe` only.

pub mod engine;
pub mod history;
pub mod lifecycle;
pub mod message;
pub mod pattern;
pub mod stats;
pub mod subscription;

pub use engine::{BROKER_COMPONENT, Broker};
pub use history::HistoryQuery;
pub use lifecycle::LifecycleEvent;
pub use message::{Message, MessageMeta, MessageSource, PublishOptions, SYSTEM_ERROR};
pub use pattern::Pattern;
pub use stats::BrokerStats;
pub use subscription::{Handler, SubscribeOptions, SubscriptionId, handler};

#[cfg(test)]
mod tests;
