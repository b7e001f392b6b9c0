use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic broker counters.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) sent: AtomicU64,
    pub(crate) delivered: AtomicU64,
    pub(crate) persisted: AtomicU64,
    pub(crate) filtered: AtomicU64,
    pub(crate) handler_errors: AtomicU64,
}

impl Counters {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Point-in-time snapshot returned by [`Broker::stats`](super::Broker::stats).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStats {
    pub messages_sent: u64,
    pub messages_delivered: u64,
    pub messages_persisted: u64,
    pub messages_filtered: u64,
    pub handler_errors: u64,
    pub active_subscriptions: usize,
    pub pattern_groups: usize,
    pub history_size: usize,
    pub queued_for_persistence: usize,
    /// Zero while the broker is stopped.
    pub uptime_ms: u64,
}
