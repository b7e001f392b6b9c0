//! Broker lifecycle notifications.
//!
//! These are deliberately not messages: they travel on their own broadcast
//! channel so that service state changes never show up in pattern matches,
//! history or the message log.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Started { at: DateTime<Utc> },
    Stopped { at: DateTime<Utc> },
    /// A flush failed and the batch was put back on the queue.
    PersistenceFailed { error: String, batch_size: usize },
}

/// Capacity of the lifecycle broadcast channel. Slow receivers lag rather
/// than block the broker.
pub(crate) const LIFECYCLE_CAPACITY: usize = 64;
