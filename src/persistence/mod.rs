//! The `persistence` module decides which messages are durably logged and
//! writes them.
//!
//! The broker queues messages selected by the persist rules and a periodic
//! flush hands each batch to the [`LogStore`], a date-partitioned JSON-lines
//! append-only log. It is an audit/replay trail, not a delivery mechanism.

pub mod log_store;
pub mod rules;

pub use log_store::LogStore;
pub use rules::{PersistPolicy, PersistRule, PersistStrategy};

#[cfg(test)]
mod tests;
