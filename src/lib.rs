//! # flowbus
//!
//! `flowbus` is an in-process event orchestration core. A message broker
//! routes typed JSON messages to wildcard subscriptions, a correlation
//! client runs request/response calls over it, and a workflow engine reacts
//! to events with rules and schedules task lists.
//!
//! ## Core Modules
//!
//! - `broker`: messages, wildcard subscriptions, history, statistics and the persistence queue.
//! - `persistence`: persist rules and the date-partitioned append-only message log.
//! - `rpc`: request/response correlation on top of publish/subscribe.
//! - `workflow`: rule evaluation, workflow instances and the task queue.
//! - `config`: loading settings from files and the environment.
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod config;
pub mod persistence;
pub mod rpc;
pub mod utils;
pub mod workflow;
