//! The `error` module defines the error types used across `flowbus`.
//!
//! Only state, validation and RPC timeout errors unwind to the caller.
//! Handler and persistence failures are reported as `system.error` messages
//! and the broker keeps running.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::broker::Message;

/// Errors returned by [`crate::broker::Broker`] operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// `publish` was called while the broker is stopped.
    #[error("broker is not running")]
    NotRunning,

    /// `start` was called on a running broker.
    #[error("broker is already running")]
    AlreadyRunning,

    /// The subscription pattern was rejected at registration.
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: &'static str },
}

/// Result alias for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Failures while writing the append-only message log.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("persistence worker failed: {0}")]
    Join(String),
}

/// A batch that was only partly appended. `unwritten` holds the records
/// that never reached the log, in batch order, so retrying them cannot
/// duplicate anything already on disk.
#[derive(Debug, Error)]
#[error("{written} records written, {} left: {source}", .unwritten.len())]
pub struct AppendError {
    pub written: usize,
    pub unwritten: Vec<Message>,
    #[source]
    pub source: PersistenceError,
}

/// Errors surfaced to callers of [`crate::rpc::RpcClient::call`].
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("failed to publish command: {0}")]
    Publish(#[from] BrokerError),

    #[error("request '{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// The responder answered with `success: false`.
    #[error("remote error: {error}")]
    Remote { error: Value },

    #[error("rpc client closed before a response arrived")]
    Closed,
}

/// Errors returned by [`crate::workflow::WorkflowEngine`] operations.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow '{0}' not found")]
    NotFound(String),

    #[error("workflow '{id}' cannot be started from status {status}")]
    InvalidState { id: String, status: String },

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;
