//! Request/response correlation over the broker.
//!
//! A call publishes a command message whose payload carries a `requestId`
//! and waits for any message matching the response pattern that carries the
//! same `requestId`. The pending entry is registered before the command is
//! published because synchronous responders answer while the publish is
//! still dispatching.
//!
//! An entry leaves the pending map exactly once: either the response handler
//! removes it and sends the payload, or the caller removes it on timeout.
//! Whoever removes it owns the outcome.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::broker::{Broker, Message, MessageSource, SubscribeOptions, SubscriptionId};
use crate::config::RpcSettings;
use crate::utils::error::{BrokerResult, RpcError};

/// Payload field carrying the correlation token.
pub const REQUEST_ID: &str = "requestId";

/// Suffix appended to a command type by [`respond`].
pub const RESPONSE_SUFFIX: &str = "_RESPONSE";

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Map<String, Value>>>>>;

fn lock_pending(
    pending: &Pending,
) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Map<String, Value>>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct RpcClient {
    broker: Arc<Broker>,
    settings: RpcSettings,
    source: MessageSource,
    pending: Pending,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl RpcClient {
    pub fn new(broker: Arc<Broker>, settings: RpcSettings) -> Self {
        Self {
            broker,
            settings,
            source: MessageSource::new("rpc-client"),
            pending: Arc::new(Mutex::new(HashMap::new())),
            subscription: Mutex::new(None),
        }
    }

    /// Source attached to every command this client publishes.
    pub fn with_source(mut self, source: MessageSource) -> Self {
        self.source = source;
        self
    }

    /// Subscribe once to every response type. Calling it again replaces the
    /// previous subscription.
    pub fn init(&self, response_pattern: &str) -> BrokerResult<SubscriptionId> {
        let pending = Arc::clone(&self.pending);
        let id = self.broker.subscribe(
            response_pattern,
            move |message: Message| {
                let pending = Arc::clone(&pending);
                async move {
                    route_response(&pending, message);
                    Ok(())
                }
            },
            SubscribeOptions::default(),
        )?;

        let previous = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(id.clone());
        if let Some(previous) = previous {
            self.broker.unsubscribe(&previous);
        }

        tracing::debug!(response_pattern, subscription_id = %id, "rpc client initialized");
        Ok(id)
    }

    /// [`init`](Self::init) with the configured response pattern.
    pub fn init_default(&self) -> BrokerResult<SubscriptionId> {
        let pattern = self.settings.response_pattern.clone();
        self.init(&pattern)
    }

    pub fn pending_count(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    /// Publish `command` and wait for the correlated response.
    ///
    /// `payload` must be a JSON object. Its `requestId` is used when present
    /// and generated otherwise. `timeout` defaults to the configured value.
    pub async fn call(
        &self,
        command: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        let Value::Object(mut payload) = payload else {
            return Err(RpcError::Validation(format!(
                "payload for '{command}' must be a JSON object"
            )));
        };

        let request_id = match payload.get(REQUEST_ID) {
            None => {
                let generated = format!("req-{}", uuid::Uuid::new_v4());
                payload.insert(REQUEST_ID.to_string(), Value::String(generated.clone()));
                generated
            }
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(_) => {
                return Err(RpcError::Validation(format!(
                    "'{REQUEST_ID}' must be a non-empty string"
                )));
            }
        };

        let timeout = timeout.unwrap_or_else(|| self.settings.default_timeout());
        let deadline = Instant::now() + timeout;

        let (tx, mut rx) = oneshot::channel();
        {
            let mut pending = lock_pending(&self.pending);
            if pending.contains_key(&request_id) {
                return Err(RpcError::Validation(format!(
                    "request '{request_id}' is already in flight"
                )));
            }
            pending.insert(request_id.clone(), tx);
        }

        tracing::debug!(command, request_id = %request_id, ?timeout, "rpc call");

        if let Err(e) = self
            .broker
            .publish(command, Value::Object(payload), self.source.clone())
            .await
        {
            lock_pending(&self.pending).remove(&request_id);
            return Err(RpcError::Publish(e));
        }

        let response = match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(RpcError::Closed),
            Err(_) => {
                let removed = lock_pending(&self.pending).remove(&request_id).is_some();
                if removed {
                    tracing::warn!(command, request_id = %request_id, ?timeout, "rpc call timed out");
                    return Err(RpcError::Timeout {
                        command: command.to_string(),
                        timeout,
                    });
                }
                // the response handler took the entry first; its send is
                // already done or about to be
                rx.await.map_err(|_| RpcError::Closed)?
            }
        };

        resolve(response)
    }

    /// Drop the response subscription and fail every in-flight call with
    /// [`RpcError::Closed`].
    pub fn close(&self) {
        if let Some(id) = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            self.broker.unsubscribe(&id);
        }
        let dropped = {
            let mut pending = lock_pending(&self.pending);
            let n = pending.len();
            pending.clear();
            n
        };
        if dropped > 0 {
            tracing::info!(dropped, "rpc client closed with calls in flight");
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn route_response(pending: &Pending, message: Message) {
    let Some(request_id) = message.get_str(REQUEST_ID) else {
        tracing::trace!(message_type = %message.message_type, "response without requestId");
        return;
    };

    let sender = lock_pending(pending).remove(request_id);
    match sender {
        Some(tx) => {
            // the caller may have given up between removal and send
            let _ = tx.send(message.payload);
        }
        None => {
            tracing::debug!(
                request_id,
                message_type = %message.message_type,
                "dropping unmatched response"
            );
        }
    }
}

/// Map a response payload onto the call result.
///
/// With `success: true` the result is `data`, with `success: false` it is a
/// [`RpcError::Remote`] carrying `error`. Without a `success` flag the whole
/// payload is the result.
pub fn resolve(mut payload: Map<String, Value>) -> Result<Value, RpcError> {
    match payload.get("success").and_then(Value::as_bool) {
        Some(true) => Ok(payload.remove("data").unwrap_or(Value::Null)),
        Some(false) => Err(RpcError::Remote {
            error: payload.remove("error").unwrap_or(Value::Null),
        }),
        None => Ok(Value::Object(payload)),
    }
}

/// Publish the structured response to `request` as `<type>_RESPONSE`.
pub async fn respond(
    broker: &Broker,
    request: &Message,
    outcome: Result<Value, Value>,
    source: MessageSource,
) -> Result<String, RpcError> {
    let request_id = request
        .get(REQUEST_ID)
        .cloned()
        .ok_or_else(|| RpcError::Validation(format!("request has no '{REQUEST_ID}'")))?;

    let payload = match outcome {
        Ok(data) => json!({ REQUEST_ID: request_id, "success": true, "data": data }),
        Err(error) => json!({ REQUEST_ID: request_id, "success": false, "error": error }),
    };

    let response_type = format!("{}{RESPONSE_SUFFIX}", request.message_type);
    Ok(broker.publish(&response_type, payload, source).await?)
}
