//! Message definitions for the broker
//!
//! `Message` is the canonical representation used for dispatch, history and
//! the append-only log. It is serialized in camelCase so log records read the
//! same as the payloads external collaborators publish.
//!
//! Notes on fields:
//! - `id`: UUID assigned by the broker at publish time
//! - `type`: namespaced message type used for routing
//! - `timestamp`: milliseconds since UNIX epoch, set by the broker
//! - `payload`: always a JSON object
//! - `meta.trace_id`: derived from `source.component` when one is given

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Schema version stamped into every message.
pub const MESSAGE_VERSION: &str = "1.0";

/// Type published when a handler or the persistence layer fails.
pub const SYSTEM_ERROR: &str = "system.error";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub timestamp: i64,
    pub source: MessageSource,
    pub payload: Map<String, Value>,
    pub meta: MessageMeta,
}

/// Who published a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSource {
    pub component: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMeta {
    pub version: String,
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    /// Time to live in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persist: Option<bool>,
}

/// Optional metadata a publisher can attach with
/// [`Broker::publish_with`](super::Broker::publish_with).
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub parent_id: Option<String>,
    pub priority: Option<i32>,
    pub ttl: Option<u64>,
    /// Overrides the persist rules for this one message.
    pub persist: Option<bool>,
}

impl MessageSource {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            ..Self::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_container(mut self, container_id: impl Into<String>) -> Self {
        self.container_id = Some(container_id.into());
        self
    }

    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

impl Message {
    pub(crate) fn new(
        message_type: &str,
        payload: Value,
        source: MessageSource,
        options: PublishOptions,
        timestamp: i64,
    ) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let trace_id = if source.component.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            format!("{}-{}", source.component, uuid::Uuid::new_v4().simple())
        };

        Self {
            id,
            message_type: message_type.to_string(),
            timestamp,
            source,
            payload: into_object(payload),
            meta: MessageMeta {
                version: MESSAGE_VERSION.to_string(),
                trace_id,
                parent_id: options.parent_id,
                priority: options.priority,
                ttl: options.ttl,
                persist: options.persist,
            },
        }
    }

    /// Look up a top-level payload field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Payload field as a string slice, if it is one.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Payloads are always objects; anything else is wrapped as `{"value": ..}`.
pub(crate) fn into_object(payload: Value) -> Map<String, Value> {
    match payload {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}
