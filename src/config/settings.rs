use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::persistence::PersistRule;

/// Top-level configuration for the orchestration core.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub rpc: RpcSettings,
    pub workflow: WorkflowSettings,
    pub logging: LoggingSettings,
}

/// Message broker settings.
///
/// `history_limit` bounds the in-memory history buffer; older messages are
/// evicted first.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub history_limit: usize,
    pub persistence: PersistenceSettings,
}

/// Append-only message log settings.
#[derive(Debug, Deserialize, Clone)]
pub struct PersistenceSettings {
    pub enabled: bool,
    pub directory: PathBuf,
    pub flush_interval_ms: u64,
    /// Evaluated in order, first match wins.
    pub rules: Vec<PersistRule>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RpcSettings {
    pub response_pattern: String,
    pub default_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkflowSettings {
    pub poll_interval_ms: u64,
    pub max_evaluations: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

impl PersistenceSettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl RpcSettings {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl WorkflowSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            history_limit: 1000,
            persistence: PersistenceSettings::default(),
        }
    }
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: PathBuf::from("data/messages"),
            flush_interval_ms: 5000,
            rules: Vec::new(),
        }
    }
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            response_pattern: "*_RESPONSE".to_string(),
            default_timeout_ms: 30_000,
        }
    }
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            max_evaluations: 1000,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Partial configuration loaded from files or environment.
///
/// Missing values are filled from [`Settings::default`].
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub broker: Option<PartialBrokerSettings>,
    pub rpc: Option<PartialRpcSettings>,
    pub workflow: Option<PartialWorkflowSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub history_limit: Option<usize>,
    pub persistence: Option<PartialPersistenceSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialPersistenceSettings {
    pub enabled: Option<bool>,
    pub directory: Option<PathBuf>,
    pub flush_interval_ms: Option<u64>,
    pub rules: Option<Vec<PersistRule>>,
}

#[derive(Debug, Deserialize)]
pub struct PartialRpcSettings {
    pub response_pattern: Option<String>,
    pub default_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialWorkflowSettings {
    pub poll_interval_ms: Option<u64>,
    pub max_evaluations: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}
