mod settings;

use std::path::Path;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{
    BrokerSettings, LoggingSettings, PersistenceSettings, RpcSettings, Settings, WorkflowSettings,
};

/// Environment variable prefix, e.g. `FLOWBUS_BROKER__HISTORY_LIMIT=50`.
pub const ENV_PREFIX: &str = "FLOWBUS";

/// Loads `config/default` (any format the `config` crate understands, optional)
/// and `FLOWBUS_*` environment variables, merged onto defaults.
pub fn load_config() -> Result<Settings, ConfigError> {
    build(File::with_name("config/default").required(false))
}

/// Loads a specific configuration file plus environment overrides.
pub fn load_config_from(path: impl AsRef<Path>) -> Result<Settings, ConfigError> {
    build(File::from(path.as_ref()).required(true))
}

fn build<S>(file: S) -> Result<Settings, ConfigError>
where
    S: config::Source + Send + Sync + 'static,
{
    let config = Config::builder()
        .add_source(file)
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let partial: PartialSettings = config.try_deserialize()?;
    Ok(merge(partial, Settings::default()))
}

fn merge(partial: PartialSettings, default: Settings) -> Settings {
    let broker = partial.broker.as_ref();
    let persistence = broker.and_then(|b| b.persistence.as_ref());
    let rpc = partial.rpc.as_ref();
    let workflow = partial.workflow.as_ref();

    Settings {
        broker: BrokerSettings {
            history_limit: broker
                .and_then(|b| b.history_limit)
                .unwrap_or(default.broker.history_limit),
            persistence: PersistenceSettings {
                enabled: persistence
                    .and_then(|p| p.enabled)
                    .unwrap_or(default.broker.persistence.enabled),
                directory: persistence
                    .and_then(|p| p.directory.clone())
                    .unwrap_or(default.broker.persistence.directory),
                flush_interval_ms: persistence
                    .and_then(|p| p.flush_interval_ms)
                    .unwrap_or(default.broker.persistence.flush_interval_ms),
                rules: persistence
                    .and_then(|p| p.rules.clone())
                    .unwrap_or(default.broker.persistence.rules),
            },
        },
        rpc: RpcSettings {
            response_pattern: rpc
                .and_then(|r| r.response_pattern.clone())
                .unwrap_or(default.rpc.response_pattern),
            default_timeout_ms: rpc
                .and_then(|r| r.default_timeout_ms)
                .unwrap_or(default.rpc.default_timeout_ms),
        },
        workflow: WorkflowSettings {
            poll_interval_ms: workflow
                .and_then(|w| w.poll_interval_ms)
                .unwrap_or(default.workflow.poll_interval_ms),
            max_evaluations: workflow
                .and_then(|w| w.max_evaluations)
                .unwrap_or(default.workflow.max_evaluations),
        },
        logging: LoggingSettings {
            level: partial
                .logging
                .and_then(|l| l.level)
                .unwrap_or(default.logging.level),
        },
    }
}
