use serde::{Deserialize, Serialize};

use crate::broker::pattern::Pattern;
use crate::utils::error::BrokerResult;

/// Sample rate used when a `sample` rule does not name one.
pub const DEFAULT_SAMPLE_RATE: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistStrategy {
    Always,
    Never,
    Sample,
}

/// One entry of the ordered persist-rule list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistRule {
    pub pattern: String,
    pub strategy: PersistStrategy,
    #[serde(default, alias = "sample_rate")]
    pub sample_rate: Option<f64>,
}

impl PersistRule {
    pub fn always(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            strategy: PersistStrategy::Always,
            sample_rate: None,
        }
    }

    pub fn never(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            strategy: PersistStrategy::Never,
            sample_rate: None,
        }
    }

    pub fn sample(pattern: impl Into<String>, rate: f64) -> Self {
        Self {
            pattern: pattern.into(),
            strategy: PersistStrategy::Sample,
            sample_rate: Some(rate),
        }
    }
}

/// Compiled persist rules. First matching rule wins; no match means the
/// message is not persisted.
#[derive(Debug, Clone, Default)]
pub struct PersistPolicy {
    rules: Vec<(Pattern, PersistStrategy, f64)>,
}

impl PersistPolicy {
    pub fn compile(rules: &[PersistRule]) -> BrokerResult<Self> {
        let rules = rules
            .iter()
            .map(|rule| {
                let rate = rule
                    .sample_rate
                    .unwrap_or(DEFAULT_SAMPLE_RATE)
                    .clamp(0.0, 1.0);
                Ok((Pattern::compile(&rule.pattern)?, rule.strategy, rate))
            })
            .collect::<BrokerResult<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// The strategy of the first rule matching `message_type`, if any.
    pub fn strategy_for(&self, message_type: &str) -> Option<(PersistStrategy, f64)> {
        self.rules
            .iter()
            .find(|(pattern, _, _)| pattern.matches(message_type))
            .map(|(_, strategy, rate)| (*strategy, *rate))
    }

    pub fn should_persist(&self, message_type: &str) -> bool {
        match self.strategy_for(message_type) {
            Some((PersistStrategy::Always, _)) => true,
            Some((PersistStrategy::Sample, rate)) => rand::random::<f64>() < rate,
            Some((PersistStrategy::Never, _)) | None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
