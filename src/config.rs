// ⚙️ Engine Configuration
// Pool size, error cap, timeout and cancellation cadence; each can be overridden from the environment.

use crate::error::ConfigError;
use std::time::Duration;

/// Default size of the rule permit pool.
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// Default hard cap on errors kept per rule (a truncation sentinel is added on top).
pub const DEFAULT_MAX_ERRORS_PER_RULE: usize = 1000;

/// How many records a handler processes between cancellation checks.
pub const DEFAULT_CANCEL_CHECK_INTERVAL: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Maximum number of rules evaluated at the same time
    pub max_concurrency: usize,

    /// Errors kept per rule before the truncation sentinel is appended
    pub max_errors_per_rule: usize,

    /// Optional wall-clock limit for a single rule
    pub rule_timeout: Option<Duration>,

    /// Records between cooperative cancellation checks
    pub cancel_check_interval: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_errors_per_rule: DEFAULT_MAX_ERRORS_PER_RULE,
            rule_timeout: None,
            cancel_check_interval: DEFAULT_CANCEL_CHECK_INTERVAL,
        }
    }
}

impl EngineConfig {
    /// Read configuration from `VALIDATION_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup (used by `from_env` and tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = EngineConfig::default();

        if let Some(n) = read_positive(&lookup, "VALIDATION_MAX_CONCURRENCY")? {
            config.max_concurrency = n;
        }
        if let Some(n) = read_positive(&lookup, "VALIDATION_MAX_ERRORS")? {
            config.max_errors_per_rule = n;
        }
        if let Some(secs) = read_positive(&lookup, "VALIDATION_RULE_TIMEOUT_SECS")? {
            config.rule_timeout = Some(Duration::from_secs(secs as u64));
        }
        if let Some(n) = read_positive(&lookup, "VALIDATION_CANCEL_CHECK_INTERVAL")? {
            config.cancel_check_interval = n;
        }

        Ok(config)
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n.max(1);
        self
    }

    pub fn with_max_errors_per_rule(mut self, n: usize) -> Self {
        self.max_errors_per_rule = n.max(1);
        self
    }

    pub fn with_rule_timeout(mut self, timeout: Duration) -> Self {
        self.rule_timeout = Some(timeout);
        self
    }
}

fn read_positive<F>(lookup: &F, var: &'static str) -> Result<Option<usize>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    let value: usize = raw.trim().parse().map_err(|_| ConfigError::InvalidNumber {
        var,
        value: raw.clone(),
    })?;
    if value == 0 {
        return Err(ConfigError::Zero(var));
    }
    Ok(Some(value))
}
