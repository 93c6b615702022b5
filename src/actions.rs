// 📣 Rule Actions
// Best-effort side effects after a verdict; nothing here can change the verdict

use crate::expression::render_template;
use crate::result::{RuleStatus, ValidationResult};
use crate::rules::{ActionDescriptor, RuleDefinition};
use anyhow::{anyhow, bail, Result};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;
use tracing::{debug, error, info, trace, warn};

pub trait ActionExecutor: Send + Sync {
    fn execute(&self, action: &ActionDescriptor, result: &ValidationResult) -> Result<()>;
}

// ============================================================================
// BUILT-IN EXECUTOR
// ============================================================================

/// Supports `log` (level, message) and `counter` (name)
#[derive(Debug, Default)]
pub struct TracingActionExecutor {
    counters: Mutex<HashMap<String, u64>>,
}

impl TracingActionExecutor {
    pub fn new() -> Self {
        TracingActionExecutor::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn counters(&self) -> HashMap<String, u64> {
        self.counters.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl ActionExecutor for TracingActionExecutor {
    fn execute(&self, action: &ActionDescriptor, result: &ValidationResult) -> Result<()> {
        match action.action_type.as_str() {
            "log" => {
                let template = action.param_str("message").unwrap_or("Rule {ruleCode} {status}");
                let message = render_template(template, |key| match key {
                    "ruleCode" => Some(result.rule_code.clone()),
                    "ruleName" => Some(result.rule_name.clone()),
                    "status" => Some(result.status.to_string()),
                    "errorCount" => Some(result.errors.len().to_string()),
                    _ => None,
                });
                let rule = result.rule_code.as_str();
                match action.param_str("level").unwrap_or("info") {
                    "trace" => trace!(rule, "{}", message),
                    "debug" => debug!(rule, "{}", message),
                    "info" => info!(rule, "{}", message),
                    "warn" => warn!(rule, "{}", message),
                    "error" => error!(rule, "{}", message),
                    other => bail!("unknown log level '{}'", other),
                }
                Ok(())
            }
            "counter" => {
                let name = action
                    .param_str("name")
                    .ok_or_else(|| anyhow!("counter action needs a 'name'"))?;
                *self
                    .counters
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .entry(name.to_string())
                    .or_insert(0) += 1;
                Ok(())
            }
            other => bail!("unknown action type '{}'", other),
        }
    }
}

/// Run the on-pass or on-fail list for a resolved rule.
///
/// Skipped and cancelled rules run nothing. Failures and panics are logged and dropped.
pub fn run_actions(executor: &dyn ActionExecutor, rule: &RuleDefinition, result: &ValidationResult) {
    let actions = match result.status {
        RuleStatus::Passed => &rule.actions.on_pass,
        RuleStatus::Failed | RuleStatus::Error => &rule.actions.on_fail,
        RuleStatus::Skipped | RuleStatus::Cancelled => return,
    };

    for action in actions {
        match catch_unwind(AssertUnwindSafe(|| executor.execute(action, result))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(rule = %rule.code, action = %action.action_type, error = %e, "action failed");
            }
            Err(_) => {
                warn!(rule = %rule.code, action = %action.action_type, "action panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::ValidationResult;
    use crate::rules::{ActionSet, ValidationKind};
    use chrono::NaiveDate;
    use serde_json::json;
    use std::time::Duration;

    fn rule() -> RuleDefinition {
        RuleDefinition::new(
            "R1",
            "rule",
            ValidationKind::FieldLength,
            json!({ "expectedLength": 77 }),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        )
        .with_actions(ActionSet {
            on_pass: vec![ActionDescriptor::new("counter").with_param("name", json!("passes"))],
            on_fail: vec![
                ActionDescriptor::new("explode"),
                ActionDescriptor::new("log").with_param("level", json!("warn")),
                ActionDescriptor::new("counter").with_param("name", json!("failures")),
            ],
        })
    }

    struct PanickingExecutor;

    impl ActionExecutor for PanickingExecutor {
        fn execute(&self, _action: &ActionDescriptor, _result: &ValidationResult) -> Result<()> {
            panic!("executor blew up");
        }
    }

    #[test]
    fn test_pass_and_fail_lists() {
        let executor = TracingActionExecutor::new();
        let rule = rule();

        let passed = ValidationResult::skipped(&rule, "x");
        run_actions(&executor, &rule, &passed);
        assert!(executor.counters().is_empty());

        let failed = ValidationResult::fault(&rule, "boom", Duration::ZERO);
        run_actions(&executor, &rule, &failed);
        // unknown "explode" fails, later actions still run
        assert_eq!(executor.counter("failures"), 1);
        assert_eq!(executor.counter("passes"), 0);
    }

    #[test]
    fn test_panicking_executor_is_contained() {
        let rule = rule();
        let failed = ValidationResult::fault(&rule, "boom", Duration::ZERO);
        run_actions(&PanickingExecutor, &rule, &failed);
        assert_eq!(failed.status, RuleStatus::Error);
    }

    #[test]
    fn test_counter_requires_name() {
        let executor = TracingActionExecutor::new();
        let result = ValidationResult::skipped(&rule(), "x");
        assert!(executor.execute(&ActionDescriptor::new("counter"), &result).is_err());
        assert!(executor
            .execute(&ActionDescriptor::new("log").with_param("level", json!("loud")), &result)
            .is_err());
    }
}
