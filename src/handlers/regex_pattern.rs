// 🔤 RegexPattern
// Rendered field value must match an anchored pattern

use super::{error_for, kind_mismatch, records_in_scope, render_message, RuleRun, ValidationHandler};
use crate::compiler::ValidationSpec;
use crate::context::ValidationContext;
use crate::error::RuleFault;
use crate::rules::ValidationKind;

const DEFAULT_MESSAGE: &str = "Field '{field}' value '{value}' does not match pattern '{pattern}'";

pub struct RegexPatternHandler;

impl ValidationHandler for RegexPatternHandler {
    fn kind(&self) -> ValidationKind {
        ValidationKind::RegexPattern
    }

    fn validate(&self, spec: &ValidationSpec, ctx: &ValidationContext, run: &mut RuleRun) -> Result<(), RuleFault> {
        let ValidationSpec::RegexPattern(config) = spec else {
            return Err(kind_mismatch(self.kind(), spec));
        };

        for record in records_in_scope(ctx, &config.common) {
            run.checkpoint()?;

            let Some(value) = record.field(&config.field) else {
                continue;
            };
            let rendered = value.render();

            if (config.allow_empty && rendered.trim().is_empty()) || config.regex.is_match(&rendered) {
                run.pass();
                continue;
            }

            let message = render_message(
                config.common.message_or(DEFAULT_MESSAGE),
                Some(record),
                &[
                    ("field", config.field.clone()),
                    ("value", rendered),
                    ("pattern", config.pattern.clone()),
                ],
            );
            if !run.fail(error_for(record, message, &config.common)) {
                break;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_validation;
    use crate::handlers::test_support::{context, detail};
    use crate::result::RuleOutcome;
    use crate::rules::ValidationDefinition;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn run_rule(params: serde_json::Value, lines: &[String]) -> RuleOutcome {
        let spec = compile_validation(&ValidationDefinition {
            kind: ValidationKind::RegexPattern,
            parameters: params,
        })
        .unwrap();
        let ctx = context(lines);
        let mut run = RuleRun::new(1000, CancellationToken::new(), 256);
        RegexPatternHandler.validate(&spec, &ctx, &mut run).unwrap();
        run.into_outcome()
    }

    #[test]
    fn test_whole_value_must_match() {
        let outcome = run_rule(
            json!({ "field": "currency", "pattern": "[A-Z]{3}" }),
            &[detail("A", 1, "MXN"), detail("A", 1, "mx1"), detail("A", 1, "US")],
        );

        let errors = outcome.errors.into_errors();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].line_number, 2);
        assert!(errors[0].message.contains("mx1"));
        assert_eq!(errors[1].line_number, 3);
    }

    #[test]
    fn test_allow_empty() {
        let lines = [detail("", 1, "MXN")];
        let strict = run_rule(json!({ "field": "account", "pattern": "ACC[0-9]+" }), &lines);
        assert_eq!(strict.errors.len(), 1);

        let lenient = run_rule(
            json!({ "field": "account", "pattern": "ACC[0-9]+", "allowEmpty": true }),
            &lines,
        );
        assert!(lenient.errors.is_empty());
    }

    #[test]
    fn test_currency_rendering_is_matched() {
        let outcome = run_rule(
            json!({ "field": "amount", "pattern": "-?[0-9]+\\.[0-9]{2}" }),
            &[detail("A", 123456, "MXN"), detail("A", -5, "MXN")],
        );
        assert!(outcome.errors.is_empty());
    }
}
