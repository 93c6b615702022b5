// 📊 RangeCheck
// Numeric (or currency, in units) field values within configured bounds

use super::{error_for, kind_mismatch, records_in_scope, render_message, RuleRun, ValidationHandler};
use crate::compiler::ValidationSpec;
use crate::context::ValidationContext;
use crate::error::RuleFault;
use crate::parser::FieldValue;
use crate::rules::ValidationKind;

const OUT_OF_RANGE: &str = "Field '{field}' value {value} is outside {range}";
const NOT_NUMERIC: &str = "Field '{field}' value '{value}' is not numeric";

pub struct RangeCheckHandler;

fn numeric(value: &FieldValue) -> Option<f64> {
    match value {
        FieldValue::Text(s) => s.trim().parse().ok(),
        other => other.as_f64(),
    }
}

impl ValidationHandler for RangeCheckHandler {
    fn kind(&self) -> ValidationKind {
        ValidationKind::RangeCheck
    }

    fn validate(&self, spec: &ValidationSpec, ctx: &ValidationContext, run: &mut RuleRun) -> Result<(), RuleFault> {
        let ValidationSpec::RangeCheck(config) = spec else {
            return Err(kind_mismatch(self.kind(), spec));
        };

        let (open, close) = if config.exclusive { ("(", ")") } else { ("[", "]") };
        let range = format!(
            "{}{}, {}{}",
            open,
            config.min.map_or("-inf".to_string(), |m| m.to_string()),
            config.max.map_or("+inf".to_string(), |m| m.to_string()),
            close
        );

        for record in records_in_scope(ctx, &config.common) {
            run.checkpoint()?;

            let Some(value) = record.field(&config.field) else {
                continue;
            };

            let template = match numeric(value) {
                Some(n) if config.contains(n) => {
                    run.pass();
                    continue;
                }
                Some(_) => OUT_OF_RANGE,
                None => NOT_NUMERIC,
            };

            let message = render_message(
                config.common.message_or(template),
                Some(record),
                &[
                    ("field", config.field.clone()),
                    ("value", value.render()),
                    ("range", range.clone()),
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
            kind: ValidationKind::RangeCheck,
            parameters: params,
        })
        .unwrap();
        let ctx = context(lines);
        let mut run = RuleRun::new(1000, CancellationToken::new(), 256);
        RangeCheckHandler.validate(&spec, &ctx, &mut run).unwrap();
        run.into_outcome()
    }

    #[test]
    fn test_currency_bounds_in_units() {
        let outcome = run_rule(
            json!({ "field": "amount", "min": 0, "max": 100 }),
            &[
                detail("A", 0, "MXN"),
                detail("A", 10000, "MXN"),
                detail("A", 10001, "MXN"),
                detail("A", -1, "MXN"),
            ],
        );

        assert_eq!(outcome.records_validated, 4);
        let errors = outcome.errors.into_errors();
        assert_eq!(errors.iter().map(|e| e.line_number).collect::<Vec<_>>(), vec![3, 4]);
        assert!(errors[0].message.contains("100.01"));
        assert!(errors[0].message.contains("[0, 100]"));
    }

    #[test]
    fn test_exclusive_bounds() {
        let outcome = run_rule(
            json!({ "field": "amount", "min": 0, "exclusive": true }),
            &[detail("A", 0, "MXN"), detail("A", 1, "MXN")],
        );
        let errors = outcome.errors.into_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].line_number, 1);
    }

    #[test]
    fn test_non_numeric_is_error() {
        let outcome = run_rule(
            json!({ "field": "currency", "max": 10 }),
            &[detail("A", 0, "MXN"), detail("A", 0, "7")],
        );
        let errors = outcome.errors.into_errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("not numeric"));
    }
}
