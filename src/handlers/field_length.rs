// 📏 FieldLength
// Rendered length of one field (or of the whole raw line) against an expected length

use super::{error_for, kind_mismatch, render_message, RuleRun, ValidationHandler};
use crate::compiler::ValidationSpec;
use crate::context::ValidationContext;
use crate::error::RuleFault;
use crate::rules::ValidationKind;

const LINE_MESSAGE: &str = "Line length is {actualLength}, expected {expectedLength}";
const FIELD_MESSAGE: &str = "Field '{field}' length is {actualLength}, expected {expectedLength}";

pub struct FieldLengthHandler;

impl ValidationHandler for FieldLengthHandler {
    fn kind(&self) -> ValidationKind {
        ValidationKind::FieldLength
    }

    fn validate(&self, spec: &ValidationSpec, ctx: &ValidationContext, run: &mut RuleRun) -> Result<(), RuleFault> {
        let ValidationSpec::FieldLength(config) = spec else {
            return Err(kind_mismatch(self.kind(), spec));
        };

        let template = match &config.field {
            Some(_) => config.common.message_or(FIELD_MESSAGE),
            None => config.common.message_or(LINE_MESSAGE),
        };

        for record in &ctx.records {
            run.checkpoint()?;

            if !config.common.applies_to(&record.record_type) {
                continue;
            }

            // Whole-line checks also see structurally invalid lines
            let actual = match &config.field {
                None => record.line_length(),
                Some(name) => {
                    let Some(value) = record.field(name).filter(|_| record.is_valid()) else {
                        continue;
                    };
                    value.render().chars().count()
                }
            };

            if actual == config.expected_length {
                run.pass();
                continue;
            }

            let message = render_message(
                template,
                Some(record),
                &[
                    ("actualLength", actual.to_string()),
                    ("expectedLength", config.expected_length.to_string()),
                    ("field", config.field.clone().unwrap_or_default()),
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
    use crate::handlers::test_support::{context, detail, note};
    use crate::result::Severity;
    use crate::rules::ValidationDefinition;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn run_rule(params: serde_json::Value, lines: &[String]) -> crate::result::RuleOutcome {
        let spec = compile_validation(&ValidationDefinition {
            kind: ValidationKind::FieldLength,
            parameters: params,
        })
        .unwrap();
        let ctx = context(lines);
        let mut run = RuleRun::new(1000, CancellationToken::new(), 256);
        FieldLengthHandler.validate(&spec, &ctx, &mut run).unwrap();
        run.into_outcome()
    }

    #[test]
    fn test_short_line_reports_actual_and_expected() {
        let short = "01SHORT".to_string() + &" ".repeat(43);
        let outcome = run_rule(json!({ "expectedLength": 77 }), &[detail("ACC1", 1, "MXN"), short]);

        let errors = outcome.errors.into_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].line_number, 2);
        assert!(errors[0].message.contains("50"));
        assert!(errors[0].message.contains("77"));
        assert_eq!(errors[0].severity, Severity::Error);
        assert_eq!(outcome.records_validated, 2);
        assert_eq!(outcome.records_failed, 1);
    }

    #[test]
    fn test_named_field_with_custom_message() {
        let outcome = run_rule(
            json!({
                "field": "account",
                "expectedLength": 4,
                "recordTypes": ["01"],
                "severity": "Warning",
                "message": "{account} has {actualLength} chars"
            }),
            &[detail("ACC1", 1, "MXN"), detail("ACC10", 1, "MXN"), note("ignored")],
        );

        let errors = outcome.errors.into_errors();
        assert_eq!(outcome.records_validated, 2);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "ACC10 has 5 chars");
        assert_eq!(errors[0].severity, Severity::Warning);
        assert!(errors[0].raw_record.as_deref().unwrap().starts_with("01ACC10"));
    }

    #[test]
    fn test_stops_after_cap() {
        let lines: Vec<String> = (0..1500).map(|_| "01X".to_string()).collect();
        let outcome = run_rule(json!({ "expectedLength": 77 }), &lines);

        assert!(outcome.errors.is_truncated());
        assert_eq!(outcome.records_failed, 1001);
        let errors = outcome.errors.into_errors();
        assert_eq!(errors.len(), 1001);
        assert_eq!(errors[1000].severity, Severity::Warning);
    }
}
