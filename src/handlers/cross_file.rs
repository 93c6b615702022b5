// 🔗 CrossFileValidation
// Join against a related file's records by key; optionally reconcile per-key amounts

use super::{error_for, kind_mismatch, records_in_scope, render_message, RuleRun, ValidationHandler};
use crate::compiler::{CrossFileConfig, ValidationSpec};
use crate::context::ValidationContext;
use crate::error::RuleFault;
use crate::parser::FileRecord;
use crate::rules::ValidationKind;
use std::collections::HashMap;

const MISSING_KEY: &str = "Key '{key}' not found in related file '{relatedFileId}'";
const AMOUNT_MISMATCH: &str =
    "Amount mismatch for key '{key}': {amount} vs {relatedAmount} in '{relatedFileId}' (tolerance {tolerance})";

pub struct CrossFileHandler;

/// First record carrying a key, plus the running amount for that key
struct KeyTotal<'a> {
    first: &'a FileRecord,
    amount: f64,
}

fn key_of(record: &FileRecord, field: &str) -> Option<String> {
    let key = record.field(field)?.render().trim().to_string();
    (!key.is_empty()).then_some(key)
}

fn amount_of(record: &FileRecord, field: &str) -> Result<f64, RuleFault> {
    match record.field(field) {
        Some(value) => value.as_f64().ok_or_else(|| {
            RuleFault::Other(format!(
                "amount field '{}' on line {} is not numeric",
                field, record.line_number
            ))
        }),
        None => Ok(0.0),
    }
}

/// key → summed amount on the related side
fn related_totals(config: &CrossFileConfig, related: &[FileRecord]) -> Result<HashMap<String, f64>, RuleFault> {
    let mut totals = HashMap::new();
    for record in related.iter().filter(|r| r.is_valid() && config.includes_related(&r.record_type)) {
        let Some(key) = key_of(record, config.related_key()) else {
            continue;
        };
        let amount = match config.related_amount() {
            Some(field) => amount_of(record, field)?,
            None => 0.0,
        };
        *totals.entry(key).or_insert(0.0) += amount;
    }
    Ok(totals)
}

impl ValidationHandler for CrossFileHandler {
    fn kind(&self) -> ValidationKind {
        ValidationKind::CrossFileValidation
    }

    fn validate(&self, spec: &ValidationSpec, ctx: &ValidationContext, run: &mut RuleRun) -> Result<(), RuleFault> {
        let ValidationSpec::CrossFile(config) = spec else {
            return Err(kind_mismatch(self.kind(), spec));
        };

        let related_id = config.resolve_related_id(&ctx.file_id);
        let related = related_totals(config, ctx.related_records(&related_id)?)?;

        let mut order: Vec<String> = Vec::new();
        let mut totals: HashMap<String, KeyTotal> = HashMap::new();

        for record in records_in_scope(ctx, &config.common) {
            run.checkpoint()?;

            let Some(key) = key_of(record, &config.key_field) else {
                continue;
            };

            if !related.contains_key(&key) {
                let message = render_message(
                    config.common.message_or(MISSING_KEY),
                    Some(record),
                    &[("key", key), ("relatedFileId", related_id.clone())],
                );
                if !run.fail(error_for(record, message, &config.common)) {
                    return Ok(());
                }
                continue;
            }

            run.pass();

            if let Some(field) = &config.amount_field {
                let amount = amount_of(record, field)?;
                match totals.get_mut(&key) {
                    Some(total) => total.amount += amount,
                    None => {
                        order.push(key.clone());
                        totals.insert(key, KeyTotal { first: record, amount });
                    }
                }
            }
        }

        // Reconcile per key, reported on the first line carrying it
        for key in order {
            let (Some(total), Some(related_amount)) = (totals.get(&key), related.get(&key)) else {
                continue;
            };
            let difference = (total.amount - related_amount).abs();
            if difference <= config.tolerance + 1e-9 {
                continue;
            }

            let message = render_message(
                AMOUNT_MISMATCH,
                Some(total.first),
                &[
                    ("key", key.clone()),
                    ("amount", format!("{:.2}", total.amount)),
                    ("relatedAmount", format!("{:.2}", related_amount)),
                    ("relatedFileId", related_id.clone()),
                    ("tolerance", config.tolerance.to_string()),
                ],
            );
            if !run.report(error_for(total.first, message, &config.common)) {
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
    use crate::handlers::test_support::{context, detail, records};
    use crate::result::RuleOutcome;
    use crate::rules::ValidationDefinition;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn run_rule(
        params: serde_json::Value,
        lines: &[String],
        related: Option<Result<Vec<String>, String>>,
    ) -> Result<RuleOutcome, RuleFault> {
        let spec = compile_validation(&ValidationDefinition {
            kind: ValidationKind::CrossFileValidation,
            parameters: params,
        })
        .unwrap();
        let mut ctx = context(lines);
        if let Some(related) = related {
            ctx = ctx.with_related_file("F1-R02", related.map(|lines| records(&lines)));
        }
        let mut run = RuleRun::new(1000, CancellationToken::new(), 256);
        CrossFileHandler.validate(&spec, &ctx, &mut run)?;
        Ok(run.into_outcome())
    }

    #[test]
    fn test_missing_keys_reported() {
        let outcome = run_rule(
            json!({ "relatedFileId": "{fileId}-R02", "keyField": "account" }),
            &[detail("ACC1", 1, "MXN"), detail("ACC9", 1, "MXN")],
            Some(Ok(vec![detail("ACC1", 1, "MXN")])),
        )
        .unwrap();

        let errors = outcome.errors.into_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].line_number, 2);
        assert!(errors[0].message.contains("ACC9"));
        assert!(errors[0].message.contains("F1-R02"));
    }

    #[test]
    fn test_amount_reconciliation_with_tolerance() {
        let params = json!({
            "relatedFileId": "{fileId}-R02",
            "keyField": "account",
            "amountField": "amount",
            "tolerance": 0.5
        });
        let primary = [
            detail("ACC1", 1000, "MXN"),
            detail("ACC2", 500, "MXN"),
            detail("ACC1", 1000, "MXN"),
        ];
        let related = vec![
            detail("ACC1", 2030, "MXN"),
            detail("ACC2", 800, "MXN"),
        ];

        let outcome = run_rule(params, &primary, Some(Ok(related))).unwrap();

        // ACC1: 20.00 vs 20.30 within 0.5; ACC2: 5.00 vs 8.00 is not
        let errors = outcome.errors.into_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].line_number, 2);
        assert!(errors[0].message.contains("5.00 vs 8.00"));
        assert_eq!(outcome.records_failed, 0);
    }

    #[test]
    fn test_unavailable_related_file_faults() {
        let err = run_rule(
            json!({ "relatedFileId": "{fileId}-R02", "keyField": "account" }),
            &[detail("ACC1", 1, "MXN")],
            Some(Err("file not found".into())),
        )
        .unwrap_err();
        assert!(matches!(err, RuleFault::MissingRelatedFile { .. }));

        let err = run_rule(
            json!({ "relatedFileId": "{fileId}-R02", "keyField": "account" }),
            &[detail("ACC1", 1, "MXN")],
            None,
        )
        .unwrap_err();
        assert!(matches!(err, RuleFault::MissingRelatedFile { .. }));
    }
}
