// 🧮 CustomExpression
// Per-record derived variables + boolean check, then an optional file-level aggregation

use super::{error_for, kind_mismatch, render_message, RecordScope, RuleRun, ValidationHandler};
use crate::compiler::{AggregateFunction, AggregationSpec, CommonParams, CustomExpressionSpec, ValidationSpec};
use crate::context::ValidationContext;
use crate::error::{ExpressionError, RuleFault};
use crate::expression::{compare_values, render_template, Value};
use crate::parser::FileRecord;
use crate::result::ValidationError;
use crate::rules::ValidationKind;
use std::cmp::Ordering;
use std::collections::HashMap;

const RECORD_MESSAGE: &str = "Expression check failed at line {lineNumber}";

pub struct CustomExpressionHandler;

impl ValidationHandler for CustomExpressionHandler {
    fn kind(&self) -> ValidationKind {
        ValidationKind::CustomExpression
    }

    fn validate(&self, spec: &ValidationSpec, ctx: &ValidationContext, run: &mut RuleRun) -> Result<(), RuleFault> {
        let ValidationSpec::CustomExpression(custom) = spec else {
            return Err(kind_mismatch(self.kind(), spec));
        };

        let mut totals: Vec<Accumulator> = custom
            .aggregation
            .iter()
            .flat_map(|agg| agg.aggregates.iter())
            .map(|a| Accumulator::new(a.function))
            .collect();
        let mut checking = custom.check.is_some();

        for record in ctx.records.iter().filter(|r| r.is_valid()) {
            run.checkpoint()?;

            let in_scope = custom.common.applies_to(&record.record_type);
            let feeds_aggregate = custom.aggregation.as_ref().is_some_and(|agg| {
                agg.aggregates.iter().any(|a| aggregate_applies(a.record_types.as_deref(), &custom.common, record))
            });
            if !(in_scope && checking) && !feeds_aggregate {
                continue;
            }

            let variables = bind_variables(custom, ctx, record)?;
            let scope = RecordScope { ctx, record, variables: &variables };

            if in_scope && checking {
                if let Some(check) = &custom.check {
                    let ok = check.eval_bool(&scope).map_err(|e| at_line(record, e))?;
                    if ok {
                        run.pass();
                    } else {
                        let bindings: Vec<(&str, String)> =
                            variables.iter().map(|(k, v)| (k.as_str(), v.to_string())).collect();
                        let message = render_message(custom.common.message_or(RECORD_MESSAGE), Some(record), &bindings);
                        // Past the cap only the aggregation still needs records
                        checking = run.fail(error_for(record, message, &custom.common));
                    }
                }
            }

            if let Some(agg) = &custom.aggregation {
                for (aggregate, total) in agg.aggregates.iter().zip(totals.iter_mut()) {
                    if !aggregate_applies(aggregate.record_types.as_deref(), &custom.common, record) {
                        continue;
                    }
                    let value = match &aggregate.expression {
                        Some(expr) => expr.eval(&scope).map_err(|e| at_line(record, e))?,
                        None => Value::Bool(true),
                    };
                    total.add(value).map_err(|e| at_line(record, e))?;
                }
            }

            if !checking && custom.aggregation.is_none() {
                break;
            }
        }

        if let Some(agg) = &custom.aggregation {
            check_aggregation(agg, totals, ctx, run)?;
        }

        Ok(())
    }
}

fn at_line(record: &FileRecord, source: ExpressionError) -> RuleFault {
    RuleFault::Expression {
        line: record.line_number,
        source,
    }
}

fn aggregate_applies(types: Option<&[String]>, common: &CommonParams, record: &FileRecord) -> bool {
    match types {
        Some(types) => types.iter().any(|t| *t == record.record_type),
        None => common.applies_to(&record.record_type),
    }
}

fn bind_variables(
    custom: &CustomExpressionSpec,
    ctx: &ValidationContext,
    record: &FileRecord,
) -> Result<HashMap<String, Value>, RuleFault> {
    let mut variables = HashMap::with_capacity(custom.variables.len());
    for (name, expr) in &custom.variables {
        let value = expr
            .eval(&RecordScope { ctx, record, variables: &variables })
            .map_err(|e| at_line(record, e))?;
        variables.insert(name.clone(), value);
    }
    Ok(variables)
}

fn check_aggregation(
    agg: &AggregationSpec,
    totals: Vec<Accumulator>,
    ctx: &ValidationContext,
    run: &mut RuleRun,
) -> Result<(), RuleFault> {
    let bound: HashMap<String, Value> = agg
        .aggregates
        .iter()
        .zip(totals)
        .map(|(a, t)| (a.name.clone(), t.finish()))
        .collect();

    let lookup = |name: &str| bound.get(name).cloned().or_else(|| ctx.pass_value(name));
    let ok = agg
        .check
        .eval_bool(&lookup)
        .map_err(|source| RuleFault::Expression { line: 0, source })?;

    if !ok {
        let message = match &agg.message {
            Some(template) => render_template(template, |k| bound.get(k).map(|v| v.to_string())),
            None => {
                let mut pairs: Vec<String> = bound.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                pairs.sort();
                format!("Aggregation check failed ({})", pairs.join(", "))
            }
        };
        run.report(ValidationError::file_level(message, agg.severity));
    }

    Ok(())
}

// ============================================================================
// AGGREGATE ACCUMULATOR
// ============================================================================

struct Accumulator {
    function: AggregateFunction,
    sum: f64,
    count: usize,
    best: Option<Value>,
}

impl Accumulator {
    fn new(function: AggregateFunction) -> Self {
        Accumulator {
            function,
            sum: 0.0,
            count: 0,
            best: None,
        }
    }

    /// Nulls are ignored by every function
    fn add(&mut self, value: Value) -> Result<(), ExpressionError> {
        if value.is_null() {
            return Ok(());
        }
        match self.function {
            AggregateFunction::Count => self.count += 1,
            AggregateFunction::Sum | AggregateFunction::Avg => {
                let n = value.as_number().ok_or_else(|| {
                    ExpressionError::TypeMismatch(format!("cannot aggregate non-numeric value '{}'", value))
                })?;
                self.sum += n;
                self.count += 1;
            }
            AggregateFunction::Min | AggregateFunction::Max => {
                let wanted = if self.function == AggregateFunction::Min {
                    Ordering::Less
                } else {
                    Ordering::Greater
                };
                let replace = match &self.best {
                    None => true,
                    Some(current) => compare_values(&value, current)? == Some(wanted),
                };
                if replace {
                    self.best = Some(value);
                }
            }
        }
        Ok(())
    }

    fn finish(self) -> Value {
        match self.function {
            AggregateFunction::Count => Value::Number(self.count as f64),
            AggregateFunction::Sum => Value::Number(self.sum),
            AggregateFunction::Avg if self.count == 0 => Value::Null,
            AggregateFunction::Avg => Value::Number(self.sum / self.count as f64),
            AggregateFunction::Min | AggregateFunction::Max => self.best.unwrap_or(Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_validation;
    use crate::handlers::test_support::{context, detail, note};
    use crate::result::{RuleOutcome, Severity};
    use crate::rules::ValidationDefinition;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn run_rule(params: serde_json::Value, lines: &[String]) -> Result<RuleOutcome, RuleFault> {
        let spec = compile_validation(&ValidationDefinition {
            kind: ValidationKind::CustomExpression,
            parameters: params,
        })
        .unwrap();
        let ctx = context(lines);
        let mut run = RuleRun::new(1000, CancellationToken::new(), 256);
        CustomExpressionHandler.validate(&spec, &ctx, &mut run)?;
        Ok(run.into_outcome())
    }

    #[test]
    fn test_variables_and_message_interpolation() {
        let outcome = run_rule(
            json!({
                "variables": [
                    { "name": "units", "expression": "amount" },
                    { "name": "big", "expression": "units > 100" }
                ],
                "expression": "not big",
                "recordTypes": ["01"],
                "message": "{account}: {units} exceeds limit on line {lineNumber}"
            }),
            &[detail("ACC1", 5000, "MXN"), detail("ACC2", 25000, "MXN"), note("skip me")],
        )
        .unwrap();

        assert_eq!(outcome.records_validated, 2);
        let errors = outcome.errors.into_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "ACC2: 250 exceeds limit on line 2");
    }

    #[test]
    fn test_context_names() {
        let outcome = run_rule(
            json!({ "expression": "$fileType == 'R01' && $recordType == '01' && date <= $operativeDate" }),
            &[detail("ACC1", 1, "MXN")],
        )
        .unwrap();
        assert!(outcome.errors.is_empty());
    }

    #[test]
    fn test_aggregation_appends_file_level_error() {
        let outcome = run_rule(
            json!({
                "recordTypes": ["01"],
                "aggregation": {
                    "aggregates": [
                        { "name": "total", "function": "sum", "expression": "amount" },
                        { "name": "lines", "function": "count" },
                        { "name": "largest", "function": "max", "expression": "amount" }
                    ],
                    "expression": "total == 0",
                    "message": "Net {total} over {lines} lines (max {largest})",
                    "severity": "Critical"
                }
            }),
            &[detail("ACC1", 1000, "MXN"), detail("ACC2", -250, "MXN"), note("n")],
        )
        .unwrap();

        let errors = outcome.errors.into_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].line_number, 0);
        assert_eq!(errors[0].severity, Severity::Critical);
        assert_eq!(errors[0].message, "Net 7.5 over 2 lines (max 10)");
    }

    #[test]
    fn test_balanced_aggregation_passes() {
        let outcome = run_rule(
            json!({
                "aggregation": {
                    "aggregates": [
                        { "name": "debits", "function": "sum", "expression": "amount", "recordTypes": ["01"] },
                        { "name": "avgAmount", "function": "avg", "expression": "amount", "recordTypes": ["01"] }
                    ],
                    "expression": "abs(debits) < 0.01 && avgAmount == 0"
                }
            }),
            &[detail("ACC1", 500, "MXN"), detail("ACC2", -500, "MXN")],
        )
        .unwrap();
        assert!(outcome.errors.is_empty());
    }

    #[test]
    fn test_evaluation_fault_names_line() {
        let err = run_rule(
            json!({ "expression": "amount / 0 > 1" }),
            &[detail("ACC1", 100, "MXN")],
        )
        .unwrap_err();

        assert!(matches!(
            err,
            RuleFault::Expression { line: 1, source: ExpressionError::DivisionByZero }
        ));
    }

    #[test]
    fn test_unknown_identifier_is_fault() {
        let err = run_rule(json!({ "expression": "nonexistent > 1" }), &[detail("ACC1", 100, "MXN")]).unwrap_err();
        assert!(matches!(err, RuleFault::Expression { source: ExpressionError::UnknownIdentifier(_), .. }));
    }
}
