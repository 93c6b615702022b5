// 🔀 Condition Evaluator
// Pure, deterministic applicability check of a rule against pass metadata

use crate::context::ValidationContext;
use crate::expression::{compare_values, values_equal, Value};
use crate::rules::{Combinator, Comparison, Condition, Operator};
use std::cmp::Ordering;

/// Resolved metadata field
enum Operand {
    Scalar(Value),
    List(Vec<Value>),
}

/// Evaluate a condition tree. An absent condition means the rule always applies.
pub fn evaluate_condition(condition: &Condition, ctx: &ValidationContext) -> bool {
    match condition {
        Condition::Group(group) => {
            let mut results = group.conditions.iter().map(|c| evaluate_condition(c, ctx));
            match group.combinator {
                Combinator::All => results.all(|r| r),
                Combinator::Any => results.any(|r| r),
                Combinator::None => !results.any(|r| r),
            }
        }
        Condition::Comparison(cmp) => evaluate_comparison(cmp, ctx),
    }
}

/// `None` condition is always applicable
pub fn is_applicable(condition: Option<&Condition>, ctx: &ValidationContext) -> bool {
    condition.map_or(true, |c| evaluate_condition(c, ctx))
}

fn resolve(field: &str, ctx: &ValidationContext) -> Operand {
    let scalar = match field.to_ascii_lowercase().as_str() {
        "fileid" => Value::Text(ctx.file_id.clone()),
        "filetype" => Value::Text(ctx.file_type.clone()),
        "operativedate" => Value::Date(ctx.operative_date),
        "asofdate" => Value::Date(ctx.as_of),
        "recordcount" => Value::Number(ctx.record_count() as f64),
        "invalidrecordcount" => Value::Number(ctx.invalid_record_count() as f64),
        "recordtypes" => {
            return Operand::List(
                ctx.record_types()
                    .into_iter()
                    .map(|t| Value::Text(t.to_string()))
                    .collect(),
            )
        }
        _ => Value::Null,
    };
    Operand::Scalar(scalar)
}

fn expected_values(value: &serde_json::Value) -> Vec<Value> {
    match value {
        serde_json::Value::Array(items) => items.iter().map(Value::from_json).collect(),
        other => vec![Value::from_json(other)],
    }
}

fn evaluate_comparison(cmp: &Comparison, ctx: &ValidationContext) -> bool {
    let operand = resolve(&cmp.field, ctx);

    if cmp.operator == Operator::Exists {
        let present = match &operand {
            Operand::Scalar(v) => !v.is_null(),
            Operand::List(items) => !items.is_empty(),
        };
        let wanted = cmp.value.as_bool().unwrap_or(true);
        return present == wanted;
    }

    match operand {
        Operand::Scalar(Value::Null) => matches!(cmp.operator, Operator::NotEquals | Operator::NotIn),
        Operand::Scalar(actual) => compare_scalar(&actual, cmp),
        Operand::List(items) => compare_list(&items, cmp),
    }
}

fn compare_scalar(actual: &Value, cmp: &Comparison) -> bool {
    let expected = Value::from_json(&cmp.value);
    let ordered = |test: fn(Ordering) -> bool| {
        matches!(compare_values(actual, &expected), Ok(Some(o)) if test(o))
    };

    match cmp.operator {
        Operator::Equals => values_equal(actual, &expected),
        Operator::NotEquals => !values_equal(actual, &expected),
        Operator::In => expected_values(&cmp.value).iter().any(|v| values_equal(actual, v)),
        Operator::NotIn => !expected_values(&cmp.value).iter().any(|v| values_equal(actual, v)),
        Operator::GreaterThan => ordered(|o| o == Ordering::Greater),
        Operator::GreaterThanOrEqual => ordered(|o| o != Ordering::Less),
        Operator::LessThan => ordered(|o| o == Ordering::Less),
        Operator::LessThanOrEqual => ordered(|o| o != Ordering::Greater),
        Operator::Contains => match (actual, &expected) {
            (Value::Text(haystack), Value::Text(needle)) => haystack.contains(needle.as_str()),
            _ => false,
        },
        Operator::Exists => true,
    }
}

/// Set-valued fields: Equals/Contains test membership, In/NotIn test overlap
fn compare_list(items: &[Value], cmp: &Comparison) -> bool {
    let expected = expected_values(&cmp.value);
    let overlaps = || items.iter().any(|i| expected.iter().any(|e| values_equal(i, e)));
    let covers = || expected.iter().all(|e| items.iter().any(|i| values_equal(i, e)));

    match cmp.operator {
        Operator::Equals | Operator::Contains => covers(),
        Operator::NotEquals => !covers(),
        Operator::In => overlaps(),
        Operator::NotIn => !overlaps(),
        _ => {
            let count = Value::Number(items.len() as f64);
            compare_scalar(&count, cmp)
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::FileRecord;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn ctx() -> ValidationContext {
        let record = |line: usize, rt: &str| FileRecord {
            line_number: line,
            raw_line: String::new(),
            record_type: rt.to_string(),
            fields: BTreeMap::new(),
            structural_error: None,
        };
        ValidationContext::new(
            "F-2024-01",
            "R01",
            NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            vec![record(1, "01"), record(2, "01"), record(3, "02")],
        )
    }

    fn cmp(field: &str, operator: Operator, value: serde_json::Value) -> Condition {
        Condition::compare(field, operator, value)
    }

    #[test]
    fn test_scalar_operators() {
        let ctx = ctx();
        assert!(evaluate_condition(&cmp("fileType", Operator::Equals, json!("R01")), &ctx));
        assert!(evaluate_condition(&cmp("fileType", Operator::In, json!(["R02", "R01"])), &ctx));
        assert!(evaluate_condition(&cmp("fileType", Operator::NotIn, json!(["R02"])), &ctx));
        assert!(evaluate_condition(&cmp("recordCount", Operator::GreaterThan, json!(2)), &ctx));
        assert!(!evaluate_condition(&cmp("recordCount", Operator::LessThan, json!(3)), &ctx));
        assert!(evaluate_condition(&cmp("operativeDate", Operator::GreaterThanOrEqual, json!("2024-01-01")), &ctx));
        assert!(evaluate_condition(&cmp("fileId", Operator::Contains, json!("2024")), &ctx));
    }

    #[test]
    fn test_record_types_set() {
        let ctx = ctx();
        assert!(evaluate_condition(&cmp("recordTypes", Operator::Contains, json!("02")), &ctx));
        assert!(evaluate_condition(&cmp("recordTypes", Operator::In, json!(["03", "02"])), &ctx));
        assert!(!evaluate_condition(&cmp("recordTypes", Operator::Contains, json!("03")), &ctx));
        assert!(evaluate_condition(&cmp("recordTypes", Operator::Exists, json!(true)), &ctx));
    }

    #[test]
    fn test_unknown_field_is_null() {
        let ctx = ctx();
        assert!(!evaluate_condition(&cmp("nope", Operator::Equals, json!("x")), &ctx));
        assert!(evaluate_condition(&cmp("nope", Operator::NotEquals, json!("x")), &ctx));
        assert!(evaluate_condition(&cmp("nope", Operator::NotIn, json!(["x"])), &ctx));
        assert!(!evaluate_condition(&cmp("nope", Operator::GreaterThan, json!(1)), &ctx));
        assert!(!evaluate_condition(&cmp("nope", Operator::Exists, json!(true)), &ctx));
        assert!(evaluate_condition(&cmp("nope", Operator::Exists, json!(false)), &ctx));
    }

    #[test]
    fn test_combinators() {
        let ctx = ctx();
        let t = cmp("fileType", Operator::Equals, json!("R01"));
        let f = cmp("fileType", Operator::Equals, json!("R99"));

        assert!(evaluate_condition(&Condition::all(vec![t.clone(), t.clone()]), &ctx));
        assert!(!evaluate_condition(&Condition::all(vec![t.clone(), f.clone()]), &ctx));
        assert!(evaluate_condition(&Condition::any(vec![f.clone(), t.clone()]), &ctx));
        assert!(!evaluate_condition(&Condition::none(vec![f.clone(), t.clone()]), &ctx));
        assert!(evaluate_condition(&Condition::none(vec![f.clone()]), &ctx));

        // empty groups
        assert!(evaluate_condition(&Condition::all(vec![]), &ctx));
        assert!(!evaluate_condition(&Condition::any(vec![]), &ctx));
        assert!(evaluate_condition(&Condition::none(vec![]), &ctx));

        // nesting
        let nested = Condition::all(vec![t, Condition::none(vec![f])]);
        assert!(evaluate_condition(&nested, &ctx));
    }

    #[test]
    fn test_evaluation_is_idempotent() {
        let ctx = ctx();
        let condition = Condition::any(vec![
            cmp("recordCount", Operator::GreaterThan, json!(100)),
            cmp("recordTypes", Operator::Contains, json!("01")),
        ]);
        let first = evaluate_condition(&condition, &ctx);
        let second = evaluate_condition(&condition, &ctx);
        assert_eq!(first, second);
        assert!(first);
        assert!(is_applicable(None, &ctx));
    }
}
