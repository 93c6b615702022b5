// 🛠️ Rule Compiler
// Opaque parameter maps → typed validation specs, decoded once and cached by definition fingerprint

use crate::error::RuleConfigError;
use crate::expression::Expr;
use crate::result::Severity;
use crate::rules::{RuleDefinition, ValidationDefinition, ValidationKind};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

// ============================================================================
// SHARED PARAMETERS
// ============================================================================

/// Parameters every validation kind accepts
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonParams {
    /// Restrict the rule to these record types (absent = every valid record)
    #[serde(default)]
    pub record_types: Option<Vec<String>>,

    #[serde(default)]
    pub severity: Severity,

    /// Message template with `{placeholder}` interpolation
    #[serde(default)]
    pub message: Option<String>,
}

impl CommonParams {
    pub fn applies_to(&self, record_type: &str) -> bool {
        self.record_types
            .as_ref()
            .map_or(true, |types| types.iter().any(|t| t == record_type))
    }

    pub fn message_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.message.as_deref().unwrap_or(default)
    }
}

// ============================================================================
// PER-KIND CONFIGURATIONS
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldLengthConfig {
    /// Absent = measure the whole raw line
    #[serde(default)]
    pub field: Option<String>,
    pub expected_length: usize,
    #[serde(flatten)]
    pub common: CommonParams,
}

#[derive(Debug, Clone, Deserialize)]
struct VariableDef {
    name: String,
    expression: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Sum,
    Count,
    Min,
    Max,
    Avg,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AggregateDef {
    name: String,
    function: AggregateFunction,
    #[serde(default)]
    expression: Option<String>,
    #[serde(default)]
    record_types: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AggregationDef {
    aggregates: Vec<AggregateDef>,
    expression: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    severity: Severity,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CustomExpressionDef {
    #[serde(default)]
    variables: Vec<VariableDef>,
    #[serde(default)]
    expression: Option<String>,
    #[serde(default)]
    aggregation: Option<AggregationDef>,
    #[serde(flatten)]
    common: CommonParams,
}

#[derive(Debug, Clone)]
pub struct Aggregate {
    pub name: String,
    pub function: AggregateFunction,
    /// Absent only for `count`
    pub expression: Option<Expr>,
    pub record_types: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct AggregationSpec {
    pub aggregates: Vec<Aggregate>,
    pub check: Expr,
    pub message: Option<String>,
    pub severity: Severity,
}

#[derive(Debug, Clone)]
pub struct CustomExpressionSpec {
    /// Evaluated in order; later variables may use earlier ones
    pub variables: Vec<(String, Expr)>,
    pub check: Option<Expr>,
    pub aggregation: Option<AggregationSpec>,
    pub common: CommonParams,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupConfig {
    pub catalog: String,
    pub field: String,
    #[serde(default)]
    pub case_insensitive: bool,
    #[serde(default)]
    pub allow_empty: bool,
    #[serde(flatten)]
    pub common: CommonParams,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossFileConfig {
    /// May contain `{fileId}`
    pub related_file_id: String,
    pub key_field: String,
    #[serde(default)]
    pub related_key_field: Option<String>,
    #[serde(default)]
    pub related_record_types: Option<Vec<String>>,
    #[serde(default)]
    pub amount_field: Option<String>,
    #[serde(default)]
    pub related_amount_field: Option<String>,
    #[serde(default)]
    pub tolerance: f64,
    #[serde(flatten)]
    pub common: CommonParams,
}

impl CrossFileConfig {
    pub fn resolve_related_id(&self, file_id: &str) -> String {
        self.related_file_id.replace("{fileId}", file_id)
    }

    pub fn related_key(&self) -> &str {
        self.related_key_field.as_deref().unwrap_or(&self.key_field)
    }

    pub fn related_amount(&self) -> Option<&str> {
        self.related_amount_field
            .as_deref()
            .or(self.amount_field.as_deref())
    }

    pub fn includes_related(&self, record_type: &str) -> bool {
        self.related_record_types
            .as_ref()
            .map_or(true, |types| types.iter().any(|t| t == record_type))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegexDef {
    field: String,
    pattern: String,
    #[serde(default)]
    allow_empty: bool,
    #[serde(flatten)]
    common: CommonParams,
}

#[derive(Debug, Clone)]
pub struct RegexSpec {
    pub field: String,
    pub pattern: String,
    /// Anchored form of `pattern`
    pub regex: Regex,
    pub allow_empty: bool,
    pub common: CommonParams,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeConfig {
    pub field: String,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(flatten)]
    pub common: CommonParams,
}

impl RangeConfig {
    pub fn contains(&self, value: f64) -> bool {
        let above = match self.min {
            Some(min) if self.exclusive => value > min,
            Some(min) => value >= min,
            None => true,
        };
        let below = match self.max {
            Some(max) if self.exclusive => value < max,
            Some(max) => value <= max,
            None => true,
        };
        above && below
    }
}

// ============================================================================
// VALIDATION SPEC
// ============================================================================

/// One strongly typed variant per validation kind
#[derive(Debug, Clone)]
pub enum ValidationSpec {
    FieldLength(FieldLengthConfig),
    CustomExpression(CustomExpressionSpec),
    LookupExists(LookupConfig),
    CrossFile(CrossFileConfig),
    RegexPattern(RegexSpec),
    RangeCheck(RangeConfig),
}

impl ValidationSpec {
    pub fn kind(&self) -> ValidationKind {
        match self {
            ValidationSpec::FieldLength(_) => ValidationKind::FieldLength,
            ValidationSpec::CustomExpression(_) => ValidationKind::CustomExpression,
            ValidationSpec::LookupExists(_) => ValidationKind::LookupExists,
            ValidationSpec::CrossFile(_) => ValidationKind::CrossFileValidation,
            ValidationSpec::RegexPattern(_) => ValidationKind::RegexPattern,
            ValidationSpec::RangeCheck(_) => ValidationKind::RangeCheck,
        }
    }

    pub fn common(&self) -> &CommonParams {
        match self {
            ValidationSpec::FieldLength(c) => &c.common,
            ValidationSpec::CustomExpression(c) => &c.common,
            ValidationSpec::LookupExists(c) => &c.common,
            ValidationSpec::CrossFile(c) => &c.common,
            ValidationSpec::RegexPattern(c) => &c.common,
            ValidationSpec::RangeCheck(c) => &c.common,
        }
    }
}

fn decode<T: DeserializeOwned>(def: &ValidationDefinition) -> Result<T, RuleConfigError> {
    let params = if def.parameters.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        def.parameters.clone()
    };
    serde_json::from_value(params).map_err(|source| RuleConfigError::Parameters {
        kind: def.kind.name().to_string(),
        source,
    })
}

fn parse_expr(src: &str) -> Result<Expr, RuleConfigError> {
    Expr::parse(src).map_err(|source| RuleConfigError::Expression {
        expression: src.to_string(),
        source,
    })
}

/// Decode and check a validation definition
pub fn compile_validation(def: &ValidationDefinition) -> Result<ValidationSpec, RuleConfigError> {
    match def.kind {
        ValidationKind::FieldLength => {
            let config: FieldLengthConfig = decode(def)?;
            if config.expected_length == 0 {
                return Err(RuleConfigError::Invalid(
                    "expectedLength must be greater than zero".to_string(),
                ));
            }
            Ok(ValidationSpec::FieldLength(config))
        }
        ValidationKind::CustomExpression => compile_custom(decode(def)?),
        ValidationKind::LookupExists => {
            let config: LookupConfig = decode(def)?;
            if config.catalog.trim().is_empty() {
                return Err(RuleConfigError::Invalid("catalog name is empty".to_string()));
            }
            Ok(ValidationSpec::LookupExists(config))
        }
        ValidationKind::CrossFileValidation => {
            let config: CrossFileConfig = decode(def)?;
            if config.tolerance < 0.0 || !config.tolerance.is_finite() {
                return Err(RuleConfigError::Invalid(format!(
                    "tolerance must be a non-negative number, got {}",
                    config.tolerance
                )));
            }
            if config.related_amount_field.is_some() && config.amount_field.is_none() {
                return Err(RuleConfigError::Invalid(
                    "relatedAmountField requires amountField".to_string(),
                ));
            }
            Ok(ValidationSpec::CrossFile(config))
        }
        ValidationKind::RegexPattern => {
            let raw: RegexDef = decode(def)?;
            let regex = Regex::new(&format!("^(?:{})$", raw.pattern)).map_err(|source| {
                RuleConfigError::Pattern {
                    pattern: raw.pattern.clone(),
                    source,
                }
            })?;
            Ok(ValidationSpec::RegexPattern(RegexSpec {
                field: raw.field,
                pattern: raw.pattern,
                regex,
                allow_empty: raw.allow_empty,
                common: raw.common,
            }))
        }
        ValidationKind::RangeCheck => {
            let config: RangeConfig = decode(def)?;
            match (config.min, config.max) {
                (None, None) => {
                    return Err(RuleConfigError::Invalid(
                        "RangeCheck needs at least one of min or max".to_string(),
                    ))
                }
                (Some(min), Some(max)) if min > max => {
                    return Err(RuleConfigError::Invalid(format!(
                        "min ({}) is greater than max ({})",
                        min, max
                    )))
                }
                _ => {}
            }
            Ok(ValidationSpec::RangeCheck(config))
        }
    }
}

fn compile_custom(def: CustomExpressionDef) -> Result<ValidationSpec, RuleConfigError> {
    if def.expression.is_none() && def.aggregation.is_none() {
        return Err(RuleConfigError::Invalid(
            "CustomExpression needs an expression, an aggregation, or both".to_string(),
        ));
    }

    let variables = def
        .variables
        .iter()
        .map(|v| Ok((v.name.clone(), parse_expr(&v.expression)?)))
        .collect::<Result<Vec<_>, RuleConfigError>>()?;

    let check = def.expression.as_deref().map(parse_expr).transpose()?;

    let aggregation = match def.aggregation {
        Some(agg) => {
            let aggregates = agg
                .aggregates
                .into_iter()
                .map(|a| {
                    let expression = a.expression.as_deref().map(parse_expr).transpose()?;
                    if expression.is_none() && a.function != AggregateFunction::Count {
                        return Err(RuleConfigError::Invalid(format!(
                            "aggregate '{}' needs an expression",
                            a.name
                        )));
                    }
                    Ok(Aggregate {
                        name: a.name,
                        function: a.function,
                        expression,
                        record_types: a.record_types,
                    })
                })
                .collect::<Result<Vec<_>, RuleConfigError>>()?;

            Some(AggregationSpec {
                aggregates,
                check: parse_expr(&agg.expression)?,
                message: agg.message,
                severity: agg.severity,
            })
        }
        None => None,
    };

    Ok(ValidationSpec::CustomExpression(CustomExpressionSpec {
        variables,
        check,
        aggregation,
        common: def.common,
    }))
}

// ============================================================================
// COMPILED RULE CACHE
// ============================================================================

#[derive(Debug)]
pub struct CompiledRule {
    pub code: String,
    /// SHA-256 of the validation definition
    pub fingerprint: String,
    pub spec: ValidationSpec,
}

pub fn fingerprint(def: &ValidationDefinition) -> String {
    let mut hasher = Sha256::new();
    hasher.update(def.kind.name());
    hasher.update(serde_json::to_vec(&def.parameters).unwrap_or_default());
    format!("{:x}", hasher.finalize())
}

/// Lazily populated, keyed by rule code; a changed definition recompiles
#[derive(Debug, Default)]
pub struct RuleCompiler {
    cache: Mutex<HashMap<String, Arc<CompiledRule>>>,
}

impl RuleCompiler {
    pub fn new() -> Self {
        RuleCompiler::default()
    }

    pub fn compile(&self, rule: &RuleDefinition) -> Result<Arc<CompiledRule>, RuleConfigError> {
        let fingerprint = fingerprint(&rule.validation);

        {
            let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(hit) = cache.get(&rule.code) {
                if hit.fingerprint == fingerprint {
                    return Ok(Arc::clone(hit));
                }
            }
        }

        debug!(rule = %rule.code, kind = %rule.kind(), "compiling rule");
        let compiled = Arc::new(CompiledRule {
            code: rule.code.clone(),
            fingerprint,
            spec: compile_validation(&rule.validation)?,
        });

        self.cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(rule.code.clone(), Arc::clone(&compiled));

        Ok(compiled)
    }

    pub fn len(&self) -> usize {
        self.cache.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.cache.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn def(kind: ValidationKind, parameters: serde_json::Value) -> ValidationDefinition {
        ValidationDefinition { kind, parameters }
    }

    fn rule(code: &str, kind: ValidationKind, parameters: serde_json::Value) -> RuleDefinition {
        RuleDefinition::new(code, code, kind, parameters, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
    }

    #[test]
    fn test_field_length_defaults() {
        let spec = compile_validation(&def(ValidationKind::FieldLength, json!({ "expectedLength": 77 }))).unwrap();
        let ValidationSpec::FieldLength(config) = spec else {
            panic!("wrong variant");
        };
        assert_eq!(config.expected_length, 77);
        assert!(config.field.is_none());
        assert_eq!(config.common.severity, Severity::Error);
        assert!(config.common.applies_to("anything"));
    }

    #[test]
    fn test_missing_required_parameter() {
        let err = compile_validation(&def(ValidationKind::LookupExists, json!({ "field": "acct" }))).unwrap_err();
        assert!(matches!(err, RuleConfigError::Parameters { ref kind, .. } if kind == "LookupExists"));
    }

    #[test]
    fn test_custom_expression_parsed_once() {
        let spec = compile_validation(&def(
            ValidationKind::CustomExpression,
            json!({
                "variables": [
                    { "name": "net", "expression": "debit - credit" },
                    { "name": "absNet", "expression": "abs(net)" }
                ],
                "expression": "absNet < 0.01",
                "message": "Line {lineNumber} unbalanced by {net}",
                "recordTypes": ["01"],
                "aggregation": {
                    "aggregates": [
                        { "name": "debits", "function": "sum", "expression": "debit" },
                        { "name": "lines", "function": "count" }
                    ],
                    "expression": "debits > 0",
                    "severity": "Critical"
                }
            }),
        ))
        .unwrap();

        let ValidationSpec::CustomExpression(custom) = spec else {
            panic!("wrong variant");
        };
        assert_eq!(custom.variables.len(), 2);
        assert_eq!(custom.variables[1].0, "absNet");
        assert!(custom.check.is_some());
        assert!(custom.common.applies_to("01"));
        assert!(!custom.common.applies_to("02"));
        let agg = custom.aggregation.unwrap();
        assert_eq!(agg.aggregates.len(), 2);
        assert_eq!(agg.severity, Severity::Critical);
    }

    #[test]
    fn test_bad_expression_rejected_at_load() {
        let err = compile_validation(&def(
            ValidationKind::CustomExpression,
            json!({ "expression": "amount >" }),
        ))
        .unwrap_err();
        assert!(matches!(err, RuleConfigError::Expression { .. }));

        let err = compile_validation(&def(ValidationKind::CustomExpression, json!({}))).unwrap_err();
        assert!(matches!(err, RuleConfigError::Invalid(_)));

        let err = compile_validation(&def(
            ValidationKind::CustomExpression,
            json!({ "aggregation": { "aggregates": [ { "name": "s", "function": "sum" } ], "expression": "s > 0" } }),
        ))
        .unwrap_err();
        assert!(matches!(err, RuleConfigError::Invalid(_)));
    }

    #[test]
    fn test_regex_is_anchored() {
        let spec = compile_validation(&def(
            ValidationKind::RegexPattern,
            json!({ "field": "rfc", "pattern": "[A-Z]{3}[0-9]{3}" }),
        ))
        .unwrap();
        let ValidationSpec::RegexPattern(regex) = spec else {
            panic!("wrong variant");
        };
        assert!(regex.regex.is_match("ABC123"));
        assert!(!regex.regex.is_match("xABC123"));
        assert!(!regex.regex.is_match("ABC1234"));

        let err = compile_validation(&def(
            ValidationKind::RegexPattern,
            json!({ "field": "rfc", "pattern": "([A-Z" }),
        ))
        .unwrap_err();
        assert!(matches!(err, RuleConfigError::Pattern { .. }));
    }

    #[test]
    fn test_range_bounds() {
        let err = compile_validation(&def(ValidationKind::RangeCheck, json!({ "field": "amount" }))).unwrap_err();
        assert!(matches!(err, RuleConfigError::Invalid(_)));

        let err = compile_validation(&def(
            ValidationKind::RangeCheck,
            json!({ "field": "amount", "min": 10, "max": 1 }),
        ))
        .unwrap_err();
        assert!(matches!(err, RuleConfigError::Invalid(_)));

        let ValidationSpec::RangeCheck(range) = compile_validation(&def(
            ValidationKind::RangeCheck,
            json!({ "field": "amount", "min": 0, "max": 100 }),
        ))
        .unwrap() else {
            panic!("wrong variant");
        };
        assert!(range.contains(0.0));
        assert!(range.contains(100.0));
        assert!(!range.contains(100.01));

        let exclusive = RangeConfig { exclusive: true, ..range };
        assert!(!exclusive.contains(0.0));
        assert!(exclusive.contains(50.0));
    }

    #[test]
    fn test_cross_file_resolution() {
        let ValidationSpec::CrossFile(config) = compile_validation(&def(
            ValidationKind::CrossFileValidation,
            json!({ "relatedFileId": "{fileId}-R02", "keyField": "account", "amountField": "amount" }),
        ))
        .unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(config.resolve_related_id("F1"), "F1-R02");
        assert_eq!(config.related_key(), "account");
        assert_eq!(config.related_amount(), Some("amount"));

        let err = compile_validation(&def(
            ValidationKind::CrossFileValidation,
            json!({ "relatedFileId": "X", "keyField": "k", "tolerance": -1 }),
        ))
        .unwrap_err();
        assert!(matches!(err, RuleConfigError::Invalid(_)));
    }

    #[test]
    fn test_compiler_cache_reuses_and_recompiles() {
        let compiler = RuleCompiler::new();
        let r1 = rule("R1", ValidationKind::FieldLength, json!({ "expectedLength": 77 }));

        let a = compiler.compile(&r1).unwrap();
        let b = compiler.compile(&r1).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(compiler.len(), 1);

        let changed = rule("R1", ValidationKind::FieldLength, json!({ "expectedLength": 80 }));
        let c = compiler.compile(&changed).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_ne!(a.fingerprint, c.fingerprint);
        assert_eq!(compiler.len(), 1);
    }
}
