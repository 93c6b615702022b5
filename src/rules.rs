// 🏷️ Validation Rules - Rules as Data
// Condition trees, validation kind + parameters, and actions, loaded as JSON and interpreted at runtime

use anyhow::{Context as AnyhowContext, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

// ============================================================================
// CONDITION TREE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Combinator {
    /// Logical AND over children
    All,
    /// Logical OR over children
    Any,
    /// Logical NOR over children
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    Equals,
    NotEquals,
    In,
    NotIn,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Contains,
    Exists,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    /// Pass metadata field (fileType, operativeDate, recordTypes, ...)
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroup {
    pub combinator: Combinator,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Applicability condition: nested groups over atomic comparisons
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Group(ConditionGroup),
    Comparison(Comparison),
}

impl Condition {
    pub fn all(conditions: Vec<Condition>) -> Self {
        Condition::Group(ConditionGroup {
            combinator: Combinator::All,
            conditions,
        })
    }

    pub fn any(conditions: Vec<Condition>) -> Self {
        Condition::Group(ConditionGroup {
            combinator: Combinator::Any,
            conditions,
        })
    }

    pub fn none(conditions: Vec<Condition>) -> Self {
        Condition::Group(ConditionGroup {
            combinator: Combinator::None,
            conditions,
        })
    }

    pub fn compare(field: impl Into<String>, operator: Operator, value: serde_json::Value) -> Self {
        Condition::Comparison(Comparison {
            field: field.into(),
            operator,
            value,
        })
    }
}

// ============================================================================
// VALIDATION KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidationKind {
    FieldLength,
    CustomExpression,
    LookupExists,
    CrossFileValidation,
    RegexPattern,
    RangeCheck,
}

impl ValidationKind {
    pub const ALL: [ValidationKind; 6] = [
        ValidationKind::FieldLength,
        ValidationKind::CustomExpression,
        ValidationKind::LookupExists,
        ValidationKind::CrossFileValidation,
        ValidationKind::RegexPattern,
        ValidationKind::RangeCheck,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ValidationKind::FieldLength => "FieldLength",
            ValidationKind::CustomExpression => "CustomExpression",
            ValidationKind::LookupExists => "LookupExists",
            ValidationKind::CrossFileValidation => "CrossFileValidation",
            ValidationKind::RegexPattern => "RegexPattern",
            ValidationKind::RangeCheck => "RangeCheck",
        }
    }
}

impl fmt::Display for ValidationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind tag + opaque parameter map, decoded into a typed spec by the compiler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationDefinition {
    pub kind: ValidationKind,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

// ============================================================================
// ACTIONS
// ============================================================================

/// Opaque action descriptor: a type tag plus free-form parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(flatten)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

impl ActionDescriptor {
    pub fn new(action_type: impl Into<String>) -> Self {
        ActionDescriptor {
            action_type: action_type.into(),
            parameters: serde_json::Map::new(),
        }
    }

    /// Builder pattern: add a parameter
    pub fn with_param(mut self, key: &str, value: serde_json::Value) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSet {
    #[serde(default)]
    pub on_pass: Vec<ActionDescriptor>,
    #[serde(default)]
    pub on_fail: Vec<ActionDescriptor>,
}

// ============================================================================
// RULE DEFINITION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDefinition {
    /// Unique within an active rule set
    pub code: String,

    pub name: String,

    #[serde(default)]
    pub category: String,

    /// Absent = always applicable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,

    pub validation: ValidationDefinition,

    #[serde(default)]
    pub actions: ActionSet,

    pub effective_from: NaiveDate,

    /// Absent = open-ended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_to: Option<NaiveDate>,
}

impl RuleDefinition {
    pub fn new(
        code: impl Into<String>,
        name: impl Into<String>,
        kind: ValidationKind,
        parameters: serde_json::Value,
        effective_from: NaiveDate,
    ) -> Self {
        RuleDefinition {
            code: code.into(),
            name: name.into(),
            category: String::new(),
            condition: None,
            validation: ValidationDefinition { kind, parameters },
            actions: ActionSet::default(),
            effective_from,
            effective_to: None,
        }
    }

    /// Builder pattern: attach a condition
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Builder pattern: set category
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Builder pattern: close the effective window
    pub fn with_effective_to(mut self, effective_to: NaiveDate) -> Self {
        self.effective_to = Some(effective_to);
        self
    }

    /// Builder pattern: set actions
    pub fn with_actions(mut self, actions: ActionSet) -> Self {
        self.actions = actions;
        self
    }

    pub fn kind(&self) -> ValidationKind {
        self.validation.kind
    }

    /// Inclusive `[effective_from, effective_to]` check
    pub fn is_effective_on(&self, date: NaiveDate) -> bool {
        self.effective_from <= date && self.effective_to.map_or(true, |to| date <= to)
    }
}

/// Load a JSON array of rule definitions
pub fn load_rules_file<P: AsRef<Path>>(path: P) -> Result<Vec<RuleDefinition>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read rules file: {:?}", path.as_ref()))?;

    let rules: Vec<RuleDefinition> =
        serde_json::from_str(&content).context("Failed to parse rules JSON")?;

    Ok(rules)
}

// ============================================================================
// TESTS
// ============================================================================
