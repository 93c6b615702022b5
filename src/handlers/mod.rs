// 🧭 Validation-Kind Dispatch
// One handler per validation kind, looked up in a table instead of a switch

pub mod cross_file;
pub mod custom_expression;
pub mod field_length;
pub mod lookup;
pub mod range_check;
pub mod regex_pattern;

pub use cross_file::CrossFileHandler;
pub use custom_expression::CustomExpressionHandler;
pub use field_length::FieldLengthHandler;
pub use lookup::LookupExistsHandler;
pub use range_check::RangeCheckHandler;
pub use regex_pattern::RegexPatternHandler;

use crate::compiler::{CommonParams, ValidationSpec};
use crate::context::ValidationContext;
use crate::error::RuleFault;
use crate::expression::{render_template, Scope, Value};
use crate::parser::FileRecord;
use crate::result::{ErrorAccumulator, RuleOutcome, ValidationError};
use crate::rules::ValidationKind;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A strategy for one validation kind.
///
/// Handlers run on a blocking worker, read the shared context and write only
/// to their own `RuleRun`. Returning `Err` (or panicking) marks the rule as
/// `Error` with a single Critical entry.
pub trait ValidationHandler: Send + Sync {
    fn kind(&self) -> ValidationKind;

    fn validate(
        &self,
        spec: &ValidationSpec,
        ctx: &ValidationContext,
        run: &mut RuleRun,
    ) -> Result<(), RuleFault>;
}

// ============================================================================
// RULE RUN (per-rule mutable state)
// ============================================================================

pub struct RuleRun {
    errors: ErrorAccumulator,
    records_validated: usize,
    records_failed: usize,
    cancel: CancellationToken,
    check_interval: usize,
    seen: usize,
}

impl RuleRun {
    pub fn new(max_errors: usize, cancel: CancellationToken, check_interval: usize) -> Self {
        RuleRun {
            errors: ErrorAccumulator::new(max_errors),
            records_validated: 0,
            records_failed: 0,
            cancel,
            check_interval: check_interval.max(1),
            seen: 0,
        }
    }

    /// Call once per record; observes cancellation every `check_interval` records
    pub fn checkpoint(&mut self) -> Result<(), RuleFault> {
        let due = self.seen % self.check_interval == 0;
        self.seen += 1;
        if due && self.cancel.is_cancelled() {
            return Err(RuleFault::Cancelled);
        }
        Ok(())
    }

    pub fn pass(&mut self) {
        self.records_validated += 1;
    }

    /// Record a failing record. Returns false once the error cap is reached.
    pub fn fail(&mut self, error: ValidationError) -> bool {
        self.records_validated += 1;
        self.records_failed += 1;
        self.errors.push(error)
    }

    /// File-level finding that is not tied to a record count
    pub fn report(&mut self, error: ValidationError) -> bool {
        self.errors.push(error)
    }

    pub fn is_truncated(&self) -> bool {
        self.errors.is_truncated()
    }

    pub fn into_outcome(self) -> RuleOutcome {
        RuleOutcome {
            errors: self.errors,
            records_validated: self.records_validated,
            records_failed: self.records_failed,
        }
    }
}

// ============================================================================
// DISPATCH TABLE
// ============================================================================

#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<ValidationKind, Arc<dyn ValidationHandler>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        let mut registry = HandlerRegistry::empty();
        registry.register(Arc::new(FieldLengthHandler));
        registry.register(Arc::new(CustomExpressionHandler));
        registry.register(Arc::new(LookupExistsHandler));
        registry.register(Arc::new(CrossFileHandler));
        registry.register(Arc::new(RegexPatternHandler));
        registry.register(Arc::new(RangeCheckHandler));
        registry
    }
}

impl HandlerRegistry {
    pub fn empty() -> Self {
        HandlerRegistry {
            handlers: HashMap::new(),
        }
    }

    /// Register (or replace) the handler for its kind
    pub fn register(&mut self, handler: Arc<dyn ValidationHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn get(&self, kind: ValidationKind) -> Option<Arc<dyn ValidationHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn dispatch(
        &self,
        spec: &ValidationSpec,
        ctx: &ValidationContext,
        run: &mut RuleRun,
    ) -> Result<(), RuleFault> {
        let handler = self
            .handlers
            .get(&spec.kind())
            .ok_or_else(|| RuleFault::Other(format!("no handler registered for {}", spec.kind())))?;
        handler.validate(spec, ctx, run)
    }
}

// ============================================================================
// SHARED HELPERS
// ============================================================================

pub(crate) fn kind_mismatch(handler: ValidationKind, spec: &ValidationSpec) -> RuleFault {
    RuleFault::KindMismatch {
        handler: handler.name(),
        received: spec.kind().name(),
    }
}

/// Structurally valid records the rule's `recordTypes` filter admits
pub(crate) fn records_in_scope<'a>(
    ctx: &'a ValidationContext,
    common: &'a CommonParams,
) -> impl Iterator<Item = &'a FileRecord> + 'a {
    ctx.records
        .iter()
        .filter(move |r| r.is_valid() && common.applies_to(&r.record_type))
}

/// Interpolate a message: explicit bindings first, then `lineNumber`,
/// `recordType` and the record's own fields
pub(crate) fn render_message(template: &str, record: Option<&FileRecord>, bindings: &[(&str, String)]) -> String {
    render_template(template, |key| {
        if let Some((_, v)) = bindings.iter().find(|(k, _)| *k == key) {
            return Some(v.clone());
        }
        let record = record?;
        match key {
            "lineNumber" => Some(record.line_number.to_string()),
            "recordType" => Some(record.record_type.clone()),
            _ => record.field(key).map(|v| v.render()),
        }
    })
}

/// Expression scope for one record: derived variables, then fields, then `$` names
pub(crate) struct RecordScope<'a> {
    pub ctx: &'a ValidationContext,
    pub record: &'a FileRecord,
    pub variables: &'a HashMap<String, Value>,
}

impl Scope for RecordScope<'_> {
    fn resolve(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.variables.get(name) {
            return Some(v.clone());
        }
        if let Some(field) = self.record.field(name) {
            return Some(Value::from(field));
        }
        self.ctx.record_value(self.record, name)
    }
}

pub(crate) fn error_for(record: &FileRecord, message: String, common: &CommonParams) -> ValidationError {
    ValidationError::new(record.line_number, message, common.severity).with_raw_record(record.raw_line.clone())
}

// ============================================================================
// TESTS
// ============================================================================


#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_validation;
    use crate::result::Severity;
    use crate::rules::ValidationDefinition;
    use serde_json::json;

    #[test]
    fn test_checkpoint_observes_cancellation() {
        let token = CancellationToken::new();
        let mut run = RuleRun::new(10, token.clone(), 2);

        assert!(run.checkpoint().is_ok());
        token.cancel();
        // record 2 is between checks
        assert!(run.checkpoint().is_ok());
        assert!(matches!(run.checkpoint(), Err(RuleFault::Cancelled)));
    }

    #[test]
    fn test_run_counts() {
        let mut run = RuleRun::new(1, CancellationToken::new(), 256);
        run.pass();
        assert!(run.fail(ValidationError::new(2, "bad", Severity::Error)));
        assert!(!run.fail(ValidationError::new(3, "bad", Severity::Error)));

        let outcome = run.into_outcome();
        assert_eq!(outcome.records_validated, 3);
        assert_eq!(outcome.records_failed, 2);
        assert!(outcome.errors.is_truncated());
    }

    #[test]
    fn test_dispatch_routes_by_kind() {
        let registry = HandlerRegistry::default();
        for kind in ValidationKind::ALL {
            assert!(registry.get(kind).is_some(), "missing handler for {}", kind);
        }

        let ctx = test_support::context(&[test_support::detail("ACC1", 100, "MXN")]);
        let spec = compile_validation(&ValidationDefinition {
            kind: ValidationKind::FieldLength,
            parameters: json!({ "expectedLength": 77 }),
        })
        .unwrap();

        let mut run = RuleRun::new(10, CancellationToken::new(), 256);
        registry.dispatch(&spec, &ctx, &mut run).unwrap();
        assert_eq!(run.into_outcome().records_validated, 1);

        let empty = HandlerRegistry::empty();
        let mut run = RuleRun::new(10, CancellationToken::new(), 256);
        assert!(matches!(empty.dispatch(&spec, &ctx, &mut run), Err(RuleFault::Other(_))));
    }

    #[test]
    fn test_handler_rejects_foreign_spec() {
        let ctx = test_support::context(&[]);
        let spec = compile_validation(&ValidationDefinition {
            kind: ValidationKind::FieldLength,
            parameters: json!({ "expectedLength": 77 }),
        })
        .unwrap();
        let mut run = RuleRun::new(10, CancellationToken::new(), 256);

        let err = RangeCheckHandler.validate(&spec, &ctx, &mut run).unwrap_err();
        assert!(matches!(
            err,
            RuleFault::KindMismatch { handler: "RangeCheck", received: "FieldLength" }
        ));
    }

    #[test]
    fn test_render_message_bindings_and_fields() {
        let records = test_support::records(&[test_support::detail("ACC9", 1050, "USD")]);
        let msg = render_message(
            "line {lineNumber} type {recordType} acct {account} amt {amount} {extra} {missing}",
            Some(&records[0]),
            &[("extra", "X".to_string())],
        );
        assert_eq!(msg, "line 1 type 01 acct ACC9 amt 10.50 X {missing}");
    }
}
