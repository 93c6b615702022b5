// ✅ Validation Results
// Per-rule verdicts with capped error lists, rolled up into one file-level report

use crate::parser::StructuralError;
use crate::rules::{RuleDefinition, ValidationKind};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// SEVERITY
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Warning,
    #[default]
    Error,
    Critical,
}

impl Severity {
    /// Error and Critical entries fail a rule; warnings never do
    pub fn is_failure(&self) -> bool {
        matches!(self, Severity::Error | Severity::Critical)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Warning => "Warning",
            Severity::Error => "Error",
            Severity::Critical => "Critical",
        };
        f.write_str(s)
    }
}

// ============================================================================
// VALIDATION ERROR
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    /// 0 for file-level findings
    pub line_number: usize,
    pub message: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_record: Option<String>,
}

impl ValidationError {
    pub fn new(line_number: usize, message: impl Into<String>, severity: Severity) -> Self {
        ValidationError {
            line_number,
            message: message.into(),
            severity,
            raw_record: None,
        }
    }

    pub fn file_level(message: impl Into<String>, severity: Severity) -> Self {
        ValidationError::new(0, message, severity)
    }

    pub fn critical(message: impl Into<String>) -> Self {
        ValidationError::new(0, message, Severity::Critical)
    }

    /// Builder pattern: attach the offending line
    pub fn with_raw_record(mut self, raw: impl Into<String>) -> Self {
        self.raw_record = Some(raw.into());
        self
    }
}

// ============================================================================
// ERROR ACCUMULATOR
// ============================================================================

/// Rule-local error list with a hard cap plus one truncation sentinel
#[derive(Debug, Clone)]
pub struct ErrorAccumulator {
    errors: Vec<ValidationError>,
    cap: usize,
    truncated: bool,
}

impl ErrorAccumulator {
    pub fn new(cap: usize) -> Self {
        ErrorAccumulator {
            errors: Vec::new(),
            cap,
            truncated: false,
        }
    }

    /// Returns false once the cap is hit; the caller should stop producing errors
    pub fn push(&mut self, error: ValidationError) -> bool {
        if self.truncated {
            return false;
        }
        if self.errors.len() < self.cap {
            self.errors.push(error);
            return true;
        }
        self.errors.push(ValidationError::file_level(
            format!(
                "Error limit of {} reached; further errors for this rule were not reported",
                self.cap
            ),
            Severity::Warning,
        ));
        self.truncated = true;
        false
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn has_failures(&self) -> bool {
        self.errors.iter().any(|e| e.severity.is_failure())
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_errors(self) -> Vec<ValidationError> {
        self.errors
    }
}

/// What a handler produced for one rule
#[derive(Debug, Clone)]
pub struct RuleOutcome {
    pub errors: ErrorAccumulator,
    pub records_validated: usize,
    pub records_failed: usize,
}

// ============================================================================
// PER-RULE RESULT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleStatus {
    Passed,
    Failed,
    Skipped,
    /// Handler fault, timeout or rejected configuration
    Error,
    Cancelled,
}

impl fmt::Display for RuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuleStatus::Passed => "PASSED",
            RuleStatus::Failed => "FAILED",
            RuleStatus::Skipped => "SKIPPED",
            RuleStatus::Error => "ERROR",
            RuleStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub rule_code: String,
    pub rule_name: String,
    pub category: String,
    pub kind: ValidationKind,
    pub status: RuleStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,

    /// At most the configured cap plus one truncation sentinel
    pub errors: Vec<ValidationError>,
    pub truncated: bool,

    pub records_validated: usize,
    pub records_failed: usize,
    pub duration: Duration,
}

impl ValidationResult {
    fn base(rule: &RuleDefinition, status: RuleStatus) -> Self {
        ValidationResult {
            rule_code: rule.code.clone(),
            rule_name: rule.name.clone(),
            category: rule.category.clone(),
            kind: rule.kind(),
            status,
            skip_reason: None,
            errors: Vec::new(),
            truncated: false,
            records_validated: 0,
            records_failed: 0,
            duration: Duration::ZERO,
        }
    }

    pub fn skipped(rule: &RuleDefinition, reason: impl Into<String>) -> Self {
        let mut result = Self::base(rule, RuleStatus::Skipped);
        result.skip_reason = Some(reason.into());
        result
    }

    pub fn cancelled(rule: &RuleDefinition, duration: Duration) -> Self {
        let mut result = Self::base(rule, RuleStatus::Cancelled);
        result.duration = duration;
        result
    }

    /// Fault isolation: one Critical error, status Error
    pub fn fault(rule: &RuleDefinition, message: impl Into<String>, duration: Duration) -> Self {
        let mut result = Self::base(rule, RuleStatus::Error);
        result.errors.push(ValidationError::critical(message));
        result.duration = duration;
        result
    }

    pub fn completed(rule: &RuleDefinition, outcome: RuleOutcome, duration: Duration) -> Self {
        let status = if outcome.errors.has_failures() {
            RuleStatus::Failed
        } else {
            RuleStatus::Passed
        };
        let mut result = Self::base(rule, status);
        result.truncated = outcome.errors.is_truncated();
        result.errors = outcome.errors.into_errors();
        result.records_validated = outcome.records_validated;
        result.records_failed = outcome.records_failed;
        result.duration = duration;
        result
    }

    pub fn is_passed(&self) -> bool {
        self.status == RuleStatus::Passed
    }

    /// Error status counts as a failure
    pub fn is_failed(&self) -> bool {
        matches!(self.status, RuleStatus::Failed | RuleStatus::Error)
    }

    pub fn is_skipped(&self) -> bool {
        self.status == RuleStatus::Skipped
    }
}

// ============================================================================
// FILE-LEVEL RESULT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverallStatus {
    Pass,
    Fail,
    Cancelled,
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OverallStatus::Pass => "PASS",
            OverallStatus::Fail => "FAIL",
            OverallStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileValidationResult {
    pub pass_id: Uuid,
    pub file_id: String,
    pub file_type: String,
    pub operative_date: NaiveDate,
    pub as_of: NaiveDate,

    pub total_rules: usize,
    pub passed_rules: usize,
    pub failed_rules: usize,
    pub skipped_rules: usize,

    /// Initiation order
    pub results: Vec<ValidationResult>,
    pub overall_status: OverallStatus,

    /// Sum of per-rule durations, not wall-clock
    pub total_execution_time: Duration,

    pub records_parsed: usize,
    pub structural_errors: Vec<StructuralError>,
    pub validated_at: DateTime<Utc>,
}

/// Identity of the pass a report belongs to
#[derive(Debug, Clone)]
pub struct PassInfo {
    pub pass_id: Uuid,
    pub file_id: String,
    pub file_type: String,
    pub operative_date: NaiveDate,
    pub as_of: NaiveDate,
}

impl FileValidationResult {
    pub fn aggregate(
        info: PassInfo,
        results: Vec<ValidationResult>,
        records_parsed: usize,
        structural_errors: Vec<StructuralError>,
    ) -> Self {
        let passed_rules = results.iter().filter(|r| r.is_passed()).count();
        let failed_rules = results.iter().filter(|r| r.is_failed()).count();
        let skipped_rules = results.iter().filter(|r| r.is_skipped()).count();
        let cancelled = results.iter().any(|r| r.status == RuleStatus::Cancelled);

        let overall_status = if cancelled {
            OverallStatus::Cancelled
        } else if failed_rules > 0 {
            OverallStatus::Fail
        } else {
            OverallStatus::Pass
        };

        let total_execution_time = results.iter().map(|r| r.duration).sum();

        FileValidationResult {
            pass_id: info.pass_id,
            file_id: info.file_id,
            file_type: info.file_type,
            operative_date: info.operative_date,
            as_of: info.as_of,
            total_rules: results.len(),
            passed_rules,
            failed_rules,
            skipped_rules,
            results,
            overall_status,
            total_execution_time,
            records_parsed,
            structural_errors,
            validated_at: Utc::now(),
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{}: {} rules ({} passed, {} failed, {} skipped), {} records, {} structural errors",
            self.overall_status,
            self.total_rules,
            self.passed_rules,
            self.failed_rules,
            self.skipped_rules,
            self.records_parsed,
            self.structural_errors.len()
        )
    }

    pub fn result(&self, rule_code: &str) -> Option<&ValidationResult> {
        self.results.iter().find(|r| r.rule_code == rule_code)
    }
}

// ============================================================================
// TESTS
// ============================================================================
