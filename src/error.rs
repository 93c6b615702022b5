// 🚨 Error Types
// Fatal errors surface from validate_file; everything rule-local stays inside the result.

use thiserror::Error;

// ============================================================================
// ENGINE ERRORS (fatal to a validation pass)
// ============================================================================

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to load active rules for {as_of}: {source}")]
    RuleLoad {
        as_of: chrono::NaiveDate,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to load file data for '{file_id}': {source}")]
    FileLoad {
        file_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("duplicate rule code in active rule set: {0}")]
    DuplicateRuleCode(String),

    #[error("no schema registered for file type '{0}'")]
    UnknownFileType(String),
}

// ============================================================================
// SCHEMA ERRORS (raised when a schema is loaded)
// ============================================================================

#[derive(Debug, Error, PartialEq)]
pub enum SchemaError {
    #[error("schema '{file_type}': record type slice {offset}+{length} exceeds line length {line_length}")]
    RecordTypeOutOfBounds {
        file_type: String,
        offset: usize,
        length: usize,
        line_length: usize,
    },

    #[error("schema '{file_type}', record '{record_type}': field '{field}' ({offset}+{length}) exceeds line length {line_length}")]
    FieldOutOfBounds {
        file_type: String,
        record_type: String,
        field: String,
        offset: usize,
        length: usize,
        line_length: usize,
    },

    #[error("schema '{file_type}', record '{record_type}': field '{field}' has zero length")]
    EmptyField {
        file_type: String,
        record_type: String,
        field: String,
    },

    #[error("schema '{file_type}', record '{record_type}': duplicate field '{field}'")]
    DuplicateField {
        file_type: String,
        record_type: String,
        field: String,
    },

    #[error("schema '{0}': line length must be greater than zero")]
    ZeroLineLength(String),
}

// ============================================================================
// RULE CONFIGURATION ERRORS (raised when parameters are decoded)
// ============================================================================

#[derive(Debug, Error)]
pub enum RuleConfigError {
    #[error("invalid parameters for {kind}: {source}")]
    Parameters {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid expression '{expression}': {source}")]
    Expression {
        expression: String,
        #[source]
        source: ExpressionError,
    },

    #[error("invalid regex pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("{0}")]
    Invalid(String),
}

// ============================================================================
// EXPRESSION ERRORS
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("unexpected character '{ch}' at position {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("unterminated string starting at position {0}")]
    UnterminatedString(usize),

    #[error("unexpected token '{found}' at position {pos}, expected {expected}")]
    UnexpectedToken {
        found: String,
        pos: usize,
        expected: String,
    },

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("function '{name}' expects {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: String,
        got: usize,
    },

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("date out of range: {0}")]
    DateOutOfRange(String),
}

// ============================================================================
// RULE FAULTS (unexpected failures inside a handler)
// ============================================================================

#[derive(Debug, Error)]
pub enum RuleFault {
    #[error("expression evaluation failed at line {line}: {source}")]
    Expression {
        line: usize,
        #[source]
        source: ExpressionError,
    },

    #[error("catalog '{0}' is not available for this validation pass")]
    MissingCatalog(String),

    #[error("related file '{file_id}' is not available: {reason}")]
    MissingRelatedFile { file_id: String, reason: String },

    #[error("handler for {handler} received a {received} configuration")]
    KindMismatch {
        handler: &'static str,
        received: &'static str,
    },

    #[error("validation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

// ============================================================================
// CONFIG ERRORS
// ============================================================================

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{var} must be a positive integer, got '{value}'")]
    InvalidNumber { var: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}
