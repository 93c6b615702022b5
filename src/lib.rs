// Compliance Rules - Core Library
// Parser, rule compiler and validation engine for fixed-width regulatory files

pub mod config;
pub mod error;
pub mod schema;      // File layouts per file type
pub mod parser;      // Fixed-width line → typed record
pub mod rules;       // Rule definitions (data, not code)
pub mod expression;  // Expression language used by CustomExpression rules
pub mod catalog;     // Reference catalogs, loaded once per pass
pub mod context;     // Frozen per-pass validation context
pub mod condition;   // Applicability conditions
pub mod compiler;    // Parameter checking + compiled rule cache
pub mod handlers;    // One handler per validation kind
pub mod result;      // Per-rule and per-file outcomes
pub mod actions;     // Post-verdict side effects
pub mod repository;  // Collaborator traits + in-memory implementations
pub mod engine;      // Bounded concurrent execution of a pass
pub mod db;          // SQLite-backed store + audit trail

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{ConfigError, EngineError, ExpressionError, RuleConfigError, RuleFault, SchemaError};
pub use schema::{FieldDef, FieldType, FileSchema, RecordLayout, SchemaRegistry};
pub use parser::{parse_line, parse_lines, FieldValue, FileRecord, StructuralError, StructuralErrorKind};
pub use rules::{
    load_rules_file, ActionDescriptor, ActionSet, Combinator, Comparison, Condition, ConditionGroup,
    Operator, RuleDefinition, ValidationDefinition, ValidationKind,
};
pub use expression::{Expr, Value};
pub use catalog::{CatalogCache, CatalogSet, CatalogSnapshot, CatalogSource};
pub use context::{FileData, ValidationContext};
pub use condition::{evaluate_condition, is_applicable};
pub use compiler::{compile_validation, CompiledRule, RuleCompiler, ValidationSpec};
pub use handlers::{HandlerRegistry, RuleRun, ValidationHandler};
pub use result::{
    FileValidationResult, OverallStatus, RuleStatus, Severity, ValidationError, ValidationResult,
};
pub use actions::{ActionExecutor, TracingActionExecutor};
pub use repository::{
    FileDataLoader, InMemoryCatalogSource, InMemoryFileLoader, InMemoryRuleRepository, RuleRepository,
};
pub use engine::ValidationEngine;
pub use db::{setup_database, Event, SqliteStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
