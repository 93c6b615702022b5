// ⚙️ Rule Execution Engine
// One validation pass: load → parse → freeze context → run rules under a permit pool → aggregate

use crate::actions::{run_actions, ActionExecutor, TracingActionExecutor};
use crate::catalog::{CatalogCache, CatalogSource};
use crate::compiler::{CompiledRule, RuleCompiler, ValidationSpec};
use crate::condition::is_applicable;
use crate::config::EngineConfig;
use crate::context::{RelatedFile, ValidationContext};
use crate::error::{EngineError, RuleConfigError, RuleFault};
use crate::handlers::{HandlerRegistry, RuleRun};
use crate::parser::{parse_lines, FileRecord};
use crate::repository::{FileDataLoader, RuleRepository};
use crate::result::{FileValidationResult, PassInfo, RuleOutcome, ValidationResult};
use crate::rules::RuleDefinition;
use crate::schema::SchemaRegistry;
use chrono::NaiveDate;
use futures::future::join_all;
use std::any::Any;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

/// A rule either resolved before dispatch or still running
enum Pending {
    Ready(ValidationResult),
    Running(JoinHandle<ValidationResult>),
}

/// Everything a spawned rule task needs, owned
struct RuleTask {
    rule: Arc<RuleDefinition>,
    compiled: Arc<CompiledRule>,
    ctx: Arc<ValidationContext>,
    handlers: Arc<HandlerRegistry>,
    actions: Arc<dyn ActionExecutor>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    config: EngineConfig,
}

pub struct ValidationEngine {
    rules: Arc<dyn RuleRepository>,
    catalogs: Arc<dyn CatalogSource>,
    files: Arc<dyn FileDataLoader>,
    schemas: Arc<SchemaRegistry>,
    handlers: Arc<HandlerRegistry>,
    compiler: Arc<RuleCompiler>,
    actions: Arc<dyn ActionExecutor>,
    config: EngineConfig,
}

impl ValidationEngine {
    pub fn new(
        rules: Arc<dyn RuleRepository>,
        catalogs: Arc<dyn CatalogSource>,
        files: Arc<dyn FileDataLoader>,
        schemas: SchemaRegistry,
    ) -> Self {
        ValidationEngine {
            rules,
            catalogs,
            files,
            schemas: Arc::new(schemas),
            handlers: Arc::new(HandlerRegistry::default()),
            compiler: Arc::new(RuleCompiler::new()),
            actions: Arc::new(TracingActionExecutor::new()),
            config: EngineConfig::default(),
        }
    }

    /// Builder pattern: custom configuration
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Builder pattern: custom dispatch table
    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = Arc::new(handlers);
        self
    }

    /// Builder pattern: custom action executor
    pub fn with_action_executor(mut self, actions: Arc<dyn ActionExecutor>) -> Self {
        self.actions = actions;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn compiler(&self) -> &RuleCompiler {
        &self.compiler
    }

    /// Validate one file against the rules active on `as_of`
    pub async fn validate_file(&self, file_id: &str, as_of: NaiveDate) -> Result<FileValidationResult, EngineError> {
        self.validate_file_with_cancel(file_id, as_of, CancellationToken::new())
            .await
    }

    /// Like `validate_file`, aborting pending rules and signalling running ones when `cancel` fires
    pub async fn validate_file_with_cancel(
        &self,
        file_id: &str,
        as_of: NaiveDate,
        cancel: CancellationToken,
    ) -> Result<FileValidationResult, EngineError> {
        let pass_id = Uuid::new_v4();
        let span = info_span!("validation_pass", %pass_id, file_id, %as_of);
        self.run_pass(pass_id, file_id, as_of, cancel).instrument(span).await
    }

    async fn run_pass(
        &self,
        pass_id: Uuid,
        file_id: &str,
        as_of: NaiveDate,
        cancel: CancellationToken,
    ) -> Result<FileValidationResult, EngineError> {
        info!("validation pass started");

        // 1. Active rules
        let mut rules = self
            .rules
            .get_active_rules(as_of)
            .await
            .map_err(|source| EngineError::RuleLoad { as_of, source })?;
        rules.retain(|r| r.is_effective_on(as_of));

        let mut seen = HashSet::new();
        for rule in &rules {
            if !seen.insert(rule.code.as_str()) {
                return Err(EngineError::DuplicateRuleCode(rule.code.clone()));
            }
        }

        // 2. File data + parse
        let data = self
            .files
            .load_file_data(file_id)
            .await
            .map_err(|source| EngineError::FileLoad {
                file_id: file_id.to_string(),
                source,
            })?;
        let schema = self
            .schemas
            .get(&data.file_type)
            .ok_or_else(|| EngineError::UnknownFileType(data.file_type.clone()))?;
        let records = parse_lines(&data.raw_lines, schema);
        let structural_errors: Vec<_> = records
            .iter()
            .filter_map(|r| r.structural_error.clone())
            .collect();
        debug!(
            records = records.len(),
            structural_errors = structural_errors.len(),
            "file parsed"
        );

        // 3. Decode parameters once; malformed rules are rejected here
        let compiled: Vec<(Arc<RuleDefinition>, Result<Arc<CompiledRule>, RuleConfigError>)> = rules
            .into_iter()
            .map(|rule| {
                let compiled = self.compiler.compile(&rule);
                (Arc::new(rule), compiled)
            })
            .collect();

        // 4. Catalogs and related files, then freeze the context
        let required_catalogs: BTreeSet<String> = compiled
            .iter()
            .filter_map(|(_, c)| match c.as_ref().ok().map(|c| &c.spec) {
                Some(ValidationSpec::LookupExists(lookup)) => Some(lookup.catalog.clone()),
                _ => None,
            })
            .collect();
        let catalogs = CatalogCache::load(self.catalogs.as_ref(), data.operative_date, &required_catalogs).await;

        let related_ids: BTreeSet<String> = compiled
            .iter()
            .filter_map(|(_, c)| match c.as_ref().ok().map(|c| &c.spec) {
                Some(ValidationSpec::CrossFile(cross)) => Some(cross.resolve_related_id(file_id)),
                _ => None,
            })
            .collect();

        let mut ctx = ValidationContext::new(file_id, data.file_type.clone(), data.operative_date, records)
            .with_as_of(as_of)
            .with_catalogs(catalogs);
        for related_id in related_ids {
            let related = self.load_related(&related_id).await;
            ctx = ctx.with_related_file(related_id, related);
        }
        let ctx = Arc::new(ctx);
        let records_parsed = ctx.record_count();

        // 5. Dispatch in initiation order
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut pending: Vec<(Arc<RuleDefinition>, Pending)> = Vec::with_capacity(compiled.len());

        for (rule, compiled) in compiled {
            let compiled = match compiled {
                Ok(compiled) => compiled,
                Err(e) => {
                    warn!(rule = %rule.code, error = %e, "rejecting malformed rule");
                    let result =
                        ValidationResult::fault(&rule, format!("Invalid rule configuration: {}", e), Duration::ZERO);
                    run_actions(self.actions.as_ref(), &rule, &result);
                    pending.push((rule, Pending::Ready(result)));
                    continue;
                }
            };

            if !is_applicable(rule.condition.as_ref(), &ctx) {
                debug!(rule = %rule.code, "condition not met, skipping");
                let result = ValidationResult::skipped(&rule, "Condition not met");
                pending.push((rule, Pending::Ready(result)));
                continue;
            }

            let task = RuleTask {
                rule: Arc::clone(&rule),
                compiled,
                ctx: Arc::clone(&ctx),
                handlers: Arc::clone(&self.handlers),
                actions: Arc::clone(&self.actions),
                permits: Arc::clone(&permits),
                cancel: cancel.clone(),
                config: self.config.clone(),
            };
            let handle = tokio::spawn(run_rule(task).instrument(Span::current()));
            pending.push((rule, Pending::Running(handle)));
        }

        // 6. Collect in initiation order
        let results = join_all(pending.into_iter().map(|(rule, pending)| async move {
            match pending {
                Pending::Ready(result) => result,
                Pending::Running(handle) => handle.await.unwrap_or_else(|e| {
                    error!(rule = %rule.code, error = %e, "rule task failed");
                    ValidationResult::fault(&rule, join_failure_message(e), Duration::ZERO)
                }),
            }
        }))
        .await;

        let report = FileValidationResult::aggregate(
            PassInfo {
                pass_id,
                file_id: file_id.to_string(),
                file_type: data.file_type,
                operative_date: data.operative_date,
                as_of,
            },
            results,
            records_parsed,
            structural_errors,
        );

        info!(
            status = %report.overall_status,
            total = report.total_rules,
            passed = report.passed_rules,
            failed = report.failed_rules,
            skipped = report.skipped_rules,
            elapsed_ms = report.total_execution_time.as_millis() as u64,
            "validation pass finished"
        );

        Ok(report)
    }

    /// Load and parse a related file; failures are kept as the reason string
    async fn load_related(&self, related_id: &str) -> RelatedFile {
        let data = match self.files.load_file_data(related_id).await {
            Ok(data) => data,
            Err(e) => {
                warn!(related_file = related_id, error = %e, "related file unavailable");
                return Err(format!("{:#}", e));
            }
        };
        let Some(schema) = self.schemas.get(&data.file_type) else {
            warn!(related_file = related_id, file_type = %data.file_type, "no schema for related file");
            return Err(format!("no schema registered for file type '{}'", data.file_type));
        };
        let records: Vec<FileRecord> = parse_lines(&data.raw_lines, schema);
        Ok(records)
    }
}

// ============================================================================
// PER-RULE TASK
// ============================================================================

async fn run_rule(task: RuleTask) -> ValidationResult {
    let RuleTask {
        rule,
        compiled,
        ctx,
        handlers,
        actions,
        permits,
        cancel,
        config,
    } = task;

    let queued = Instant::now();
    let permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!(rule = %rule.code, "cancelled before start");
            return ValidationResult::cancelled(&rule, Duration::ZERO);
        }
        permit = permits.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return ValidationResult::cancelled(&rule, queued.elapsed()),
        },
    };

    let started = Instant::now();
    let rule_token = cancel.child_token();
    let handle = {
        let span = Span::current();
        let token = rule_token.clone();
        let ctx = Arc::clone(&ctx);
        let compiled = Arc::clone(&compiled);
        let max_errors = config.max_errors_per_rule;
        let interval = config.cancel_check_interval;
        // The permit lives as long as the worker, not the awaiting task
        tokio::task::spawn_blocking(move || -> Result<RuleOutcome, RuleFault> {
            let _permit = permit;
            let _entered = span.enter();
            let mut run = RuleRun::new(max_errors, token, interval);
            handlers.dispatch(&compiled.spec, &ctx, &mut run)?;
            Ok(run.into_outcome())
        })
    };

    let joined = match config.rule_timeout {
        Some(limit) => match tokio::time::timeout(limit, handle).await {
            Ok(joined) => Ok(joined),
            Err(_) => {
                // Stop the worker cooperatively; its permit is released when it exits
                rule_token.cancel();
                Err(limit)
            }
        },
        None => Ok(handle.await),
    };
    let duration = started.elapsed();

    let result = match joined {
        Ok(Ok(Ok(outcome))) => ValidationResult::completed(&rule, outcome, duration),
        Ok(Ok(Err(RuleFault::Cancelled))) => {
            debug!(rule = %rule.code, "cancelled while running");
            return ValidationResult::cancelled(&rule, duration);
        }
        Ok(Ok(Err(fault))) => {
            error!(rule = %rule.code, error = %fault, "rule execution fault");
            ValidationResult::fault(&rule, format!("Rule execution failed: {}", fault), duration)
        }
        Ok(Err(join_error)) => {
            error!(rule = %rule.code, error = %join_error, "rule execution panicked");
            ValidationResult::fault(&rule, join_failure_message(join_error), duration)
        }
        Err(limit) => {
            warn!(rule = %rule.code, timeout_ms = limit.as_millis() as u64, "rule timed out");
            ValidationResult::fault(&rule, format!("Rule exceeded timeout of {:?}", limit), duration)
        }
    };

    debug!(
        rule = %rule.code,
        status = %result.status,
        errors = result.errors.len(),
        records = result.records_validated,
        "rule resolved"
    );

    run_actions(actions.as_ref(), &rule, &result);
    result
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn join_failure_message(error: JoinError) -> String {
    if error.is_panic() {
        let payload = error.into_panic();
        format!("Rule execution panicked: {}", panic_message(payload.as_ref()))
    } else {
        format!("Rule execution aborted: {}", error)
    }
}
