// 🔎 LookupExists
// Field value must be a member of a catalog frozen in the pass context

use super::{error_for, kind_mismatch, records_in_scope, render_message, RuleRun, ValidationHandler};
use crate::compiler::ValidationSpec;
use crate::context::ValidationContext;
use crate::error::RuleFault;
use crate::rules::ValidationKind;

const DEFAULT_MESSAGE: &str = "Value '{value}' of field '{field}' not found in catalog '{catalog}'";

pub struct LookupExistsHandler;

impl ValidationHandler for LookupExistsHandler {
    fn kind(&self) -> ValidationKind {
        ValidationKind::LookupExists
    }

    fn validate(&self, spec: &ValidationSpec, ctx: &ValidationContext, run: &mut RuleRun) -> Result<(), RuleFault> {
        let ValidationSpec::LookupExists(config) = spec else {
            return Err(kind_mismatch(self.kind(), spec));
        };

        let catalog = ctx.catalog(&config.catalog)?;

        for record in records_in_scope(ctx, &config.common) {
            run.checkpoint()?;

            let Some(value) = record.field(&config.field) else {
                continue;
            };
            let rendered = value.render();
            let key = rendered.trim();

            if (key.is_empty() && config.allow_empty) || catalog.contains(key, config.case_insensitive) {
                run.pass();
                continue;
            }

            let message = render_message(
                config.common.message_or(DEFAULT_MESSAGE),
                Some(record),
                &[
                    ("value", key.to_string()),
                    ("field", config.field.clone()),
                    ("catalog", config.catalog.clone()),
                ],
            );
            if !run.fail(error_for(record, message, &config.common)) {
                break;
            }
        }

        Ok(())
    }
}
