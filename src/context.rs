// 🧊 Validation Context
// Everything a rule may read during one pass. Built once, frozen, shared behind an Arc.

use crate::catalog::{CatalogSet, CatalogSnapshot};
use crate::error::RuleFault;
use crate::expression::Value;
use crate::parser::FileRecord;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Raw file as returned by a `FileDataLoader`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    pub file_type: String,
    pub operative_date: NaiveDate,
    pub raw_lines: Vec<String>,
}

impl FileData {
    pub fn new(file_type: impl Into<String>, operative_date: NaiveDate, raw_lines: Vec<String>) -> Self {
        FileData {
            file_type: file_type.into(),
            operative_date,
            raw_lines,
        }
    }
}

/// Parsed records of a related file, or the reason they could not be loaded
pub type RelatedFile = Result<Vec<FileRecord>, String>;

#[derive(Debug, Clone)]
pub struct ValidationContext {
    pub file_id: String,
    pub file_type: String,
    pub operative_date: NaiveDate,

    /// Date the active rule set was selected for
    pub as_of: NaiveDate,

    /// Every parsed line in file order, including structurally invalid ones
    pub records: Vec<FileRecord>,

    pub catalogs: CatalogSnapshot,

    /// related file id → parsed records
    pub related_files: HashMap<String, RelatedFile>,
}

impl ValidationContext {
    pub fn new(
        file_id: impl Into<String>,
        file_type: impl Into<String>,
        operative_date: NaiveDate,
        records: Vec<FileRecord>,
    ) -> Self {
        ValidationContext {
            file_id: file_id.into(),
            file_type: file_type.into(),
            operative_date,
            as_of: operative_date,
            records,
            catalogs: CatalogSnapshot::default(),
            related_files: HashMap::new(),
        }
    }

    /// Builder pattern: set the rule-selection date
    pub fn with_as_of(mut self, as_of: NaiveDate) -> Self {
        self.as_of = as_of;
        self
    }

    /// Builder pattern: attach catalogs
    pub fn with_catalogs(mut self, catalogs: CatalogSnapshot) -> Self {
        self.catalogs = catalogs;
        self
    }

    /// Builder pattern: attach a related file
    pub fn with_related_file(mut self, file_id: impl Into<String>, file: RelatedFile) -> Self {
        self.related_files.insert(file_id.into(), file);
        self
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn invalid_record_count(&self) -> usize {
        self.records.iter().filter(|r| !r.is_valid()).count()
    }

    /// Record types present among structurally valid records
    pub fn record_types(&self) -> BTreeSet<&str> {
        self.records
            .iter()
            .filter(|r| r.is_valid())
            .map(|r| r.record_type.as_str())
            .collect()
    }

    pub fn catalog(&self, name: &str) -> Result<&CatalogSet, RuleFault> {
        self.catalogs
            .get(name)
            .ok_or_else(|| RuleFault::MissingCatalog(name.to_string()))
    }

    pub fn related_records(&self, file_id: &str) -> Result<&[FileRecord], RuleFault> {
        match self.related_files.get(file_id) {
            Some(Ok(records)) => Ok(records),
            Some(Err(reason)) => Err(RuleFault::MissingRelatedFile {
                file_id: file_id.to_string(),
                reason: reason.clone(),
            }),
            None => Err(RuleFault::MissingRelatedFile {
                file_id: file_id.to_string(),
                reason: "not loaded for this pass".to_string(),
            }),
        }
    }

    /// `$`-prefixed names visible to expressions regardless of record
    pub fn pass_value(&self, name: &str) -> Option<Value> {
        let value = match name {
            "$fileId" => Value::Text(self.file_id.clone()),
            "$fileType" => Value::Text(self.file_type.clone()),
            "$operativeDate" => Value::Date(self.operative_date),
            "$asOfDate" => Value::Date(self.as_of),
            "$recordCount" => Value::Number(self.records.len() as f64),
            _ => return None,
        };
        Some(value)
    }

    /// Pass-level and record-level `$` names
    pub fn record_value(&self, record: &FileRecord, name: &str) -> Option<Value> {
        match name {
            "$recordType" => Some(Value::Text(record.record_type.clone())),
            "$lineNumber" => Some(Value::Number(record.line_number as f64)),
            _ => self.pass_value(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{StructuralError, StructuralErrorKind};
    use std::collections::BTreeMap;

    fn record(line: usize, record_type: &str, valid: bool) -> FileRecord {
        FileRecord {
            line_number: line,
            raw_line: String::new(),
            record_type: record_type.to_string(),
            fields: BTreeMap::new(),
            structural_error: (!valid).then(|| StructuralError {
                line_number: line,
                kind: StructuralErrorKind::LineLength,
                message: "bad".into(),
            }),
        }
    }

    #[test]
    fn test_counts_and_types() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        let ctx = ValidationContext::new(
            "F1",
            "R01",
            date,
            vec![record(1, "01", true), record(2, "02", true), record(3, "99", false)],
        );

        assert_eq!(ctx.record_count(), 3);
        assert_eq!(ctx.invalid_record_count(), 1);
        assert_eq!(ctx.record_types().into_iter().collect::<Vec<_>>(), vec!["01", "02"]);
        assert_eq!(ctx.as_of, date);
        assert_eq!(ctx.pass_value("$fileType"), Some(Value::Text("R01".into())));
        assert_eq!(ctx.pass_value("$nope"), None);
    }

    #[test]
    fn test_related_file_lookup() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        let ctx = ValidationContext::new("F1", "R01", date, vec![])
            .with_related_file("F2", Ok(vec![record(1, "01", true)]))
            .with_related_file("F3", Err("gone".into()));

        assert_eq!(ctx.related_records("F2").unwrap().len(), 1);
        assert!(matches!(
            ctx.related_records("F3"),
            Err(RuleFault::MissingRelatedFile { ref reason, .. }) if reason == "gone"
        ));
        assert!(ctx.related_records("F4").is_err());
        assert!(matches!(ctx.catalog("accounts"), Err(RuleFault::MissingCatalog(_))));
    }
}
