// 📐 Shape Layer - Fixed-Width Schemas
// Record layouts keyed by record-type code, validated once when loaded

use crate::error::SchemaError;
use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

/// Regulatory files use 77-character lines unless a schema says otherwise
pub const DEFAULT_LINE_LENGTH: usize = 77;

// ============================================================================
// FIELD TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    String,
    Integer,
    Date,
    /// Fixed-point with an implicit 2-decimal divisor (stored as minor units)
    Currency,
    Boolean,
}

// ============================================================================
// FIELD DEFINITION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub name: String,

    /// 0-based character offset within the line
    pub offset: usize,

    /// Width in characters
    pub length: usize,

    #[serde(rename = "type")]
    pub field_type: FieldType,

    /// Trim surrounding whitespace before coercion (strings keep padding when false)
    #[serde(default = "default_trim")]
    pub trim: bool,

    /// chrono format for Date fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    /// Sentinels that mean `true` for Boolean fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub true_values: Option<Vec<String>>,
}

fn default_trim() -> bool {
    true
}

pub const DEFAULT_DATE_FORMAT: &str = "%Y%m%d";
pub const DEFAULT_TRUE_VALUES: [&str; 5] = ["S", "Y", "1", "T", "X"];

impl FieldDef {
    pub fn new(name: impl Into<String>, offset: usize, length: usize, field_type: FieldType) -> Self {
        FieldDef {
            name: name.into(),
            offset,
            length,
            field_type,
            trim: true,
            format: None,
            true_values: None,
        }
    }

    /// Builder pattern: keep padding on string fields
    pub fn untrimmed(mut self) -> Self {
        self.trim = false;
        self
    }

    /// Builder pattern: custom date format
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn date_format(&self) -> &str {
        self.format.as_deref().unwrap_or(DEFAULT_DATE_FORMAT)
    }

    pub fn is_true_sentinel(&self, value: &str) -> bool {
        let value = value.trim();
        match &self.true_values {
            Some(values) => values.iter().any(|v| v == value),
            None => DEFAULT_TRUE_VALUES
                .iter()
                .any(|v| v.eq_ignore_ascii_case(value)),
        }
    }

    fn end(&self) -> usize {
        self.offset + self.length
    }
}

// ============================================================================
// RECORD LAYOUT
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordLayout {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Ordered field definitions
    pub fields: Vec<FieldDef>,
}

impl RecordLayout {
    pub fn new(fields: Vec<FieldDef>) -> Self {
        RecordLayout {
            description: None,
            fields,
        }
    }
}

// ============================================================================
// FILE SCHEMA
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSchema {
    pub file_type: String,

    #[serde(default = "default_line_length")]
    pub line_length: usize,

    #[serde(default)]
    pub record_type_offset: usize,

    #[serde(default = "default_record_type_length")]
    pub record_type_length: usize,

    /// record type code → layout
    pub records: HashMap<String, RecordLayout>,
}

fn default_line_length() -> usize {
    DEFAULT_LINE_LENGTH
}

fn default_record_type_length() -> usize {
    2
}

impl FileSchema {
    pub fn new(file_type: impl Into<String>) -> Self {
        FileSchema {
            file_type: file_type.into(),
            line_length: DEFAULT_LINE_LENGTH,
            record_type_offset: 0,
            record_type_length: default_record_type_length(),
            records: HashMap::new(),
        }
    }

    /// Builder pattern: custom line length
    pub fn with_line_length(mut self, line_length: usize) -> Self {
        self.line_length = line_length;
        self
    }

    /// Builder pattern: register a layout for a record type
    pub fn with_record(mut self, record_type: impl Into<String>, layout: RecordLayout) -> Self {
        self.records.insert(record_type.into(), layout);
        self
    }

    pub fn layout(&self, record_type: &str) -> Option<&RecordLayout> {
        self.records.get(record_type)
    }

    /// Check that every slice fits inside the line and field names are unique
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.line_length == 0 {
            return Err(SchemaError::ZeroLineLength(self.file_type.clone()));
        }

        if self.record_type_offset + self.record_type_length > self.line_length {
            return Err(SchemaError::RecordTypeOutOfBounds {
                file_type: self.file_type.clone(),
                offset: self.record_type_offset,
                length: self.record_type_length,
                line_length: self.line_length,
            });
        }

        for (record_type, layout) in &self.records {
            let mut seen = HashSet::new();
            for field in &layout.fields {
                if field.length == 0 {
                    return Err(SchemaError::EmptyField {
                        file_type: self.file_type.clone(),
                        record_type: record_type.clone(),
                        field: field.name.clone(),
                    });
                }
                if field.end() > self.line_length {
                    return Err(SchemaError::FieldOutOfBounds {
                        file_type: self.file_type.clone(),
                        record_type: record_type.clone(),
                        field: field.name.clone(),
                        offset: field.offset,
                        length: field.length,
                        line_length: self.line_length,
                    });
                }
                if !seen.insert(field.name.as_str()) {
                    return Err(SchemaError::DuplicateField {
                        file_type: self.file_type.clone(),
                        record_type: record_type.clone(),
                        field: field.name.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

// ============================================================================
// SCHEMA REGISTRY
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, FileSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        SchemaRegistry::default()
    }

    /// Load a JSON array of schemas
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read schema file: {:?}", path.as_ref()))?;

        let schemas: Vec<FileSchema> =
            serde_json::from_str(&content).context("Failed to parse schema JSON")?;

        let mut registry = SchemaRegistry::new();
        for schema in schemas {
            registry.register(schema)?;
        }
        Ok(registry)
    }

    /// Validate and register a schema, replacing any previous one for the file type
    pub fn register(&mut self, schema: FileSchema) -> Result<(), SchemaError> {
        schema.validate()?;
        self.schemas.insert(schema.file_type.clone(), schema);
        Ok(())
    }

    pub fn get(&self, file_type: &str) -> Option<&FileSchema> {
        self.schemas.get(file_type)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn balance_schema() -> FileSchema {
        FileSchema::new("R01").with_record(
            "01",
            RecordLayout::new(vec![
                FieldDef::new("account", 2, 12, FieldType::String),
                FieldDef::new("amount", 14, 15, FieldType::Currency),
            ]),
        )
    }

    #[test]
    fn test_valid_schema() {
        assert!(balance_schema().validate().is_ok());
    }

    #[test]
    fn test_field_out_of_bounds() {
        let schema = FileSchema::new("R01").with_record(
            "01",
            RecordLayout::new(vec![FieldDef::new("tail", 70, 10, FieldType::String)]),
        );

        assert!(matches!(
            schema.validate(),
            Err(SchemaError::FieldOutOfBounds { ref field, .. }) if field == "tail"
        ));
    }

    #[test]
    fn test_duplicate_field() {
        let schema = FileSchema::new("R01").with_record(
            "01",
            RecordLayout::new(vec![
                FieldDef::new("account", 2, 5, FieldType::String),
                FieldDef::new("account", 7, 5, FieldType::String),
            ]),
        );

        assert!(matches!(
            schema.validate(),
            Err(SchemaError::DuplicateField { .. })
        ));
    }

    #[test]
    fn test_deserialize_defaults() {
        let json = r#"{
            "fileType": "R04",
            "records": {
                "10": { "fields": [ { "name": "flag", "offset": 2, "length": 1, "type": "Boolean" } ] }
            }
        }"#;

        let schema: FileSchema = serde_json::from_str(json).unwrap();

        assert_eq!(schema.line_length, 77);
        assert_eq!(schema.record_type_length, 2);
        assert!(schema.layout("10").unwrap().fields[0].trim);
    }

    #[test]
    fn test_true_sentinels() {
        let field = FieldDef::new("flag", 0, 1, FieldType::Boolean);
        assert!(field.is_true_sentinel("S"));
        assert!(field.is_true_sentinel("y"));
        assert!(field.is_true_sentinel("1"));
        assert!(!field.is_true_sentinel("N"));
        assert!(!field.is_true_sentinel(" "));
    }

    #[test]
    fn test_registry_rejects_invalid() {
        let mut registry = SchemaRegistry::new();
        let bad = FileSchema::new("BAD").with_line_length(0);
        assert!(registry.register(bad).is_err());
        assert!(registry.register(balance_schema()).is_ok());
        assert!(registry.get("R01").is_some());
        assert_eq!(registry.len(), 1);
    }
}
