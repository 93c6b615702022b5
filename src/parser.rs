// 🏗️ Fixed-Width Record Parser
// Raw 77-character lines + schema → typed field maps, one independent verdict per line

use crate::schema::{FieldDef, FieldType, FileSchema};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// FIELD VALUES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Date(NaiveDate),
    /// Minor units (cents); the file carries an implicit 2-decimal divisor
    Currency(i64),
    Boolean(bool),
    /// Unparseable or blank dates
    Null,
}

impl FieldValue {
    /// Canonical text form used by length, pattern and lookup checks
    pub fn render(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Integer(n) => n.to_string(),
            FieldValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            FieldValue::Currency(cents) => {
                let sign = if *cents < 0 { "-" } else { "" };
                let abs = cents.unsigned_abs();
                format!("{}{}.{:02}", sign, abs / 100, abs % 100)
            }
            FieldValue::Boolean(b) => b.to_string(),
            FieldValue::Null => String::new(),
        }
    }

    /// Numeric view: integers as-is, currency in units
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(n) => Some(*n as f64),
            FieldValue::Currency(cents) => Some(*cents as f64 / 100.0),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

// ============================================================================
// STRUCTURAL ERRORS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StructuralErrorKind {
    #[serde(rename = "LINE_LENGTH_ERROR")]
    LineLength,
    #[serde(rename = "UNKNOWN_RECORD_TYPE")]
    UnknownRecordType,
}

impl StructuralErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            StructuralErrorKind::LineLength => "LINE_LENGTH_ERROR",
            StructuralErrorKind::UnknownRecordType => "UNKNOWN_RECORD_TYPE",
        }
    }
}

/// Line-local, non-fatal parse problem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuralError {
    pub line_number: usize,
    pub kind: StructuralErrorKind,
    pub message: String,
}

impl fmt::Display for StructuralError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {} [{}]: {}", self.line_number, self.kind.code(), self.message)
    }
}

// ============================================================================
// FILE RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// 1-based line number in the source file
    pub line_number: usize,

    /// Original line (line endings stripped) for diagnostics
    pub raw_line: String,

    /// Leading record-type code (empty when the line is too short to carry one)
    pub record_type: String,

    pub fields: BTreeMap<String, FieldValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structural_error: Option<StructuralError>,
}

impl FileRecord {
    pub fn is_valid(&self) -> bool {
        self.structural_error.is_none()
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Character length of the raw line
    pub fn line_length(&self) -> usize {
        self.raw_line.chars().count()
    }
}

// ============================================================================
// PARSING
// ============================================================================

/// Parse one line against a schema.
///
/// A length mismatch or an unregistered record type produces exactly one
/// structural error and no fields; it never panics.
pub fn parse_line(line_number: usize, raw_line: &str, schema: &FileSchema) -> FileRecord {
    let line = raw_line.trim_end_matches(['\r', '\n']);
    let chars: Vec<char> = line.chars().collect();

    let record_type = slice(&chars, schema.record_type_offset, schema.record_type_length)
        .unwrap_or_default();

    let mut record = FileRecord {
        line_number,
        raw_line: line.to_string(),
        record_type,
        fields: BTreeMap::new(),
        structural_error: None,
    };

    if chars.len() != schema.line_length {
        record.structural_error = Some(StructuralError {
            line_number,
            kind: StructuralErrorKind::LineLength,
            message: format!(
                "Line length is {}, expected {}",
                chars.len(),
                schema.line_length
            ),
        });
        return record;
    }

    let Some(layout) = schema.layout(&record.record_type) else {
        record.structural_error = Some(StructuralError {
            line_number,
            kind: StructuralErrorKind::UnknownRecordType,
            message: format!("Unknown record type '{}'", record.record_type),
        });
        return record;
    };

    for field in &layout.fields {
        // Schema validation guarantees the slice is in bounds
        let raw = slice(&chars, field.offset, field.length).unwrap_or_default();
        record.fields.insert(field.name.clone(), coerce(&raw, field));
    }

    record
}

/// Parse every line, numbering from 1. A bad line never stops the ones after it.
pub fn parse_lines<I, S>(lines: I, schema: &FileSchema) -> Vec<FileRecord>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    lines
        .into_iter()
        .enumerate()
        .map(|(idx, line)| parse_line(idx + 1, line.as_ref(), schema))
        .collect()
}

fn slice(chars: &[char], offset: usize, length: usize) -> Option<String> {
    let end = offset.checked_add(length)?;
    chars.get(offset..end).map(|s| s.iter().collect())
}

fn coerce(raw: &str, field: &FieldDef) -> FieldValue {
    let trimmed = raw.trim();

    match field.field_type {
        FieldType::String => {
            if field.trim {
                FieldValue::Text(trimmed.to_string())
            } else {
                FieldValue::Text(raw.to_string())
            }
        }
        FieldType::Integer => FieldValue::Integer(trimmed.parse().unwrap_or(0)),
        FieldType::Currency => FieldValue::Currency(trimmed.parse().unwrap_or(0)),
        FieldType::Boolean => FieldValue::Boolean(field.is_true_sentinel(trimmed)),
        FieldType::Date => {
            if trimmed.is_empty() || trimmed.chars().all(|c| c == '0') {
                return FieldValue::Null;
            }
            NaiveDate::parse_from_str(trimmed, field.date_format())
                .map(FieldValue::Date)
                .unwrap_or(FieldValue::Null)
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::RecordLayout;

    fn schema() -> FileSchema {
        FileSchema::new("R01")
            .with_record(
                "01",
                RecordLayout::new(vec![
                    FieldDef::new("account", 2, 10, FieldType::String),
                    FieldDef::new("date", 12, 8, FieldType::Date),
                    FieldDef::new("amount", 20, 12, FieldType::Currency),
                    FieldDef::new("count", 32, 5, FieldType::Integer),
                    FieldDef::new("active", 37, 1, FieldType::Boolean),
                    FieldDef::new("memo", 38, 6, FieldType::String).untrimmed(),
                ]),
            )
    }

    /// Pad to exactly 77 characters
    fn line(body: &str) -> String {
        format!("{:<77}", body)
    }

    #[test]
    fn test_parse_valid_line() {
        let raw = line("01ACC-0000012024013100000012345600004SMEMO  ");
        let record = parse_line(3, &raw, &schema());

        assert!(record.is_valid());
        assert_eq!(record.line_number, 3);
        assert_eq!(record.record_type, "01");
        assert_eq!(record.field("account"), Some(&FieldValue::Text("ACC-000001".into())));
        assert_eq!(
            record.field("date"),
            Some(&FieldValue::Date(NaiveDate::from_ymd_opt(2024, 1, 31).unwrap()))
        );
        assert_eq!(record.field("amount"), Some(&FieldValue::Currency(123456)));
        assert_eq!(record.field("amount").unwrap().render(), "1234.56");
        assert_eq!(record.field("count"), Some(&FieldValue::Integer(4)));
        assert_eq!(record.field("active"), Some(&FieldValue::Boolean(true)));
        assert_eq!(record.field("memo"), Some(&FieldValue::Text("MEMO  ".into())));
    }

    #[test]
    fn test_wrong_length_yields_single_error_and_no_fields() {
        let record = parse_line(1, "01SHORT", &schema());

        let err = record.structural_error.as_ref().unwrap();
        assert_eq!(err.kind, StructuralErrorKind::LineLength);
        assert_eq!(err.kind.code(), "LINE_LENGTH_ERROR");
        assert!(err.message.contains('7'));
        assert!(err.message.contains("77"));
        assert!(record.fields.is_empty());
    }

    #[test]
    fn test_unknown_record_type() {
        let record = parse_line(2, &line("99whatever"), &schema());

        let err = record.structural_error.as_ref().unwrap();
        assert_eq!(err.kind, StructuralErrorKind::UnknownRecordType);
        assert_eq!(record.record_type, "99");
        assert!(record.fields.is_empty());
    }

    #[test]
    fn test_coercion_fallbacks() {
        let raw = line("01ACC       99999999    ABC     xxxxxN");
        let record = parse_line(1, &raw, &schema());

        assert!(record.is_valid());
        assert_eq!(record.field("date"), Some(&FieldValue::Null));
        assert_eq!(record.field("amount"), Some(&FieldValue::Currency(0)));
        assert_eq!(record.field("count"), Some(&FieldValue::Integer(0)));
        assert_eq!(record.field("active"), Some(&FieldValue::Boolean(false)));
    }

    #[test]
    fn test_zero_date_is_null() {
        let raw = line("01ACC       00000000");
        let record = parse_line(1, &raw, &schema());
        assert_eq!(record.field("date"), Some(&FieldValue::Null));
    }

    #[test]
    fn test_negative_currency_render() {
        assert_eq!(FieldValue::Currency(-5).render(), "-0.05");
        assert_eq!(FieldValue::Currency(-12345).render(), "-123.45");
    }

    #[test]
    fn test_crlf_stripped() {
        let raw = format!("{}\r\n", line("01ACC"));
        let record = parse_line(1, &raw, &schema());
        assert!(record.is_valid());
        assert_eq!(record.line_length(), 77);
    }

    #[test]
    fn test_bad_line_does_not_stop_following_lines() {
        let lines = vec![line("01A"), "bad".to_string(), line("77X"), line("01B")];
        let records = parse_lines(&lines, &schema());

        assert_eq!(records.len(), 4);
        assert_eq!(
            records.iter().map(|r| r.line_number).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
        assert!(records[0].is_valid());
        assert!(!records[1].is_valid());
        assert!(!records[2].is_valid());
        assert!(records[3].is_valid());
    }
}
