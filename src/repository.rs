// 🗄️ Collaborators
// Where rules, catalogs and file contents come from. The engine owns none of this storage.

use crate::catalog::CatalogSource;
use crate::context::FileData;
use crate::rules::RuleDefinition;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::RwLock;

#[async_trait]
pub trait RuleRepository: Send + Sync {
    /// Rules whose effective window covers `as_of`
    async fn get_active_rules(&self, as_of: NaiveDate) -> Result<Vec<RuleDefinition>>;
}

#[async_trait]
pub trait FileDataLoader: Send + Sync {
    async fn load_file_data(&self, file_id: &str) -> Result<FileData>;
}

// ============================================================================
// IN-MEMORY IMPLEMENTATIONS
// ============================================================================

#[derive(Debug, Default)]
pub struct InMemoryRuleRepository {
    rules: RwLock<Vec<RuleDefinition>>,
}

impl InMemoryRuleRepository {
    pub fn new(rules: Vec<RuleDefinition>) -> Self {
        InMemoryRuleRepository {
            rules: RwLock::new(rules),
        }
    }

    pub fn add(&self, rule: RuleDefinition) {
        self.rules.write().unwrap_or_else(|p| p.into_inner()).push(rule);
    }
}

#[async_trait]
impl RuleRepository for InMemoryRuleRepository {
    async fn get_active_rules(&self, as_of: NaiveDate) -> Result<Vec<RuleDefinition>> {
        let rules = self.rules.read().unwrap_or_else(|p| p.into_inner());
        Ok(rules.iter().filter(|r| r.is_effective_on(as_of)).cloned().collect())
    }
}

/// Catalog entry with its own validity window
#[derive(Debug, Clone)]
struct DatedEntry {
    value: String,
    valid_from: Option<NaiveDate>,
    valid_to: Option<NaiveDate>,
}

impl DatedEntry {
    fn is_valid_on(&self, date: NaiveDate) -> bool {
        self.valid_from.map_or(true, |from| from <= date) && self.valid_to.map_or(true, |to| date <= to)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCatalogSource {
    catalogs: RwLock<HashMap<String, Vec<DatedEntry>>>,
}

impl InMemoryCatalogSource {
    pub fn new() -> Self {
        InMemoryCatalogSource::default()
    }

    /// Builder pattern: entries valid on every date
    pub fn with_catalog<I, S>(self, name: &str, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.insert(name, entries, None, None);
        self
    }

    pub fn insert<I, S>(&self, name: &str, entries: I, valid_from: Option<NaiveDate>, valid_to: Option<NaiveDate>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut catalogs = self.catalogs.write().unwrap_or_else(|p| p.into_inner());
        catalogs.entry(name.to_string()).or_default().extend(entries.into_iter().map(|e| DatedEntry {
            value: e.into(),
            valid_from,
            valid_to,
        }));
    }

    fn entries_on(entries: &[DatedEntry], as_of: NaiveDate) -> Vec<String> {
        entries
            .iter()
            .filter(|e| e.is_valid_on(as_of))
            .map(|e| e.value.clone())
            .collect()
    }
}

#[async_trait]
impl CatalogSource for InMemoryCatalogSource {
    async fn get_catalog(&self, name: &str, as_of: NaiveDate) -> Result<Vec<String>> {
        let catalogs = self.catalogs.read().unwrap_or_else(|p| p.into_inner());
        let entries = catalogs
            .get(name)
            .ok_or_else(|| anyhow!("catalog '{}' does not exist", name))?;
        Ok(Self::entries_on(entries, as_of))
    }

    async fn get_catalogs(&self, as_of: NaiveDate) -> Result<HashMap<String, Vec<String>>> {
        let catalogs = self.catalogs.read().unwrap_or_else(|p| p.into_inner());
        Ok(catalogs
            .iter()
            .map(|(name, entries)| (name.clone(), Self::entries_on(entries, as_of)))
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryFileLoader {
    files: RwLock<HashMap<String, FileData>>,
}

impl InMemoryFileLoader {
    pub fn new() -> Self {
        InMemoryFileLoader::default()
    }

    /// Builder pattern: register a file
    pub fn with_file(self, file_id: &str, data: FileData) -> Self {
        self.insert(file_id, data);
        self
    }

    pub fn insert(&self, file_id: &str, data: FileData) {
        self.files
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(file_id.to_string(), data);
    }
}

#[async_trait]
impl FileDataLoader for InMemoryFileLoader {
    async fn load_file_data(&self, file_id: &str) -> Result<FileData> {
        self.files
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(file_id)
            .cloned()
            .ok_or_else(|| anyhow!("file '{}' not found", file_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::ValidationKind;
    use serde_json::json;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn test_active_rules_filtered_by_window() {
        let repo = InMemoryRuleRepository::new(vec![
            RuleDefinition::new("OLD", "old", ValidationKind::FieldLength, json!({}), date(2020, 1, 1))
                .with_effective_to(date(2023, 12, 31)),
            RuleDefinition::new("NEW", "new", ValidationKind::FieldLength, json!({}), date(2024, 1, 1)),
        ]);

        let active = repo.get_active_rules(date(2024, 6, 1)).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].code, "NEW");

        let active = repo.get_active_rules(date(2023, 6, 1)).await.unwrap();
        assert_eq!(active[0].code, "OLD");
    }

    #[tokio::test]
    async fn test_catalog_entries_scoped_to_date() {
        let source = InMemoryCatalogSource::new().with_catalog("currencies", ["MXN"]);
        source.insert("currencies", ["USD"], Some(date(2024, 6, 1)), None);

        assert_eq!(source.get_catalog("currencies", date(2024, 1, 1)).await.unwrap(), vec!["MXN"]);
        assert_eq!(source.get_catalog("currencies", date(2024, 7, 1)).await.unwrap().len(), 2);
        assert!(source.get_catalog("missing", date(2024, 1, 1)).await.is_err());
        assert_eq!(source.get_catalogs(date(2024, 1, 1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_loader() {
        let loader = InMemoryFileLoader::new().with_file(
            "F1",
            FileData::new("R01", date(2024, 1, 31), vec!["01".into()]),
        );
        assert_eq!(loader.load_file_data("F1").await.unwrap().file_type, "R01");
        assert!(loader.load_file_data("F2").await.is_err());
    }
}
