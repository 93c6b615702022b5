// 📚 Catalog Cache
// Lookup tables scoped to a file's operative date, fetched once per pass and then frozen

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

/// External catalog service
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Entries of one catalog valid on `as_of`
    async fn get_catalog(&self, name: &str, as_of: NaiveDate) -> anyhow::Result<Vec<String>>;

    /// Every catalog valid on `as_of`
    async fn get_catalogs(&self, as_of: NaiveDate) -> anyhow::Result<HashMap<String, Vec<String>>>;
}

// ============================================================================
// CATALOG SET
// ============================================================================

/// Trimmed entries of one catalog, with a case-folded view for insensitive lookups
#[derive(Debug, Clone, Default)]
pub struct CatalogSet {
    entries: HashSet<String>,
    folded: HashSet<String>,
}

impl CatalogSet {
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries: HashSet<String> = entries
            .into_iter()
            .map(|e| e.as_ref().trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();
        let folded = entries.iter().map(|e| e.to_lowercase()).collect();

        CatalogSet { entries, folded }
    }

    /// `value` is trimmed before matching
    pub fn contains(&self, value: &str, case_insensitive: bool) -> bool {
        let value = value.trim();
        if case_insensitive {
            self.folded.contains(&value.to_lowercase())
        } else {
            self.entries.contains(value)
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// SNAPSHOT
// ============================================================================

/// Immutable catalog view shared by every rule of one pass
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    catalogs: HashMap<String, CatalogSet>,
}

impl CatalogSnapshot {
    pub fn new() -> Self {
        CatalogSnapshot::default()
    }

    /// Builder pattern: add a catalog
    pub fn with_catalog<I, S>(mut self, name: impl Into<String>, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.catalogs.insert(name.into(), CatalogSet::from_entries(entries));
        self
    }

    pub fn get(&self, name: &str) -> Option<&CatalogSet> {
        self.catalogs.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.catalogs.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.catalogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.catalogs.is_empty()
    }
}

// ============================================================================
// LOADER
// ============================================================================

pub struct CatalogCache;

impl CatalogCache {
    /// Bulk fetch, then fill in any `required` catalog the bulk result lacked.
    ///
    /// Fetch failures are logged, never fatal: a rule that needs a missing
    /// catalog faults on its own.
    pub async fn load(
        source: &dyn CatalogSource,
        as_of: NaiveDate,
        required: &BTreeSet<String>,
    ) -> CatalogSnapshot {
        let mut catalogs: HashMap<String, CatalogSet> = match source.get_catalogs(as_of).await {
            Ok(all) => all
                .into_iter()
                .map(|(name, entries)| (name, CatalogSet::from_entries(entries)))
                .collect(),
            Err(e) => {
                warn!(as_of = %as_of, error = %e, "bulk catalog fetch failed");
                HashMap::new()
            }
        };

        for name in required {
            if catalogs.contains_key(name) {
                continue;
            }
            match source.get_catalog(name, as_of).await {
                Ok(entries) => {
                    catalogs.insert(name.clone(), CatalogSet::from_entries(entries));
                }
                Err(e) => {
                    warn!(catalog = %name, as_of = %as_of, error = %e, "catalog fetch failed");
                }
            }
        }

        debug!(count = catalogs.len(), as_of = %as_of, "catalog snapshot loaded");
        CatalogSnapshot { catalogs }
    }
}

// ============================================================================
// TESTS
// ============================================================================
