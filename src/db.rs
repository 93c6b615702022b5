use crate::catalog::CatalogSource;
use crate::compiler::fingerprint;
use crate::context::FileData;
use crate::repository::{FileDataLoader, RuleRepository};
use crate::result::FileValidationResult;
use crate::rules::RuleDefinition;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// Event for the audit trail
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Rule definitions (one row per code + effective window start)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS rule_definitions (
            code TEXT NOT NULL,
            effective_from TEXT NOT NULL,
            effective_to TEXT,
            definition TEXT NOT NULL,
            definition_hash TEXT NOT NULL,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (code, effective_from)
        )",
        [],
    )?;

    // ==========================================================================
    // Catalog entries with validity windows
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS catalog_entries (
            catalog TEXT NOT NULL,
            value TEXT NOT NULL,
            valid_from TEXT NOT NULL DEFAULT '0000-01-01',
            valid_to TEXT,
            PRIMARY KEY (catalog, value, valid_from)
        )",
        [],
    )?;

    // ==========================================================================
    // Regulatory files and their raw lines
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS files (
            file_id TEXT PRIMARY KEY,
            file_type TEXT NOT NULL,
            operative_date TEXT NOT NULL,
            line_count INTEGER NOT NULL,
            imported_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS file_lines (
            file_id TEXT NOT NULL,
            line_number INTEGER NOT NULL,
            raw_line TEXT NOT NULL,
            PRIMARY KEY (file_id, line_number)
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_rules_window ON rule_definitions(effective_from, effective_to)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_catalog_name ON catalog_entries(catalog)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// RULES
// ============================================================================

/// Insert or update rule definitions. Unchanged definitions are skipped.
pub fn insert_rules(conn: &Connection, rules: &[RuleDefinition]) -> Result<usize> {
    let mut changed = 0;

    for rule in rules {
        let definition = serde_json::to_string(rule)?;
        let definition_hash = fingerprint(&rule.validation);

        let rows = conn.execute(
            "INSERT INTO rule_definitions (code, effective_from, effective_to, definition, definition_hash)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(code, effective_from) DO UPDATE SET
                effective_to = excluded.effective_to,
                definition = excluded.definition,
                definition_hash = excluded.definition_hash,
                updated_at = CURRENT_TIMESTAMP
             WHERE rule_definitions.definition != excluded.definition",
            params![
                rule.code,
                rule.effective_from.to_string(),
                rule.effective_to.map(|d| d.to_string()),
                definition,
                definition_hash,
            ],
        )?;

        if rows > 0 {
            changed += 1;
            let event = Event::new(
                "rule_imported",
                "rule",
                &rule.code,
                serde_json::json!({
                    "kind": rule.kind().name(),
                    "effective_from": rule.effective_from,
                    "effective_to": rule.effective_to,
                }),
                "rule_importer",
            );
            let _ = insert_event(conn, &event);
        }
    }

    Ok(changed)
}

pub fn get_active_rules(conn: &Connection, as_of: NaiveDate) -> Result<Vec<RuleDefinition>> {
    let mut stmt = conn.prepare(
        "SELECT definition FROM rule_definitions
         WHERE effective_from <= ?1 AND (effective_to IS NULL OR effective_to >= ?1)
         ORDER BY code, effective_from",
    )?;

    let rows = stmt
        .query_map(params![as_of.to_string()], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    rows.iter()
        .map(|json| serde_json::from_str(json).context("Failed to parse stored rule definition"))
        .collect()
}

// ============================================================================
// CATALOGS
// ============================================================================

/// Read catalog entries from the first column of a CSV file (header row expected)
pub fn load_catalog_csv(csv_path: &Path) -> Result<Vec<String>> {
    let mut rdr = csv::Reader::from_path(csv_path)
        .with_context(|| format!("Failed to open catalog CSV: {:?}", csv_path))?;

    let mut entries = Vec::new();
    for record in rdr.records() {
        let record = record.context("Failed to read catalog row")?;
        if let Some(value) = record.get(0).map(str::trim).filter(|v| !v.is_empty()) {
            entries.push(value.to_string());
        }
    }

    Ok(entries)
}

pub fn insert_catalog_entries(
    conn: &Connection,
    catalog: &str,
    entries: &[String],
    valid_from: Option<NaiveDate>,
    valid_to: Option<NaiveDate>,
) -> Result<usize> {
    let from = valid_from.map_or_else(|| "0000-01-01".to_string(), |d| d.to_string());
    let to = valid_to.map(|d| d.to_string());
    let tx = conn.unchecked_transaction()?;
    let mut inserted = 0;

    for entry in entries {
        inserted += tx.execute(
            "INSERT OR IGNORE INTO catalog_entries (catalog, value, valid_from, valid_to) VALUES (?1, ?2, ?3, ?4)",
            params![catalog, entry.trim(), from, to],
        )?;
    }
    tx.commit()?;

    let event = Event::new(
        "catalog_imported",
        "catalog",
        catalog,
        serde_json::json!({ "entries": entries.len(), "inserted": inserted }),
        "catalog_importer",
    );
    let _ = insert_event(conn, &event);

    Ok(inserted)
}

pub fn get_catalog(conn: &Connection, catalog: &str, as_of: NaiveDate) -> Result<Vec<String>> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM catalog_entries WHERE catalog = ?1 LIMIT 1",
            params![catalog],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(anyhow!("catalog '{}' does not exist", catalog));
    }

    let mut stmt = conn.prepare(
        "SELECT value FROM catalog_entries
         WHERE catalog = ?1 AND valid_from <= ?2 AND (valid_to IS NULL OR valid_to >= ?2)
         ORDER BY value",
    )?;
    let values = stmt
        .query_map(params![catalog, as_of.to_string()], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;

    Ok(values)
}

pub fn get_catalogs(conn: &Connection, as_of: NaiveDate) -> Result<HashMap<String, Vec<String>>> {
    let mut stmt = conn.prepare(
        "SELECT catalog, value FROM catalog_entries
         WHERE valid_from <= ?1 AND (valid_to IS NULL OR valid_to >= ?1)
         ORDER BY catalog, value",
    )?;

    let mut catalogs: HashMap<String, Vec<String>> = HashMap::new();
    let rows = stmt.query_map(params![as_of.to_string()], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    for row in rows {
        let (catalog, value) = row?;
        catalogs.entry(catalog).or_default().push(value);
    }

    Ok(catalogs)
}

// ============================================================================
// FILES
// ============================================================================

/// Store a file's raw lines, replacing any previous import under the same id
pub fn insert_file(conn: &Connection, file_id: &str, data: &FileData) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;

    tx.execute("DELETE FROM file_lines WHERE file_id = ?1", params![file_id])?;
    tx.execute(
        "INSERT OR REPLACE INTO files (file_id, file_type, operative_date, line_count) VALUES (?1, ?2, ?3, ?4)",
        params![
            file_id,
            data.file_type,
            data.operative_date.to_string(),
            data.raw_lines.len() as i64,
        ],
    )?;

    {
        let mut stmt =
            tx.prepare("INSERT INTO file_lines (file_id, line_number, raw_line) VALUES (?1, ?2, ?3)")?;
        for (idx, line) in data.raw_lines.iter().enumerate() {
            stmt.execute(params![file_id, (idx + 1) as i64, line])?;
        }
    }
    tx.commit()?;

    let event = Event::new(
        "file_imported",
        "file",
        file_id,
        serde_json::json!({
            "file_type": data.file_type,
            "operative_date": data.operative_date,
            "lines": data.raw_lines.len(),
        }),
        "file_importer",
    );
    let _ = insert_event(conn, &event);

    Ok(data.raw_lines.len())
}

pub fn load_file(conn: &Connection, file_id: &str) -> Result<FileData> {
    let header: Option<(String, String)> = conn
        .query_row(
            "SELECT file_type, operative_date FROM files WHERE file_id = ?1",
            params![file_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let (file_type, operative_date) = header.ok_or_else(|| anyhow!("file '{}' not found", file_id))?;
    let operative_date = NaiveDate::parse_from_str(&operative_date, "%Y-%m-%d")
        .with_context(|| format!("Invalid operative date stored for file '{}'", file_id))?;

    let mut stmt = conn.prepare("SELECT raw_line FROM file_lines WHERE file_id = ?1 ORDER BY line_number")?;
    let raw_lines = stmt
        .query_map(params![file_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;

    Ok(FileData {
        file_type,
        operative_date,
        raw_lines,
    })
}

// ============================================================================
// AUDIT TRAIL
// ============================================================================

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY id DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
                    .map_err(|_| rusqlite::Error::InvalidQuery)?
                    .with_timezone(&Utc),
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json)
                    .map_err(|_| rusqlite::Error::InvalidQuery)?,
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

/// Record a completed validation pass
pub fn record_validation(conn: &Connection, report: &FileValidationResult) -> Result<()> {
    let event = Event::new(
        "validation_completed",
        "file",
        &report.file_id,
        serde_json::json!({
            "pass_id": report.pass_id,
            "as_of": report.as_of,
            "status": report.overall_status,
            "total_rules": report.total_rules,
            "passed_rules": report.passed_rules,
            "failed_rules": report.failed_rules,
            "skipped_rules": report.skipped_rules,
            "structural_errors": report.structural_errors.len(),
        }),
        "validation_engine",
    );
    insert_event(conn, &event)
}

// ============================================================================
// SQLITE STORE (all three collaborators over one connection)
// ============================================================================

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open database: {:?}", path.as_ref()))?;
        setup_database(&conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        setup_database(&conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    /// Run a closure against the connection
    pub fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        f(&conn)
    }
}

#[async_trait]
impl RuleRepository for SqliteStore {
    async fn get_active_rules(&self, as_of: NaiveDate) -> Result<Vec<RuleDefinition>> {
        self.with_conn(|conn| get_active_rules(conn, as_of))
    }
}

#[async_trait]
impl CatalogSource for SqliteStore {
    async fn get_catalog(&self, name: &str, as_of: NaiveDate) -> Result<Vec<String>> {
        self.with_conn(|conn| get_catalog(conn, name, as_of))
    }

    async fn get_catalogs(&self, as_of: NaiveDate) -> Result<HashMap<String, Vec<String>>> {
        self.with_conn(|conn| get_catalogs(conn, as_of))
    }
}

#[async_trait]
impl FileDataLoader for SqliteStore {
    async fn load_file_data(&self, file_id: &str) -> Result<FileData> {
        self.with_conn(|conn| load_file(conn, file_id))
    }
}
