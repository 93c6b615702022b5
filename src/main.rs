// 🧾 Compliance Rules CLI
// Import rules, catalogs and files into SQLite, then run validation passes against them

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use compliance_rules::db::{
    insert_catalog_entries, insert_file, insert_rules, load_catalog_csv, record_validation,
};
use compliance_rules::{
    load_rules_file, EngineConfig, FileData, FileValidationResult, OverallStatus, SchemaRegistry,
    SqliteStore, ValidationEngine,
};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "compliance-rules",
    version,
    about = "Validate fixed-width regulatory files against dated rule sets"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// SQLite database holding rules, catalogs and files
    #[arg(long, env = "DATABASE_PATH", default_value = "compliance.db", global = true)]
    db: PathBuf,

    /// JSON file with the file-type layouts
    #[arg(long, env = "SCHEMA_PATH", default_value = "schemas.json", global = true)]
    schemas: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Import (or update) rule definitions from a JSON array
    ImportRules {
        #[arg(value_name = "RULES_JSON")]
        path: PathBuf,
    },

    /// Import catalog entries from the first column of a CSV file
    ImportCatalog {
        name: String,
        #[arg(value_name = "ENTRIES_CSV")]
        path: PathBuf,
        #[arg(long)]
        valid_from: Option<NaiveDate>,
        #[arg(long)]
        valid_to: Option<NaiveDate>,
    },

    /// Store a file's raw lines under an id
    ImportFile {
        file_id: String,
        file_type: String,
        operative_date: NaiveDate,
        path: PathBuf,
    },

    /// Run a validation pass over a stored file
    Validate {
        file_id: String,
        /// Rule and catalog version date (defaults to today)
        #[arg(long)]
        as_of: Option<NaiveDate>,
        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_logging();

    let cli = Cli::parse();
    let exit_code = match run(cli).await {
        Ok(code) => code,
        Err(error) => {
            tracing::error!("{:#}", error);
            eprintln!("❌ {:#}", error);
            2
        }
    };
    std::process::exit(exit_code);
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "compliance_rules=info".into());

    if std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false) {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let store = Arc::new(SqliteStore::open(&cli.db)?);

    match cli.command {
        Command::ImportRules { path } => {
            let rules = load_rules_file(&path)?;
            let changed = store.with_conn(|conn| insert_rules(conn, &rules))?;
            println!("✓ Loaded {} rules ({} new or changed)", rules.len(), changed);
            Ok(0)
        }
        Command::ImportCatalog {
            name,
            path,
            valid_from,
            valid_to,
        } => {
            let entries = load_catalog_csv(&path)?;
            let inserted =
                store.with_conn(|conn| insert_catalog_entries(conn, &name, &entries, valid_from, valid_to))?;
            println!("✓ Catalog '{}': {} entries read, {} inserted", name, entries.len(), inserted);
            Ok(0)
        }
        Command::ImportFile {
            file_id,
            file_type,
            operative_date,
            path,
        } => {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read file: {:?}", path))?;
            let lines = content.lines().map(str::to_string).collect();
            let data = FileData::new(file_type, operative_date, lines);
            let count = store.with_conn(|conn| insert_file(conn, &file_id, &data))?;
            println!("✓ Stored {} lines as '{}'", count, file_id);
            Ok(0)
        }
        Command::Validate { file_id, as_of, json } => {
            let schemas = SchemaRegistry::from_file(&cli.schemas)?;
            let config = EngineConfig::from_env()?;
            let engine = ValidationEngine::new(store.clone(), store.clone(), store.clone(), schemas)
                .with_config(config);

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, cancelling validation pass");
                    on_signal.cancel();
                }
            });

            let as_of = as_of.unwrap_or_else(|| Utc::now().date_naive());
            let report = engine.validate_file_with_cancel(&file_id, as_of, cancel).await?;
            store.with_conn(|conn| record_validation(conn, &report))?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }

            Ok(if report.overall_status == OverallStatus::Pass { 0 } else { 1 })
        }
    }
}

fn print_report(report: &FileValidationResult) {
    println!("📋 {} ({}, operative {})", report.file_id, report.file_type, report.operative_date);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    for error in &report.structural_errors {
        println!("  ⚠️  line {}: {}", error.line_number, error.message);
    }

    for result in &report.results {
        let icon = if result.is_passed() {
            "✅"
        } else if result.is_skipped() {
            "⏭️ "
        } else if result.is_failed() {
            "❌"
        } else {
            "⏹️ "
        };
        println!("{} {} [{}] {}", icon, result.rule_code, result.status, result.rule_name);
        if let Some(reason) = &result.skip_reason {
            println!("     {}", reason);
        }
        for error in result.errors.iter().take(10) {
            println!("     line {} ({}): {}", error.line_number, error.severity, error.message);
        }
        if result.errors.len() > 10 {
            println!("     … {} more", result.errors.len() - 10);
        }
    }

    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("{}", report.summary());
}
