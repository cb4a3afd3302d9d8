//! `starling` — load and inspect the Starling warehouse.
//!
//! # Usage
//!
//! ```
//! starling --config starling.toml init
//! starling load --table DimFacility --input facilities.json
//! starling run --input-dir extract/2025-01-07
//! starling watermarks
//! ```
//!
//! Input files are JSON arrays of `{ "event_time": …, "values": { … } }`.
//! Results are printed to stdout as JSON; logs go to stderr.

mod settings;

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::{Context as _, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use settings::Settings;
use starling_core::{
  LoadEngine, LoadPlan, SourceRow,
  store::WarehouseStore,
  validate::IntegrityValidator,
  value::parse_timestamp,
  watermark::WatermarkTracker,
};
use starling_store_sqlite::{SqliteStore, render_ddl};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

// ─── CLI args ─────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "starling", version, about = "Incremental loader for the Starling warehouse")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "starling.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print the warehouse DDL for the configured catalog.
  Ddl,
  /// Create the warehouse tables.
  Init,
  /// Check the catalog and audit the stored rows.
  Validate,
  /// Show every relationship that starts or ends at a table.
  Relationships {
    #[arg(long)]
    table: String,
  },
  /// Load one batch into one table.
  Load {
    #[arg(long)]
    table: String,
    /// JSON array of source rows.
    #[arg(long)]
    input: PathBuf,
  },
  /// Load every `<Table>.json` in a directory, in dependency order.
  Run {
    #[arg(long)]
    input_dir: PathBuf,
  },
  /// Print all watermarks.
  Watermarks,
  /// Move a table's watermark, e.g. to reprocess from an earlier point.
  ResetWatermark {
    #[arg(long)]
    table: String,
    /// RFC 3339 timestamp.
    #[arg(long)]
    to:    String,
  },
  /// Print the dead letters recorded for a table.
  DeadLetters {
    #[arg(long)]
    table: String,
  },
}

// ─── Entry point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();
  let settings = Settings::load(&cli.config)?;

  match cli.command {
    Command::Ddl => {
      let catalog = settings.catalog()?;
      println!("{}", render_ddl(&catalog));
    }
    Command::Init => {
      let engine = open_engine(&settings).await?;
      engine.prepare().await.context("creating warehouse tables")?;
      tracing::info!(store = %settings.store_path.display(), "warehouse initialised");
    }
    Command::Validate => {
      let catalog = settings.catalog()?;
      let structural = IntegrityValidator::validate(&catalog);
      if !structural.is_clean() {
        print_json(&structural)?;
        bail!("catalog has {} structural issue(s)", structural.issues.len());
      }
      let engine = open_engine(&settings).await?;
      let report = engine.audit().await.context("auditing the warehouse")?;
      print_json(&report)?;
      if !report.is_clean() {
        bail!("audit found {} issue(s)", report.issues.len());
      }
    }
    Command::Relationships { table } => {
      let catalog = settings.catalog()?;
      if catalog.get(&table).is_none() {
        bail!("unknown table {table:?}");
      }
      print_json(&catalog.relationships_of(&table))?;
    }
    Command::Load { table, input } => {
      let rows = read_rows(&input)?;
      let engine = open_engine(&settings).await?;
      let result = engine
        .load(&table, rows)
        .await
        .with_context(|| format!("loading {table}"))?;
      print_json(&result)?;
    }
    Command::Run { input_dir } => {
      let engine = open_engine(&settings).await?;
      let plan = read_plan(&input_dir, engine.catalog().tables().map(|t| t.name()))?;
      let report = engine.run(plan).await.context("load run aborted")?;
      print_json(&report)?;
      if !report.is_success() {
        bail!(
          "{} table(s) failed, {} skipped",
          report.failed.len(),
          report.skipped.len()
        );
      }
    }
    Command::Watermarks => {
      let engine = open_engine(&settings).await?;
      print_json(&engine.watermarks().snapshot().await)?;
    }
    Command::ResetWatermark { table, to } => {
      let engine = open_engine(&settings).await?;
      if engine.catalog().get(&table).is_none() {
        bail!("unknown table {table:?}");
      }
      let Some(to) = parse_timestamp(&to) else {
        bail!("{to:?} is not a timestamp");
      };
      let watermark = engine
        .watermarks()
        .reset(&table, to)
        .await
        .context("resetting watermark")?;
      print_json(&watermark)?;
    }
    Command::DeadLetters { table } => {
      let engine = open_engine(&settings).await?;
      let dead_letters = engine
        .store()
        .dead_letters(&table)
        .await
        .context("reading dead letters")?;
      print_json(&dead_letters)?;
    }
  }

  Ok(())
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

async fn open_engine(settings: &Settings) -> Result<LoadEngine<SqliteStore, SqliteStore>> {
  let catalog = settings.catalog()?;
  let store = SqliteStore::open(&settings.store_path)
    .await
    .with_context(|| format!("failed to open store at {:?}", settings.store_path))?;
  let watermarks = WatermarkTracker::open(store.clone())
    .await
    .context("loading watermarks")?;
  let engine = LoadEngine::new(Arc::new(catalog), store, watermarks)
    .context("catalog is not loadable")?;
  engine.prepare().await.context("creating warehouse tables")?;
  Ok(engine)
}

fn read_rows(path: &Path) -> Result<Vec<SourceRow>> {
  let raw = std::fs::read_to_string(path)
    .with_context(|| format!("reading {}", path.display()))?;
  serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

/// One batch per catalog table that has a `<Table>.json` in `dir`.
fn read_plan<'a>(dir: &Path, tables: impl Iterator<Item = &'a str>) -> Result<LoadPlan> {
  let mut plan = LoadPlan::new();
  for table in tables {
    let path = dir.join(format!("{table}.json"));
    if path.is_file() {
      plan.insert(table.to_owned(), read_rows(&path)?);
    }
  }
  if plan.is_empty() {
    bail!("no <Table>.json files found in {}", dir.display());
  }
  tracing::info!(tables = plan.len(), dir = %dir.display(), "read load plan");
  Ok(plan)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}
