//! SQL schema for the Starling SQLite store.
//!
//! Bookkeeping tables are created when a connection opens. Warehouse tables
//! are rendered from the catalog: table and column names are kept verbatim
//! so reporting queries can address them by their catalog names.

use std::fmt::Write as _;

use starling_core::{
  SchemaCatalog,
  catalog::{ColumnDef, DimensionDef, FactDef, RESERVED_COLUMNS, Reference, TableDef},
  value::DataType,
};

/// Bookkeeping DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const BOOKKEEPING: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS _watermarks (
    table_name        TEXT PRIMARY KEY,
    last_loaded_value TEXT NOT NULL,   -- ISO 8601 UTC event time
    last_run_status   TEXT NOT NULL,   -- 'SUCCESS' | 'FAILED'
    updated_at        TEXT NOT NULL
);

-- Greatest surrogate key ever minted per dimension. Never decreases, so
-- keys are not reused even if rows are deleted by hand.
CREATE TABLE IF NOT EXISTS _surrogate_sequences (
    table_name TEXT PRIMARY KEY,
    high_water INTEGER NOT NULL DEFAULT 0
);

-- Rows rejected by a batch, kept for inspection and reprocessing.
CREATE TABLE IF NOT EXISTS _dead_letters (
    dead_letter_id INTEGER PRIMARY KEY,
    run_id         TEXT NOT NULL,
    table_name     TEXT NOT NULL,
    row_index      INTEGER NOT NULL,
    row_id         TEXT,
    error_json     TEXT NOT NULL,
    row_json       TEXT NOT NULL,
    recorded_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS _dead_letters_table_idx ON _dead_letters(table_name);
CREATE INDEX IF NOT EXISTS _dead_letters_run_idx   ON _dead_letters(run_id);

PRAGMA user_version = 1;
";

/// Bookkeeping columns of every dimension table, after the data columns.
pub const DIMENSION_TRAILER: &[&str] = RESERVED_COLUMNS;

/// Bookkeeping columns of every fact table, after the measures: the two
/// load timestamps that close the reserved list.
pub const FACT_TRAILER: &[&str] = RESERVED_COLUMNS.split_at(RESERVED_COLUMNS.len() - 2).1;

/// Quote an identifier for SQLite.
pub fn ident(name: &str) -> String { format!("\"{}\"", name.replace('"', "\"\"")) }

fn sql_type(data_type: DataType) -> &'static str {
  match data_type {
    DataType::Integer | DataType::Boolean => "INTEGER",
    DataType::Decimal => "REAL",
    DataType::Text | DataType::Date | DataType::Timestamp => "TEXT",
  }
}

/// Physical column order of a dimension table.
pub fn dimension_columns(def: &DimensionDef) -> Vec<String> {
  std::iter::once(def.surrogate_key.clone())
    .chain(def.columns.iter().map(|c| c.name.clone()))
    .chain(def.references.iter().map(Reference::key_column))
    .chain(DIMENSION_TRAILER.iter().map(|c| (*c).to_owned()))
    .collect()
}

/// Physical column order of a fact table.
pub fn fact_columns(def: &FactDef) -> Vec<String> {
  def
    .columns
    .iter()
    .map(|c| c.name.clone())
    .chain(def.references.iter().map(Reference::key_column))
    .chain(def.measures.iter().map(|m| m.name.clone()))
    .chain(FACT_TRAILER.iter().map(|c| (*c).to_owned()))
    .collect()
}

fn reference_clause(catalog: &SchemaCatalog, r: &Reference, not_null: bool) -> String {
  let target_key = catalog
    .dimension(&r.target)
    .map_or_else(|| format!("{}Key", r.target), |d| d.surrogate_key.clone());
  format!(
    "    {} INTEGER{} REFERENCES {}({})",
    ident(&r.key_column()),
    if not_null { " NOT NULL" } else { "" },
    ident(&r.target),
    ident(&target_key)
  )
}

fn column_clause(c: &ColumnDef, not_null: bool) -> String {
  format!(
    "    {} {}{}",
    ident(&c.name),
    sql_type(c.data_type),
    if not_null { " NOT NULL" } else { "" }
  )
}

fn dimension_ddl(catalog: &SchemaCatalog, def: &DimensionDef) -> String {
  let is_key = |name: &str| def.natural_key.iter().any(|k| k == name);

  let mut lines = vec![format!("    {} INTEGER PRIMARY KEY", ident(&def.surrogate_key))];
  // Only the natural key is NOT NULL: inferred members carry nothing else.
  lines.extend(def.columns.iter().map(|c| column_clause(c, is_key(&c.name))));
  lines.extend(def.references.iter().map(|r| reference_clause(catalog, r, false)));
  lines.extend([
    format!("    {} TEXT", ident("EffectiveFrom")),
    format!("    {} TEXT", ident("EffectiveTo")),
    format!("    {} INTEGER NOT NULL DEFAULT 1", ident("IsCurrent")),
    format!("    {} INTEGER NOT NULL DEFAULT 0", ident("IsInferred")),
    format!("    {} TEXT NOT NULL", ident("EventTime")),
    format!("    {} TEXT NOT NULL", ident("LoadTime")),
  ]);

  let key_list = def
    .natural_key
    .iter()
    .map(|k| ident(k))
    .collect::<Vec<_>>()
    .join(", ");

  let mut out = format!(
    "CREATE TABLE IF NOT EXISTS {} (\n{}\n);\n",
    ident(&def.name),
    lines.join(",\n")
  );
  let _ = writeln!(
    out,
    "CREATE INDEX IF NOT EXISTS {} ON {}({key_list});",
    ident(&format!("{}_natural_idx", def.name)),
    ident(&def.name),
  );
  let _ = writeln!(
    out,
    "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {}({key_list}) WHERE {} = 1;",
    ident(&format!("{}_current_idx", def.name)),
    ident(&def.name),
    ident("IsCurrent"),
  );
  out
}

fn fact_ddl(catalog: &SchemaCatalog, def: &FactDef) -> String {
  let mut lines: Vec<String> = def
    .columns
    .iter()
    .map(|c| column_clause(c, !c.nullable))
    .collect();
  lines.extend(def.references.iter().map(|r| reference_clause(catalog, r, !r.optional)));
  lines.extend(def.measures.iter().map(|m| column_clause(m, false)));
  lines.push(format!("    {} TEXT NOT NULL", ident("EventTime")));
  lines.push(format!("    {} TEXT NOT NULL", ident("LoadTime")));
  lines.push(format!(
    "    PRIMARY KEY ({})",
    def.grain.iter().map(|g| ident(g)).collect::<Vec<_>>().join(", ")
  ));

  format!(
    "CREATE TABLE IF NOT EXISTS {} (\n{}\n);\n",
    ident(&def.name),
    lines.join(",\n")
  )
}

/// DDL for every table of `catalog`, in registration order.
pub fn render_ddl(catalog: &SchemaCatalog) -> String {
  catalog
    .tables()
    .map(|t| match t {
      TableDef::Dimension(d) => dimension_ddl(catalog, d),
      TableDef::Fact(f) => fact_ddl(catalog, f),
    })
    .collect::<Vec<_>>()
    .join("\n")
}
