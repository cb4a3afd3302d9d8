//! [`SqliteStore`] — the SQLite implementation of [`WarehouseStore`] and
//! [`WatermarkStore`].

use std::path::Path;

use chrono::Utc;
use rusqlite::{OptionalExtension as _, params_from_iter};
use starling_core::{
  SchemaCatalog,
  catalog::{DimensionDef, FactDef},
  row::{DeadLetter, DimensionRow, FactRow, SurrogateKey},
  store::{DimensionBatch, FactBatch, InferredMembers, WarehouseStore},
  watermark::{Watermark, WatermarkStore},
};

use crate::{
  Error, Result,
  encode::{
    EncodedDeadLetter, RawDeadLetter, RawRow, RawWatermark, decode_dimension_row,
    decode_fact_row, dimension_params, encode_dead_letter, encode_dt, fact_params,
  },
  schema::{BOOKKEEPING, dimension_columns, fact_columns, ident, render_ddl},
};

// ─── SQL builders ────────────────────────────────────────────────────────────

fn select_sql(table: &str, columns: &[String], order_by: &[String]) -> String {
  format!(
    "SELECT {} FROM {} ORDER BY {}",
    columns.iter().map(|c| ident(c)).collect::<Vec<_>>().join(", "),
    ident(table),
    order_by.iter().map(|c| ident(c)).collect::<Vec<_>>().join(", "),
  )
}

/// `INSERT … ON CONFLICT (conflict) DO UPDATE SET` every other column.
fn upsert_sql(table: &str, columns: &[String], conflict: &[String]) -> String {
  let placeholders = (1..=columns.len())
    .map(|i| format!("?{i}"))
    .collect::<Vec<_>>()
    .join(", ");
  let updates = columns
    .iter()
    .filter(|c| !conflict.contains(c))
    .map(|c| format!("{0} = excluded.{0}", ident(c)))
    .collect::<Vec<_>>()
    .join(", ");
  format!(
    "INSERT INTO {} ({}) VALUES ({placeholders}) ON CONFLICT ({}) DO UPDATE SET {updates}",
    ident(table),
    columns.iter().map(|c| ident(c)).collect::<Vec<_>>().join(", "),
    conflict.iter().map(|c| ident(c)).collect::<Vec<_>>().join(", "),
  )
}

fn insert_dead_letters(
  tx: &rusqlite::Transaction<'_>,
  dead_letters: &[EncodedDeadLetter],
  recorded_at: &str,
) -> rusqlite::Result<()> {
  let mut stmt = tx.prepare(
    "INSERT INTO _dead_letters
       (run_id, table_name, row_index, row_id, error_json, row_json, recorded_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
  )?;
  for dl in dead_letters {
    stmt.execute(rusqlite::params![
      dl.run_id,
      dl.table_name,
      dl.row_index,
      dl.row_id,
      dl.error_json,
      dl.row_json,
      recorded_at,
    ])?;
  }
  Ok(())
}

/// Inferred dimension rows ready to bind.
struct EncodedMembers {
  sql:        String,
  table:      String,
  rows:       Vec<Vec<rusqlite::types::Value>>,
  high_water: SurrogateKey,
}

fn encode_members(members: &InferredMembers) -> EncodedMembers {
  let def = &members.dimension;
  EncodedMembers {
    sql:        upsert_sql(&def.name, &dimension_columns(def), std::slice::from_ref(&def.surrogate_key)),
    table:      def.name.clone(),
    rows:       members.rows.iter().map(|r| dimension_params(def, r)).collect(),
    high_water: members.high_water,
  }
}

fn insert_members(tx: &rusqlite::Transaction<'_>, members: EncodedMembers) -> rusqlite::Result<()> {
  {
    let mut stmt = tx.prepare(&members.sql)?;
    for params in members.rows {
      stmt.execute(params_from_iter(params))?;
    }
  }
  bump_high_water(tx, &members.table, members.high_water)
}

fn bump_high_water(tx: &rusqlite::Transaction<'_>, table: &str, high_water: SurrogateKey) -> rusqlite::Result<()> {
  tx.execute(
    "INSERT INTO _surrogate_sequences (table_name, high_water) VALUES (?1, ?2)
     ON CONFLICT (table_name) DO UPDATE SET high_water = MAX(high_water, excluded.high_water)",
    rusqlite::params![table, high_water],
  )?;
  Ok(())
}

fn read_rows(conn: &rusqlite::Connection, sql: &str, width: usize) -> rusqlite::Result<Vec<RawRow>> {
  let mut stmt = conn.prepare(sql)?;
  stmt
    .query_map([], |row| {
      (0..width)
        .map(|i| row.get::<_, rusqlite::types::Value>(i))
        .collect::<rusqlite::Result<Vec<_>>>()
        .map(RawRow)
    })?
    .collect()
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// A warehouse backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and create the bookkeeping tables.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store, for tests.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(BOOKKEEPING)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Number of rows currently stored in `table`.
  pub async fn row_count(&self, table: &str) -> Result<u64> {
    let sql = format!("SELECT COUNT(*) FROM {}", ident(table));
    let count: i64 = self
      .conn
      .call(move |conn| Ok(conn.query_row(&sql, [], |row| row.get(0))?))
      .await?;
    Ok(u64::try_from(count).unwrap_or_default())
  }
}

// ─── WarehouseStore impl ─────────────────────────────────────────────────────

impl WarehouseStore for SqliteStore {
  type Error = Error;

  async fn prepare(&self, catalog: &SchemaCatalog) -> Result<()> {
    let ddl = render_ddl(catalog);
    tracing::debug!(tables = catalog.tables().count(), "creating warehouse tables");
    self
      .conn
      .call(move |conn| {
        conn.execute_batch(&ddl)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn dimension_rows(&self, def: &DimensionDef) -> Result<Vec<DimensionRow>> {
    let columns = dimension_columns(def);
    let width = columns.len();
    let sql = select_sql(&def.name, &columns, std::slice::from_ref(&def.surrogate_key));

    let raws = self
      .conn
      .call(move |conn| Ok(read_rows(conn, &sql, width)?))
      .await?;

    raws
      .into_iter()
      .map(|raw| decode_dimension_row(def, raw))
      .collect()
  }

  async fn surrogate_high_water(&self, dimension: &str) -> Result<SurrogateKey> {
    let table = dimension.to_owned();
    let high_water: Option<i64> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            "SELECT high_water FROM _surrogate_sequences WHERE table_name = ?1",
            rusqlite::params![table],
            |row| row.get(0),
          )
          .optional()?)
      })
      .await?;
    Ok(high_water.unwrap_or(0))
  }

  async fn commit_dimension(&self, def: &DimensionDef, batch: DimensionBatch) -> Result<()> {
    let columns = dimension_columns(def);
    let sql = upsert_sql(&def.name, &columns, std::slice::from_ref(&def.surrogate_key));
    let rows: Vec<_> = batch.rows.iter().map(|r| dimension_params(def, r)).collect();
    let dead_letters = batch
      .dead_letters
      .iter()
      .map(encode_dead_letter)
      .collect::<Result<Vec<_>>>()?;
    let table = def.name.clone();
    let high_water = batch.high_water;
    let recorded_at = encode_dt(Utc::now());

    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        {
          let mut stmt = tx.prepare(&sql)?;
          for params in rows {
            stmt.execute(params_from_iter(params))?;
          }
        }
        bump_high_water(&tx, &table, high_water)?;
        insert_dead_letters(&tx, &dead_letters, &recorded_at)?;
        tx.commit()?;
        Ok(())
      })
      .await?;

    tracing::debug!(table = %def.name, rows = batch.rows.len(), "dimension batch written");
    Ok(())
  }

  async fn fact_rows(&self, def: &FactDef) -> Result<Vec<FactRow>> {
    let columns = fact_columns(def);
    let width = columns.len();
    let sql = select_sql(&def.name, &columns, &def.grain);

    let raws = self
      .conn
      .call(move |conn| Ok(read_rows(conn, &sql, width)?))
      .await?;

    raws.into_iter().map(|raw| decode_fact_row(def, raw)).collect()
  }

  async fn commit_fact(&self, def: &FactDef, batch: FactBatch) -> Result<()> {
    let columns = fact_columns(def);
    let sql = upsert_sql(&def.name, &columns, &def.grain);
    let rows: Vec<_> = batch.rows.iter().map(|r| fact_params(def, r)).collect();
    let inferred: Vec<EncodedMembers> = batch.inferred.iter().map(encode_members).collect();
    let dead_letters = batch
      .dead_letters
      .iter()
      .map(encode_dead_letter)
      .collect::<Result<Vec<_>>>()?;
    let recorded_at = encode_dt(Utc::now());

    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        // Placeholders first so the fact rows' references hold.
        for members in inferred {
          insert_members(&tx, members)?;
        }
        {
          let mut stmt = tx.prepare(&sql)?;
          for params in rows {
            stmt.execute(params_from_iter(params))?;
          }
        }
        insert_dead_letters(&tx, &dead_letters, &recorded_at)?;
        tx.commit()?;
        Ok(())
      })
      .await?;

    tracing::debug!(table = %def.name, rows = batch.rows.len(), "fact batch written");
    Ok(())
  }

  async fn dead_letters(&self, table: &str) -> Result<Vec<DeadLetter>> {
    let table = table.to_owned();
    let raws: Vec<RawDeadLetter> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT run_id, table_name, row_index, row_id, error_json, row_json
           FROM _dead_letters
           WHERE table_name = ?1
           ORDER BY dead_letter_id",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![table], |row| {
            Ok(RawDeadLetter {
              run_id:     row.get(0)?,
              table_name: row.get(1)?,
              row_index:  row.get(2)?,
              row_id:     row.get(3)?,
              error_json: row.get(4)?,
              row_json:   row.get(5)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawDeadLetter::into_dead_letter).collect()
  }
}

// ─── WatermarkStore impl ─────────────────────────────────────────────────────

impl WatermarkStore for SqliteStore {
  type Error = Error;

  async fn load_watermarks(&self) -> Result<Vec<Watermark>> {
    let raws: Vec<RawWatermark> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(
          "SELECT table_name, last_loaded_value, last_run_status, updated_at
           FROM _watermarks
           ORDER BY table_name",
        )?;
        let rows = stmt
          .query_map([], |row| {
            Ok(RawWatermark {
              table_name:        row.get(0)?,
              last_loaded_value: row.get(1)?,
              last_run_status:   row.get(2)?,
              updated_at:        row.get(3)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawWatermark::into_watermark).collect()
  }

  async fn persist_watermark(&self, watermark: Watermark) -> Result<()> {
    let table_name = watermark.table_name;
    let value      = encode_dt(watermark.last_loaded_value);
    let status     = watermark.last_run_status.to_string();
    let updated_at = encode_dt(watermark.updated_at);

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO _watermarks (table_name, last_loaded_value, last_run_status, updated_at)
           VALUES (?1, ?2, ?3, ?4)
           ON CONFLICT (table_name) DO UPDATE SET
             last_loaded_value = excluded.last_loaded_value,
             last_run_status   = excluded.last_run_status,
             updated_at        = excluded.updated_at",
          rusqlite::params![table_name, value, status, updated_at],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}
