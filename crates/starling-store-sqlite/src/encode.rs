//! Encoding and decoding helpers between warehouse rows and SQLite cells.
//!
//! Timestamps are stored as RFC 3339 strings, dates as `YYYY-MM-DD`,
//! booleans as `0`/`1`. Dead-letter payloads are compact JSON. UUIDs are
//! stored as hyphenated lowercase strings.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::types::Value as Sql;
use starling_core::{
  catalog::{ColumnDef, DimensionDef, FactDef},
  error::RowError,
  row::{DeadLetter, DimensionRow, FactRow, Record, SourceRow, SurrogateKey},
  value::{DataType, KeyTuple, Value, parse_date, parse_timestamp},
  watermark::{RunStatus, Watermark},
};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Scalars ─────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

fn encode_opt_dt(dt: Option<DateTime<Utc>>) -> Sql {
  dt.map_or(Sql::Null, |dt| Sql::Text(encode_dt(dt)))
}

pub fn encode_value(value: &Value) -> Sql {
  match value {
    Value::Null => Sql::Null,
    Value::Boolean(b) => Sql::Integer(i64::from(*b)),
    Value::Integer(i) => Sql::Integer(*i),
    Value::Decimal(d) => Sql::Real(*d),
    Value::Text(s) => Sql::Text(s.clone()),
    Value::Date(d) => Sql::Text(d.format("%Y-%m-%d").to_string()),
    Value::Timestamp(t) => Sql::Text(encode_dt(*t)),
  }
}

/// Reads cells positionally, naming the column on failure.
struct Cells<'a> {
  table: &'a str,
  inner: std::vec::IntoIter<Sql>,
}

impl<'a> Cells<'a> {
  fn new(table: &'a str, raw: RawRow) -> Self { Self { table, inner: raw.0.into_iter() } }

  fn bad(&self, column: &str, reason: impl Into<String>) -> Error {
    Error::Decode {
      table:  self.table.to_owned(),
      column: column.to_owned(),
      reason: reason.into(),
    }
  }

  fn next(&mut self, column: &str) -> Result<Sql> {
    self.inner.next().ok_or_else(|| self.bad(column, "missing cell"))
  }

  fn value(&mut self, column: &ColumnDef) -> Result<Value> {
    let cell = self.next(&column.name)?;
    let mismatch = |cell: &Sql| {
      self.bad(
        &column.name,
        format!("{:?} cell is not a {}", cell.data_type(), column.data_type),
      )
    };
    Ok(match (column.data_type, cell) {
      (_, Sql::Null) => Value::Null,
      (DataType::Integer, Sql::Integer(i)) => Value::Integer(i),
      (DataType::Decimal, Sql::Real(d)) => Value::Decimal(d),
      (DataType::Decimal, Sql::Integer(i)) => Value::Decimal(i as f64),
      (DataType::Boolean, Sql::Integer(i)) => Value::Boolean(i != 0),
      (DataType::Text, Sql::Text(s)) => Value::Text(s),
      (DataType::Date, Sql::Text(s)) => {
        Value::Date(parse_date(&s).ok_or_else(|| self.bad(&column.name, format!("{s:?} is not a date")))?)
      }
      (DataType::Timestamp, Sql::Text(s)) => Value::Timestamp(
        parse_timestamp(&s).ok_or_else(|| self.bad(&column.name, format!("{s:?} is not a timestamp")))?,
      ),
      (_, other) => return Err(mismatch(&other)),
    })
  }

  fn measure(&mut self, column: &str) -> Result<Option<f64>> {
    match self.next(column)? {
      Sql::Null => Ok(None),
      Sql::Integer(i) => Ok(Some(i as f64)),
      Sql::Real(d) => Ok(Some(d)),
      other => Err(self.bad(column, format!("{:?} cell is not numeric", other.data_type()))),
    }
  }

  fn key(&mut self, column: &str) -> Result<Option<SurrogateKey>> {
    match self.next(column)? {
      Sql::Null => Ok(None),
      Sql::Integer(i) => Ok(Some(i)),
      other => Err(self.bad(column, format!("{:?} cell is not a key", other.data_type()))),
    }
  }

  fn flag(&mut self, column: &str) -> Result<bool> {
    Ok(self.key(column)?.is_some_and(|i| i != 0))
  }

  fn time(&mut self, column: &str) -> Result<Option<DateTime<Utc>>> {
    match self.next(column)? {
      Sql::Null => Ok(None),
      Sql::Text(s) => decode_dt(&s).map(Some),
      other => Err(self.bad(column, format!("{:?} cell is not a timestamp", other.data_type()))),
    }
  }

  fn required_time(&mut self, column: &str) -> Result<DateTime<Utc>> {
    self.time(column)?.ok_or_else(|| self.bad(column, "unexpected NULL"))
  }
}

fn tuple(record: &Record, columns: &[String]) -> KeyTuple {
  KeyTuple(
    columns
      .iter()
      .map(|c| record.get(c).cloned().unwrap_or(Value::Null))
      .collect(),
  )
}

// ─── Row types ───────────────────────────────────────────────────────────────

/// Cells of one warehouse-table row, in physical column order.
pub struct RawRow(pub Vec<Sql>);

/// Bind parameters for a dimension row, in [`crate::schema::dimension_columns`]
/// order.
pub fn dimension_params(def: &DimensionDef, row: &DimensionRow) -> Vec<Sql> {
  let mut params = vec![Sql::Integer(row.surrogate_key)];
  params.extend(
    def
      .columns
      .iter()
      .map(|c| row.values.get(&c.name).map_or(Sql::Null, encode_value)),
  );
  params.extend(
    def
      .references
      .iter()
      .map(|r| row.refs.get(&r.name).copied().flatten().map_or(Sql::Null, Sql::Integer)),
  );
  params.extend([
    encode_opt_dt(row.effective_from),
    encode_opt_dt(row.effective_to),
    Sql::Integer(i64::from(row.is_current)),
    Sql::Integer(i64::from(row.inferred)),
    Sql::Text(encode_dt(row.event_time)),
    Sql::Text(encode_dt(row.load_time)),
  ]);
  params
}

pub fn decode_dimension_row(def: &DimensionDef, raw: RawRow) -> Result<DimensionRow> {
  let mut cells = Cells::new(&def.name, raw);
  let surrogate_key = cells
    .key(&def.surrogate_key)?
    .ok_or_else(|| cells.bad(&def.surrogate_key, "unexpected NULL"))?;

  let mut values = Record::new();
  for column in &def.columns {
    values.insert(column.name.clone(), cells.value(column)?);
  }
  let mut refs = BTreeMap::new();
  for r in &def.references {
    refs.insert(r.name.clone(), cells.key(&r.key_column())?);
  }

  Ok(DimensionRow {
    surrogate_key,
    natural_key: tuple(&values, &def.natural_key),
    values,
    refs,
    effective_from: cells.time("EffectiveFrom")?,
    effective_to: cells.time("EffectiveTo")?,
    is_current: cells.flag("IsCurrent")?,
    inferred: cells.flag("IsInferred")?,
    event_time: cells.required_time("EventTime")?,
    load_time: cells.required_time("LoadTime")?,
  })
}

/// Bind parameters for a fact row, in [`crate::schema::fact_columns`] order.
pub fn fact_params(def: &FactDef, row: &FactRow) -> Vec<Sql> {
  let mut params: Vec<Sql> = def
    .columns
    .iter()
    .map(|c| row.values.get(&c.name).map_or(Sql::Null, encode_value))
    .collect();
  params.extend(
    def
      .references
      .iter()
      .map(|r| row.dimension_refs.get(&r.name).copied().flatten().map_or(Sql::Null, Sql::Integer)),
  );
  params.extend(
    def
      .measures
      .iter()
      .map(|m| row.measures.get(&m.name).copied().flatten().map_or(Sql::Null, Sql::Real)),
  );
  params.push(Sql::Text(encode_dt(row.event_time)));
  params.push(Sql::Text(encode_dt(row.load_time)));
  params
}

pub fn decode_fact_row(def: &FactDef, raw: RawRow) -> Result<FactRow> {
  let mut cells = Cells::new(&def.name, raw);

  let mut values = Record::new();
  for column in &def.columns {
    values.insert(column.name.clone(), cells.value(column)?);
  }
  let mut dimension_refs = BTreeMap::new();
  for r in &def.references {
    dimension_refs.insert(r.name.clone(), cells.key(&r.key_column())?);
  }
  let mut measures = BTreeMap::new();
  for m in &def.measures {
    measures.insert(m.name.clone(), cells.measure(&m.name)?);
  }

  Ok(FactRow {
    grain: tuple(&values, &def.grain),
    values,
    measures,
    dimension_refs,
    event_time: cells.required_time("EventTime")?,
    load_time: cells.required_time("LoadTime")?,
  })
}

/// Raw strings read directly from a `_watermarks` row.
pub struct RawWatermark {
  pub table_name:        String,
  pub last_loaded_value: String,
  pub last_run_status:   String,
  pub updated_at:        String,
}

impl RawWatermark {
  pub fn into_watermark(self) -> Result<Watermark> {
    let last_run_status = self
      .last_run_status
      .parse::<RunStatus>()
      .map_err(|e| Error::Decode {
        table:  "_watermarks".into(),
        column: "last_run_status".into(),
        reason: format!("{:?}: {e}", self.last_run_status),
      })?;
    Ok(Watermark {
      last_loaded_value: decode_dt(&self.last_loaded_value)?,
      updated_at: decode_dt(&self.updated_at)?,
      table_name: self.table_name,
      last_run_status,
    })
  }
}

/// Raw cells read directly from a `_dead_letters` row.
pub struct RawDeadLetter {
  pub run_id:     String,
  pub table_name: String,
  pub row_index:  i64,
  pub row_id:     Option<String>,
  pub error_json: String,
  pub row_json:   String,
}

impl RawDeadLetter {
  pub fn into_dead_letter(self) -> Result<DeadLetter> {
    let error: RowError = serde_json::from_str(&self.error_json)?;
    let row: SourceRow = serde_json::from_str(&self.row_json)?;
    Ok(DeadLetter {
      run_id: decode_uuid(&self.run_id)?,
      table: self.table_name,
      row_index: usize::try_from(self.row_index).unwrap_or_default(),
      row_id: self.row_id,
      error,
      row,
    })
  }
}

/// Everything needed to insert one dead letter, pre-encoded.
pub struct EncodedDeadLetter {
  pub run_id:     String,
  pub table_name: String,
  pub row_index:  i64,
  pub row_id:     Option<String>,
  pub error_json: String,
  pub row_json:   String,
}

pub fn encode_dead_letter(dl: &DeadLetter) -> Result<EncodedDeadLetter> {
  Ok(EncodedDeadLetter {
    run_id:     encode_uuid(dl.run_id),
    table_name: dl.table.clone(),
    row_index:  i64::try_from(dl.row_index).unwrap_or(i64::MAX),
    row_id:     dl.row_id.clone(),
    error_json: serde_json::to_string(&dl.error)?,
    row_json:   serde_json::to_string(&dl.row)?,
  })
}
