//! Data rows: what the extract feed supplies and what the loaders persist.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  error::RowError,
  value::{GrainKey, NaturalKey, Value},
  watermark::Watermark,
};

/// Column name → typed value.
pub type Record = BTreeMap<String, Value>;

/// Surrogate keys are positive and minted per dimension.
pub type SurrogateKey = i64;

// ─── Source ──────────────────────────────────────────────────────────────────

/// One row from the source extract feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRow {
  /// When the change happened in the source system.
  pub event_time: DateTime<Utc>,
  pub values:     serde_json::Map<String, serde_json::Value>,
}

impl SourceRow {
  /// Build from a JSON object; non-object input yields an empty row.
  pub fn new(event_time: DateTime<Utc>, values: serde_json::Value) -> Self {
    let values = match values {
      serde_json::Value::Object(map) => map,
      _ => serde_json::Map::new(),
    };
    Self { event_time, values }
  }
}

// ─── Dimension ───────────────────────────────────────────────────────────────

/// One version of a dimension entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionRow {
  pub surrogate_key:  SurrogateKey,
  pub natural_key:    NaturalKey,
  /// Every declared column, natural key included.
  pub values:         Record,
  /// Reference name → resolved surrogate key in the target dimension.
  pub refs:           BTreeMap<String, Option<SurrogateKey>>,
  /// TYPE2 only.
  pub effective_from: Option<DateTime<Utc>>,
  /// TYPE2 only; `None` while the version is open.
  pub effective_to:   Option<DateTime<Utc>>,
  pub is_current:     bool,
  /// Placeholder minted for a late-arriving reference.
  pub inferred:       bool,
  pub event_time:     DateTime<Utc>,
  pub load_time:      DateTime<Utc>,
}

impl DimensionRow {
  /// Whether this version was in effect at `at`. Versions without an
  /// effective range are in effect while current.
  pub fn effective_at(&self, at: DateTime<Utc>) -> bool {
    match self.effective_from {
      None => self.is_current,
      Some(from) => from <= at && self.effective_to.is_none_or(|to| at < to),
    }
  }
}

// ─── Fact ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactRow {
  pub grain:          GrainKey,
  /// Non-measure columns, grain included.
  pub values:         Record,
  pub measures:       BTreeMap<String, Option<f64>>,
  /// Reference name → resolved surrogate key.
  pub dimension_refs: BTreeMap<String, Option<SurrogateKey>>,
  pub event_time:     DateTime<Utc>,
  pub load_time:      DateTime<Utc>,
}

impl FactRow {
  /// The row's business identifier, rendered from its grain.
  pub fn id(&self) -> String { self.grain.to_string() }
}

// ─── Results ─────────────────────────────────────────────────────────────────

/// A row set aside during a batch instead of aborting it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
  pub run_id:    Uuid,
  pub table:     String,
  /// Position of the row in the incoming batch.
  pub row_index: usize,
  /// Natural key or grain, when it could be read.
  pub row_id:    Option<String>,
  pub error:     RowError,
  pub row:       SourceRow,
}

/// Outcome of one table's batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadResult {
  pub table:        String,
  pub run_id:       Uuid,
  pub inserted:     usize,
  pub updated:      usize,
  pub unchanged:    usize,
  pub dead_letters: Vec<DeadLetter>,
  /// Watermark after the batch committed, if the table has one.
  pub watermark:    Option<Watermark>,
}

impl LoadResult {
  pub(crate) fn new(table: &str, run_id: Uuid) -> Self {
    Self {
      table: table.to_owned(),
      run_id,
      inserted: 0,
      updated: 0,
      unchanged: 0,
      dead_letters: Vec::new(),
      watermark: None,
    }
  }

  /// Rows that reached the store (new or changed).
  pub fn applied(&self) -> usize { self.inserted + self.updated }
}
