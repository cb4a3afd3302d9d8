//! [`DimensionLoader`] — upsert with slowly-changing-dimension semantics.
//!
//! A batch is computed entirely in memory against the stored versions of the
//! dimension, then committed as one [`DimensionBatch`]. Rows are applied in
//! natural-key order and, within one key, in event-time order, so TYPE2
//! history closes deterministically. The watermark only moves after the
//! commit succeeds.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
  catalog::{DimensionDef, ScdType, SchemaCatalog},
  error::{Error, Result, RowError, SchemaError},
  resolve::{DimensionIndex, Resolution, coerce_record, key_of, resolve_references},
  row::{DeadLetter, DimensionRow, LoadResult, Record, SourceRow, SurrogateKey},
  store::{DimensionBatch, WarehouseStore},
  value::{NaturalKey, Value},
  watermark::{WatermarkStore, WatermarkTracker},
};

/// A source row that passed coercion and reference resolution.
struct Prepared {
  index:  usize,
  row:    SourceRow,
  record: Record,
  key:    NaturalKey,
  refs:   BTreeMap<String, Option<SurrogateKey>>,
}

pub struct DimensionLoader<'a, S, W> {
  catalog:    &'a SchemaCatalog,
  store:      &'a S,
  watermarks: &'a WatermarkTracker<W>,
}

impl<'a, S, W> DimensionLoader<'a, S, W>
where
  S: WarehouseStore,
  W: WatermarkStore,
{
  pub fn new(
    catalog: &'a SchemaCatalog,
    store: &'a S,
    watermarks: &'a WatermarkTracker<W>,
  ) -> Self {
    Self { catalog, store, watermarks }
  }

  /// Load one batch into `dimension_name` under a fresh run id.
  pub async fn load(
    &self,
    dimension_name: &str,
    incoming_rows: Vec<SourceRow>,
  ) -> Result<LoadResult> {
    self.load_in_run(dimension_name, incoming_rows, Uuid::new_v4()).await
  }

  pub async fn load_in_run(
    &self,
    dimension_name: &str,
    incoming_rows: Vec<SourceRow>,
    run_id: Uuid,
  ) -> Result<LoadResult> {
    let def = self
      .catalog
      .dimension(dimension_name)
      .ok_or_else(|| SchemaError::UnknownTable(dimension_name.to_owned()))?;

    tracing::debug!(table = %def.name, %run_id, rows = incoming_rows.len(), "dimension batch started");

    let max_event_time = incoming_rows.iter().map(|r| r.event_time).max();
    let mut result = LoadResult::new(&def.name, run_id);
    let mut dead_letters = Vec::new();

    let existing = self
      .store
      .dimension_rows(def)
      .await
      .map_err(|e| Error::read(&def.name, e))?;
    let high_water = self
      .store
      .surrogate_high_water(&def.name)
      .await
      .map_err(|e| Error::read(&def.name, e))?;
    let indexes = load_indexes(self.catalog, self.store, &def.references).await?;

    // Coerce and resolve, then group by natural key.
    let mut groups: BTreeMap<NaturalKey, Vec<Prepared>> = BTreeMap::new();
    for (index, row) in incoming_rows.into_iter().enumerate() {
      match prepare(def, &indexes, &row) {
        Ok((record, key, refs)) => groups
          .entry(key.clone())
          .or_default()
          .push(Prepared { index, row, record, key, refs }),
        Err((row_id, error)) => {
          dead_letters.push(dead_letter(run_id, &def.name, index, row_id, error, row));
        }
      }
    }

    let mut apply = Apply::new(def, existing, high_water);
    for (_, mut group) in groups {
      group.sort_by_key(|p| (p.row.event_time, p.index));
      let mut previous: Option<(DateTime<Utc>, Record)> = None;
      for p in group {
        if let Some((at, record)) = &previous
          && *at == p.row.event_time
        {
          if *record == p.record {
            result.unchanged += 1;
          } else {
            let error = RowError::ConflictingNaturalKey { key: p.key.to_string() };
            dead_letters.push(dead_letter(
              run_id,
              &def.name,
              p.index,
              Some(p.key.to_string()),
              error,
              p.row,
            ));
          }
          continue;
        }
        previous = Some((p.row.event_time, p.record.clone()));

        match apply.row(&p) {
          Ok(Outcome::Inserted) => result.inserted += 1,
          Ok(Outcome::Updated) => result.updated += 1,
          Ok(Outcome::Unchanged) => result.unchanged += 1,
          Err(error) => dead_letters.push(dead_letter(
            run_id,
            &def.name,
            p.index,
            Some(p.key.to_string()),
            error,
            p.row,
          )),
        }
      }
    }

    for dl in &dead_letters {
      tracing::warn!(table = %def.name, %run_id, row = dl.row_index, error = %dl.error, "row dead-lettered");
    }
    dead_letters.sort_by_key(|dl| dl.row_index);
    result.dead_letters = dead_letters.clone();

    let batch = DimensionBatch {
      run_id,
      rows: apply.changed.into_values().collect(),
      high_water: apply.high_water,
      dead_letters,
    };
    if !batch.rows.is_empty() || !batch.dead_letters.is_empty() {
      if let Err(e) = self.store.commit_dimension(def, batch).await {
        tracing::error!(table = %def.name, %run_id, error = %e, "dimension commit failed");
        if let Err(we) = self.watermarks.mark_failed(&def.name).await {
          tracing::error!(table = %def.name, error = %we, "could not record failed run");
        }
        return Err(Error::commit(&def.name, e));
      }
    }

    result.watermark = match max_event_time {
      Some(at) => Some(self.watermarks.advance(&def.name, at).await?),
      None => self.watermarks.get(&def.name).await,
    };

    tracing::info!(
      table = %def.name,
      %run_id,
      inserted = result.inserted,
      updated = result.updated,
      unchanged = result.unchanged,
      dead_lettered = result.dead_letters.len(),
      "dimension batch committed"
    );
    Ok(result)
  }
}

/// Build natural-key indexes for the targets of `references`.
pub(crate) async fn load_indexes<S: WarehouseStore>(
  catalog: &SchemaCatalog,
  store: &S,
  references: &[crate::catalog::Reference],
) -> Result<HashMap<String, DimensionIndex>> {
  let mut indexes = HashMap::new();
  for r in references {
    if indexes.contains_key(&r.target) {
      continue;
    }
    let target = catalog
      .dimension(&r.target)
      .ok_or_else(|| SchemaError::UnknownTable(r.target.clone()))?;
    let rows = store
      .dimension_rows(target)
      .await
      .map_err(|e| Error::read(&target.name, e))?;
    indexes.insert(r.target.clone(), DimensionIndex::build(target, rows));
  }
  Ok(indexes)
}

pub(crate) fn dead_letter(
  run_id: Uuid,
  table: &str,
  row_index: usize,
  row_id: Option<String>,
  error: RowError,
  row: SourceRow,
) -> DeadLetter {
  DeadLetter { run_id, table: table.to_owned(), row_index, row_id, error, row }
}

type PreparedParts = (Record, NaturalKey, BTreeMap<String, Option<SurrogateKey>>);

fn prepare(
  def: &DimensionDef,
  indexes: &HashMap<String, DimensionIndex>,
  row: &SourceRow,
) -> std::result::Result<PreparedParts, (Option<String>, RowError)> {
  let record = coerce_record(&def.columns, row).map_err(|e| (None, e))?;
  let key = key_of(&record, &def.natural_key);
  let row_id = Some(key.to_string());

  let resolutions = resolve_references(&def.references, &record, row.event_time, indexes)
    .map_err(|e| (row_id.clone(), e))?;
  let mut refs = BTreeMap::new();
  for (name, resolution) in resolutions {
    match resolution {
      Resolution::Resolved(sk) => {
        refs.insert(name, sk);
      }
      Resolution::Missing(missing) => {
        let target = def
          .references
          .iter()
          .find(|r| r.name == name)
          .map(|r| r.target.clone())
          .unwrap_or_default();
        return Err((row_id, RowError::UnresolvedReference {
          reference: name,
          target,
          key: missing.to_string(),
        }));
      }
    }
  }
  Ok((record, key, refs))
}

enum Outcome {
  Inserted,
  Updated,
  Unchanged,
}

/// Working state of one batch: current versions by natural key, the
/// surrogate sequence, and every row the batch touched.
struct Apply<'d> {
  def:        &'d DimensionDef,
  current:    HashMap<NaturalKey, DimensionRow>,
  history:    HashMap<NaturalKey, Vec<Record>>,
  high_water: SurrogateKey,
  changed:    BTreeMap<SurrogateKey, DimensionRow>,
  now:        DateTime<Utc>,
}

impl<'d> Apply<'d> {
  fn new(def: &'d DimensionDef, existing: Vec<DimensionRow>, high_water: SurrogateKey) -> Self {
    let mut current = HashMap::new();
    let mut history: HashMap<NaturalKey, Vec<Record>> = HashMap::new();
    let mut seen_high = high_water;
    for row in existing {
      seen_high = seen_high.max(row.surrogate_key);
      if row.is_current {
        current.insert(row.natural_key.clone(), row);
      } else {
        history.entry(row.natural_key.clone()).or_default().push(row.values);
      }
    }
    Self {
      def,
      current,
      history,
      high_water: seen_high,
      changed: BTreeMap::new(),
      now: Utc::now(),
    }
  }

  fn mint(&mut self) -> SurrogateKey {
    self.high_water += 1;
    self.high_water
  }

  fn row(&mut self, p: &Prepared) -> std::result::Result<Outcome, RowError> {
    let versioned = self.def.scd_type == ScdType::Type2;
    let Some(cur) = self.current.get(&p.key).cloned() else {
      let surrogate_key = self.mint();
      let row = DimensionRow {
        surrogate_key,
        natural_key: p.key.clone(),
        values: p.record.clone(),
        refs: p.refs.clone(),
        effective_from: versioned.then_some(p.row.event_time),
        effective_to: None,
        is_current: true,
        inferred: false,
        event_time: p.row.event_time,
        load_time: self.now,
      };
      self.commit(row);
      return Ok(Outcome::Inserted);
    };

    // A late-arriving placeholder is completed in place whatever the SCD type.
    if cur.inferred {
      let mut row = cur;
      row.values = p.record.clone();
      row.refs = p.refs.clone();
      row.inferred = false;
      row.effective_from = row.effective_from.map(|from| from.min(p.row.event_time));
      row.event_time = p.row.event_time;
      row.load_time = self.now;
      self.commit(row);
      return Ok(Outcome::Updated);
    }

    let changed: Vec<&String> = self
      .def
      .columns
      .iter()
      .map(|c| &c.name)
      .filter(|c| cur.values.get(*c) != p.record.get(*c))
      .collect();
    if changed.is_empty() {
      return Ok(Outcome::Unchanged);
    }

    if self.def.scd_type == ScdType::None {
      return Err(RowError::ImmutableDimensionViolation {
        key:    p.key.to_string(),
        column: changed[0].clone(),
      });
    }

    if p.row.event_time < cur.event_time {
      let historical = self
        .history
        .get(&p.key)
        .is_some_and(|h| h.iter().any(|values| *values == p.record));
      if historical {
        return Ok(Outcome::Unchanged);
      }
      return Err(RowError::RangeViolation {
        column: "EventTime".into(),
        reason: format!(
          "event time {} precedes the current version ({})",
          p.row.event_time.to_rfc3339(),
          cur.event_time.to_rfc3339()
        ),
      });
    }

    let tracked_change = versioned && changed.iter().any(|c| self.def.is_tracked(c));
    if !tracked_change {
      let mut row = cur;
      row.values = p.record.clone();
      row.refs = p.refs.clone();
      row.event_time = p.row.event_time;
      row.load_time = self.now;
      self.commit(row);
      return Ok(Outcome::Updated);
    }

    if cur.effective_from.is_some_and(|from| p.row.event_time <= from) {
      return Err(RowError::RangeViolation {
        column: "EffectiveFrom".into(),
        reason: format!(
          "new version at {} does not start after the current one",
          p.row.event_time.to_rfc3339()
        ),
      });
    }

    let mut closed = cur;
    closed.effective_to = Some(p.row.event_time);
    closed.is_current = false;
    closed.load_time = self.now;
    self
      .history
      .entry(p.key.clone())
      .or_default()
      .push(closed.values.clone());
    self.changed.insert(closed.surrogate_key, closed);

    let surrogate_key = self.mint();
    self.commit(DimensionRow {
      surrogate_key,
      natural_key: p.key.clone(),
      values: p.record.clone(),
      refs: p.refs.clone(),
      effective_from: Some(p.row.event_time),
      effective_to: None,
      is_current: true,
      inferred: false,
      event_time: p.row.event_time,
      load_time: self.now,
    });
    Ok(Outcome::Updated)
  }

  /// Record `row` as the current version of its key.
  fn commit(&mut self, row: DimensionRow) {
    self.current.insert(row.natural_key.clone(), row.clone());
    self.changed.insert(row.surrogate_key, row);
  }
}

/// A placeholder row for a natural key referenced before it was loaded.
pub(crate) fn inferred_member(
  def: &DimensionDef,
  key: &NaturalKey,
  surrogate_key: SurrogateKey,
  at: DateTime<Utc>,
  now: DateTime<Utc>,
) -> DimensionRow {
  let mut values: Record = def
    .columns
    .iter()
    .map(|c| (c.name.clone(), Value::Null))
    .collect();
  for (column, value) in def.natural_key.iter().zip(&key.0) {
    values.insert(column.clone(), value.clone());
  }
  DimensionRow {
    surrogate_key,
    natural_key: key.clone(),
    values,
    refs: def.references.iter().map(|r| (r.name.clone(), None)).collect(),
    effective_from: (def.scd_type == ScdType::Type2).then_some(at),
    effective_to: None,
    is_current: true,
    inferred: true,
    event_time: at,
    load_time: now,
  }
}
