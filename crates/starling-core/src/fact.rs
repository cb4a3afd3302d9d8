//! [`FactLoader`] — append (or, for snapshot facts, overwrite) fact rows.
//!
//! Every reference is resolved against the dimension version in effect at
//! the row's `event_time`. Rows that cannot be resolved, or that repeat an
//! event grain, are dead-lettered; the rest of the batch still commits.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
  catalog::{FactDef, FactKind, LateArrivalPolicy, SchemaCatalog},
  dimension::{dead_letter, inferred_member, load_indexes},
  error::{Error, Result, RowError, SchemaError},
  resolve::{DimensionIndex, Resolution, coerce_record, key_of, resolve_references},
  row::{DimensionRow, FactRow, LoadResult, Record, SourceRow, SurrogateKey},
  store::{FactBatch, InferredMembers, WarehouseStore},
  value::{GrainKey, NaturalKey, coerce},
  watermark::{WatermarkStore, WatermarkTracker},
};

pub struct FactLoader<'a, S, W> {
  catalog:    &'a SchemaCatalog,
  store:      &'a S,
  watermarks: &'a WatermarkTracker<W>,
}

/// Placeholder rows minted for one dimension during a fact batch.
struct Inferred {
  high_water: SurrogateKey,
  rows:       Vec<DimensionRow>,
}

/// A row's typed columns, before its references are resolved.
struct Shaped {
  values:   Record,
  grain:    GrainKey,
  measures: BTreeMap<String, Option<f64>>,
}

/// Placeholders one row needs, by target dimension. Only kept if the row is.
type Minted = Vec<(String, DimensionRow)>;

type Rejection = (Option<String>, RowError);

impl<'a, S, W> FactLoader<'a, S, W>
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

  /// Load one batch into `fact_name` under a fresh run id.
  pub async fn load(&self, fact_name: &str, incoming_rows: Vec<SourceRow>) -> Result<LoadResult> {
    self.load_in_run(fact_name, incoming_rows, Uuid::new_v4()).await
  }

  pub async fn load_in_run(
    &self,
    fact_name: &str,
    incoming_rows: Vec<SourceRow>,
    run_id: Uuid,
  ) -> Result<LoadResult> {
    let def = self
      .catalog
      .fact(fact_name)
      .ok_or_else(|| SchemaError::UnknownTable(fact_name.to_owned()))?;

    tracing::debug!(table = %def.name, %run_id, rows = incoming_rows.len(), "fact batch started");

    let max_event_time = incoming_rows.iter().map(|r| r.event_time).max();
    let mut result = LoadResult::new(&def.name, run_id);
    let mut dead_letters = Vec::new();

    let mut indexes = load_indexes(self.catalog, self.store, &def.references).await?;
    let existing: HashMap<GrainKey, FactRow> = self
      .store
      .fact_rows(def)
      .await
      .map_err(|e| Error::read(&def.name, e))?
      .into_iter()
      .map(|row| (row.grain.clone(), row))
      .collect();

    let mut inferred: BTreeMap<String, Inferred> = BTreeMap::new();
    let mut pending: BTreeMap<GrainKey, FactRow> = BTreeMap::new();
    let now = Utc::now();

    // Stable by event time: for a repeated snapshot grain the latest wins.
    let mut ordered: Vec<(usize, SourceRow)> = incoming_rows.into_iter().enumerate().collect();
    ordered.sort_by_key(|(_, row)| row.event_time);

    for (index, row) in ordered {
      let shaped = match shape(def, &row) {
        Ok(shaped) => shaped,
        Err((row_id, error)) => {
          dead_letters.push(dead_letter(run_id, &def.name, index, row_id, error, row));
          continue;
        }
      };

      // Duplicates are rejected before anything is inferred on their behalf.
      let stored = existing.get(&shaped.grain);
      if def.kind == FactKind::Event
        && (stored.is_some() || pending.contains_key(&shaped.grain))
      {
        let id = shaped.grain.to_string();
        let error = RowError::DuplicateFactRow { grain: id.clone() };
        dead_letters.push(dead_letter(run_id, &def.name, index, Some(id), error, row));
        continue;
      }

      let (fact, minted) = match self
        .resolve(def, &row, shaped, &indexes, &mut inferred, now)
        .await
      {
        Ok(resolved) => resolved,
        Err((row_id, error)) => {
          dead_letters.push(dead_letter(run_id, &def.name, index, row_id, error, row));
          continue;
        }
      };
      accept(minted, &mut indexes, &mut inferred);

      match def.kind {
        FactKind::Event => result.inserted += 1,
        FactKind::Snapshot => {
          if pending.contains_key(&fact.grain) {
            result.updated += 1;
          } else {
            match stored {
              Some(s) if same_content(s, &fact) => {
                result.unchanged += 1;
                continue;
              }
              Some(_) => result.updated += 1,
              None => result.inserted += 1,
            }
          }
        }
      }
      pending.insert(fact.grain.clone(), fact);
    }

    for dl in &dead_letters {
      tracing::warn!(table = %def.name, %run_id, row = dl.row_index, error = %dl.error, "row dead-lettered");
    }
    dead_letters.sort_by_key(|dl| dl.row_index);
    result.dead_letters = dead_letters.clone();

    let outcome = self
      .commit(def, run_id, inferred, pending.into_values().collect(), dead_letters)
      .await;
    if let Err(e) = outcome {
      tracing::error!(table = %def.name, %run_id, error = %e, "fact commit failed");
      if let Err(we) = self.watermarks.mark_failed(&def.name).await {
        tracing::error!(table = %def.name, error = %we, "could not record failed run");
      }
      return Err(e);
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
      "fact batch committed"
    );
    Ok(result)
  }

  /// Resolve every reference of one shaped row. Placeholders the row needs
  /// are returned, not recorded.
  async fn resolve(
    &self,
    def: &FactDef,
    row: &SourceRow,
    shaped: Shaped,
    indexes: &HashMap<String, DimensionIndex>,
    inferred: &mut BTreeMap<String, Inferred>,
    now: DateTime<Utc>,
  ) -> std::result::Result<(FactRow, Minted), Rejection> {
    let row_id = Some(shaped.grain.to_string());
    let resolutions = resolve_references(&def.references, &shaped.values, row.event_time, indexes)
      .map_err(|e| (row_id.clone(), e))?;

    let mut minted: Minted = Vec::new();
    let mut dimension_refs = BTreeMap::new();
    for (name, resolution) in resolutions {
      let sk = match resolution {
        Resolution::Resolved(sk) => sk,
        Resolution::Missing(key) => {
          let target = def
            .references
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.target.clone())
            .unwrap_or_default();
          if def.late_arrival != LateArrivalPolicy::InferMember {
            return Err((row_id, RowError::UnresolvedReference {
              reference: name,
              target,
              key: key.to_string(),
            }));
          }
          let sk = self
            .mint(&target, &key, row.event_time, now, inferred, &mut minted)
            .await
            .map_err(|e| {
              (row_id.clone(), RowError::UnresolvedReference {
                reference: name.clone(),
                target:    target.clone(),
                key:       format!("{key} ({e})"),
              })
            })?;
          Some(sk)
        }
      };
      dimension_refs.insert(name, sk);
    }

    let fact = FactRow {
      grain: shaped.grain,
      values: shaped.values,
      measures: shaped.measures,
      dimension_refs,
      event_time: row.event_time,
      load_time: now,
    };
    Ok((fact, minted))
  }

  /// A surrogate key for a placeholder of `key` in `target`, reusing one
  /// this row already minted.
  async fn mint(
    &self,
    target: &str,
    key: &NaturalKey,
    at: DateTime<Utc>,
    now: DateTime<Utc>,
    inferred: &mut BTreeMap<String, Inferred>,
    minted: &mut Minted,
  ) -> Result<SurrogateKey> {
    if let Some((_, row)) = minted
      .iter()
      .find(|(t, row)| t == target && row.natural_key == *key)
    {
      return Ok(row.surrogate_key);
    }

    let dim = self
      .catalog
      .dimension(target)
      .ok_or_else(|| SchemaError::UnknownTable(target.to_owned()))?;
    if !inferred.contains_key(target) {
      let high_water = self
        .store
        .surrogate_high_water(target)
        .await
        .map_err(|e| Error::read(target, e))?;
      inferred.insert(target.to_owned(), Inferred { high_water, rows: Vec::new() });
    }
    let high_water = inferred.get(target).map_or(0, |slot| slot.high_water);
    let already = minted.iter().filter(|(t, _)| t == target).count();
    let surrogate_key = high_water + 1 + SurrogateKey::try_from(already).unwrap_or_default();

    minted.push((target.to_owned(), inferred_member(dim, key, surrogate_key, at, now)));
    Ok(surrogate_key)
  }

  async fn commit(
    &self,
    def: &FactDef,
    run_id: Uuid,
    inferred: BTreeMap<String, Inferred>,
    rows: Vec<FactRow>,
    dead_letters: Vec<crate::row::DeadLetter>,
  ) -> Result<()> {
    let mut members = Vec::new();
    for (target, slot) in inferred {
      if slot.rows.is_empty() {
        continue;
      }
      let dimension = self
        .catalog
        .dimension(&target)
        .ok_or_else(|| SchemaError::UnknownTable(target.clone()))?;
      members.push(InferredMembers {
        dimension:  dimension.clone(),
        rows:       slot.rows,
        high_water: slot.high_water,
      });
    }

    if members.is_empty() && rows.is_empty() && dead_letters.is_empty() {
      return Ok(());
    }
    self
      .store
      .commit_fact(def, FactBatch { run_id, inferred: members, rows, dead_letters })
      .await
      .map_err(|e| Error::commit(&def.name, e))
  }
}

/// Coerce one row's columns and measures and key it by grain.
fn shape(def: &FactDef, row: &SourceRow) -> std::result::Result<Shaped, Rejection> {
  let values = coerce_record(&def.columns, row).map_err(|e| (None, e))?;
  let grain = key_of(&values, &def.grain);

  let mut measures = BTreeMap::new();
  for m in &def.measures {
    let raw = row.values.get(&m.name).unwrap_or(&serde_json::Value::Null);
    let value = coerce(&m.name, m.data_type, raw).map_err(|e| (Some(grain.to_string()), e))?;
    measures.insert(m.name.clone(), value.as_f64());
  }
  Ok(Shaped { values, grain, measures })
}

/// Record the placeholders of an accepted row and make them resolvable for
/// the rest of the batch.
fn accept(
  minted: Minted,
  indexes: &mut HashMap<String, DimensionIndex>,
  inferred: &mut BTreeMap<String, Inferred>,
) {
  for (target, row) in minted {
    tracing::info!(
      dimension = %target,
      key = %row.natural_key,
      surrogate_key = row.surrogate_key,
      "inferred late-arriving member"
    );
    if let Some(index) = indexes.get_mut(&target) {
      index.insert(row.clone());
    }
    if let Some(slot) = inferred.get_mut(&target) {
      slot.high_water = slot.high_water.max(row.surrogate_key);
      slot.rows.push(row);
    }
  }
}

fn same_content(a: &FactRow, b: &FactRow) -> bool {
  a.values == b.values && a.measures == b.measures && a.dimension_refs == b.dimension_refs
}
