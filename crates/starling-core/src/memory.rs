//! In-memory [`WarehouseStore`] and [`WatermarkStore`].
//!
//! Used by tests and by dry runs. Cloning is cheap; clones share state.

use std::{
  collections::{BTreeMap, HashMap},
  convert::Infallible,
  sync::Arc,
};

use tokio::sync::Mutex;

use crate::{
  catalog::{DimensionDef, FactDef, SchemaCatalog},
  row::{DeadLetter, DimensionRow, FactRow, SurrogateKey},
  store::{DimensionBatch, FactBatch, WarehouseStore},
  value::GrainKey,
  watermark::{Watermark, WatermarkStore},
};

#[derive(Debug, Default)]
struct Table {
  dimension_rows: BTreeMap<SurrogateKey, DimensionRow>,
  high_water:     SurrogateKey,
  fact_rows:      BTreeMap<GrainKey, FactRow>,
  dead_letters:   Vec<DeadLetter>,
}

#[derive(Debug, Default)]
struct State {
  tables:     HashMap<String, Table>,
  watermarks: BTreeMap<String, Watermark>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
  state: Arc<Mutex<State>>,
}

impl MemoryStore {
  pub fn new() -> Self { Self::default() }
}

impl WarehouseStore for MemoryStore {
  type Error = Infallible;

  async fn prepare(&self, catalog: &SchemaCatalog) -> Result<(), Infallible> {
    let mut state = self.state.lock().await;
    for t in catalog.tables() {
      state.tables.entry(t.name().to_owned()).or_default();
    }
    Ok(())
  }

  async fn dimension_rows(&self, def: &DimensionDef) -> Result<Vec<DimensionRow>, Infallible> {
    let state = self.state.lock().await;
    Ok(
      state
        .tables
        .get(&def.name)
        .map(|t| t.dimension_rows.values().cloned().collect())
        .unwrap_or_default(),
    )
  }

  async fn surrogate_high_water(&self, dimension: &str) -> Result<SurrogateKey, Infallible> {
    let state = self.state.lock().await;
    Ok(state.tables.get(dimension).map_or(0, |t| t.high_water))
  }

  async fn commit_dimension(
    &self,
    def: &DimensionDef,
    batch: DimensionBatch,
  ) -> Result<(), Infallible> {
    let mut state = self.state.lock().await;
    let table = state.tables.entry(def.name.clone()).or_default();
    for row in batch.rows {
      table.dimension_rows.insert(row.surrogate_key, row);
    }
    table.high_water = table.high_water.max(batch.high_water);
    table.dead_letters.extend(batch.dead_letters);
    Ok(())
  }

  async fn fact_rows(&self, def: &FactDef) -> Result<Vec<FactRow>, Infallible> {
    let state = self.state.lock().await;
    Ok(
      state
        .tables
        .get(&def.name)
        .map(|t| t.fact_rows.values().cloned().collect())
        .unwrap_or_default(),
    )
  }

  async fn commit_fact(&self, def: &FactDef, batch: FactBatch) -> Result<(), Infallible> {
    let mut state = self.state.lock().await;
    for members in batch.inferred {
      let table = state.tables.entry(members.dimension.name).or_default();
      for row in members.rows {
        table.dimension_rows.insert(row.surrogate_key, row);
      }
      table.high_water = table.high_water.max(members.high_water);
    }
    let table = state.tables.entry(def.name.clone()).or_default();
    for row in batch.rows {
      table.fact_rows.insert(row.grain.clone(), row);
    }
    table.dead_letters.extend(batch.dead_letters);
    Ok(())
  }

  async fn dead_letters(&self, table: &str) -> Result<Vec<DeadLetter>, Infallible> {
    let state = self.state.lock().await;
    Ok(
      state
        .tables
        .get(table)
        .map(|t| t.dead_letters.clone())
        .unwrap_or_default(),
    )
  }
}

impl WatermarkStore for MemoryStore {
  type Error = Infallible;

  async fn load_watermarks(&self) -> Result<Vec<Watermark>, Infallible> {
    Ok(self.state.lock().await.watermarks.values().cloned().collect())
  }

  async fn persist_watermark(&self, watermark: Watermark) -> Result<(), Infallible> {
    self
      .state
      .lock()
      .await
      .watermarks
      .insert(watermark.table_name.clone(), watermark);
    Ok(())
  }
}
