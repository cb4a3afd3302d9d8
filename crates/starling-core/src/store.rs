//! The `WarehouseStore` trait and the batch types the loaders commit.
//!
//! The trait is implemented by storage backends (e.g.
//! `starling-store-sqlite`, or [`crate::memory::MemoryStore`] for tests).
//! Loaders compute a whole batch in memory and hand it over in a single
//! commit; a backend must apply a batch atomically or not at all.

use std::future::Future;

use uuid::Uuid;

use crate::{
  catalog::{DimensionDef, FactDef, SchemaCatalog},
  row::{DeadLetter, DimensionRow, FactRow, SurrogateKey},
};

/// Changes to one dimension produced by one batch.
#[derive(Debug, Clone, Default)]
pub struct DimensionBatch {
  pub run_id:       Uuid,
  /// Rows to upsert by surrogate key, in order. A closed TYPE2 version
  /// always precedes the version that replaces it.
  pub rows:         Vec<DimensionRow>,
  /// Greatest surrogate key ever minted for the dimension after this batch.
  pub high_water:   SurrogateKey,
  pub dead_letters: Vec<DeadLetter>,
}

/// Placeholder members minted in one dimension by a fact batch.
#[derive(Debug, Clone)]
pub struct InferredMembers {
  pub dimension:  DimensionDef,
  /// New rows, in surrogate-key order.
  pub rows:       Vec<DimensionRow>,
  /// Greatest surrogate key minted for `dimension` after this batch.
  pub high_water: SurrogateKey,
}

/// Rows produced by one fact batch.
///
/// Inferred members are written in the same unit as the fact rows: if the
/// commit fails, neither is visible.
#[derive(Debug, Clone, Default)]
pub struct FactBatch {
  pub run_id:       Uuid,
  pub inferred:     Vec<InferredMembers>,
  /// Rows to write by grain. Snapshot facts overwrite an existing grain;
  /// event-fact batches never contain an existing grain.
  pub rows:         Vec<FactRow>,
  pub dead_letters: Vec<DeadLetter>,
}

/// Abstraction over the persistent star-schema store.
///
/// All methods return `Send` futures so loads can run on tokio tasks.
pub trait WarehouseStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Create whatever the backend needs for every table of `catalog`.
  /// Must be idempotent.
  fn prepare<'a>(
    &'a self,
    catalog: &'a SchemaCatalog,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// Every version of every entity in the dimension.
  fn dimension_rows<'a>(
    &'a self,
    def: &'a DimensionDef,
  ) -> impl Future<Output = Result<Vec<DimensionRow>, Self::Error>> + Send + 'a;

  /// Greatest surrogate key ever minted for `dimension`; `0` if none.
  fn surrogate_high_water<'a>(
    &'a self,
    dimension: &'a str,
  ) -> impl Future<Output = Result<SurrogateKey, Self::Error>> + Send + 'a;

  fn commit_dimension<'a>(
    &'a self,
    def: &'a DimensionDef,
    batch: DimensionBatch,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  fn fact_rows<'a>(
    &'a self,
    def: &'a FactDef,
  ) -> impl Future<Output = Result<Vec<FactRow>, Self::Error>> + Send + 'a;

  fn commit_fact<'a>(
    &'a self,
    def: &'a FactDef,
    batch: FactBatch,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// Dead letters recorded for `table`, oldest first.
  fn dead_letters<'a>(
    &'a self,
    table: &'a str,
  ) -> impl Future<Output = Result<Vec<DeadLetter>, Self::Error>> + Send + 'a;
}
