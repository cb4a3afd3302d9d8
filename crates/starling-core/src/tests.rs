//! Loader, validator and engine tests against the healthcare catalog and
//! the in-memory store.

use std::{
  collections::HashSet,
  convert::Infallible,
  sync::{Arc, Mutex},
};

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use crate::{
  catalog::{
    ColumnDef, DimensionDef, FactDef, FactKind, Reference, ScdType, SchemaCatalog, TableDef,
  },
  engine::{LoadEngine, LoadPlan},
  error::{Error, RowError, SchemaError},
  healthcare,
  memory::MemoryStore,
  row::{DeadLetter, DimensionRow, FactRow, SourceRow, SurrogateKey},
  store::{DimensionBatch, FactBatch, WarehouseStore},
  validate::{IntegrityValidator, IssueKind},
  value::{DataType, KeyTuple, Value},
  watermark::{RunStatus, WatermarkTracker},
};

// ─── Fixtures ────────────────────────────────────────────────────────────────

fn day(d: u32) -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2025, 1, d, 8, 0, 0).unwrap()
}

fn row(d: u32, values: serde_json::Value) -> SourceRow { SourceRow::new(day(d), values) }

fn catalog() -> Arc<SchemaCatalog> { Arc::new(healthcare::catalog().expect("healthcare catalog")) }

async fn engine() -> LoadEngine<MemoryStore, MemoryStore> {
  let store = MemoryStore::new();
  let watermarks = WatermarkTracker::open(store.clone()).await.unwrap();
  LoadEngine::new(catalog(), store, watermarks).unwrap()
}

async fn dim_rows<S, W>(engine: &LoadEngine<S, W>, name: &str) -> Vec<DimensionRow>
where
  S: WarehouseStore + 'static,
  W: crate::watermark::WatermarkStore + 'static,
{
  let def = engine.catalog().dimension(name).unwrap();
  engine.store().dimension_rows(def).await.unwrap()
}

async fn fact_rows<S, W>(engine: &LoadEngine<S, W>, name: &str) -> Vec<FactRow>
where
  S: WarehouseStore + 'static,
  W: crate::watermark::WatermarkStore + 'static,
{
  let def = engine.catalog().fact(name).unwrap();
  engine.store().fact_rows(def).await.unwrap()
}

fn text(s: &str) -> Value { Value::Text(s.into()) }

async fn seed_reference_data(engine: &LoadEngine<MemoryStore, MemoryStore>) {
  engine
    .load("DimFacility", vec![row(1, json!({ "FacilityID": "F1", "FacilityName": "General" }))])
    .await
    .unwrap();
  engine
    .load("DimPayer", vec![
      row(1, json!({ "PayerID": "P1", "PayerName": "Medicare" })),
      row(1, json!({ "PayerID": "P2", "PayerName": "Acme Health" })),
    ])
    .await
    .unwrap();
  engine
    .load("DimUnit", vec![row(1, json!({ "UnitID": "U1", "UnitName": "4 West", "FacilityID": "F1" }))])
    .await
    .unwrap();
  engine
    .load("DimPatient", vec![row(1, json!({ "PatientID": "MRN1", "ZipCode": "10001" }))])
    .await
    .unwrap();
}

fn encounter(d: u32, id: &str, payer: &str) -> SourceRow {
  row(d, json!({
    "EncounterID": id,
    "PatientID": "MRN1",
    "FacilityID": "F1",
    "PayerID": payer,
    "EncounterType": "inpatient",
    "AdmitTime": day(d).to_rfc3339(),
    "TotalCharges": "1250.50",
  }))
}

// ─── Failing store ───────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
#[error("injected failure writing {0}")]
struct Injected(String);

/// Delegates to a [`MemoryStore`] but refuses commits to selected tables.
#[derive(Clone, Default)]
struct FailingStore {
  inner:   MemoryStore,
  failing: Arc<Mutex<HashSet<String>>>,
}

impl FailingStore {
  fn fail(&self, table: &str) { self.failing.lock().unwrap().insert(table.to_owned()); }

  fn check(&self, table: &str) -> Result<(), Injected> {
    if self.failing.lock().unwrap().contains(table) {
      return Err(Injected(table.to_owned()));
    }
    Ok(())
  }
}

fn ok<T>(r: Result<T, Infallible>) -> T {
  match r {
    Ok(v) => v,
    Err(never) => match never {},
  }
}

impl WarehouseStore for FailingStore {
  type Error = Injected;

  async fn prepare(&self, catalog: &SchemaCatalog) -> Result<(), Injected> {
    Ok(ok(self.inner.prepare(catalog).await))
  }

  async fn dimension_rows(&self, def: &DimensionDef) -> Result<Vec<DimensionRow>, Injected> {
    Ok(ok(self.inner.dimension_rows(def).await))
  }

  async fn surrogate_high_water(&self, dimension: &str) -> Result<SurrogateKey, Injected> {
    Ok(ok(self.inner.surrogate_high_water(dimension).await))
  }

  async fn commit_dimension(
    &self,
    def: &DimensionDef,
    batch: DimensionBatch,
  ) -> Result<(), Injected> {
    self.check(&def.name)?;
    Ok(ok(self.inner.commit_dimension(def, batch).await))
  }

  async fn fact_rows(&self, def: &FactDef) -> Result<Vec<FactRow>, Injected> {
    Ok(ok(self.inner.fact_rows(def).await))
  }

  async fn commit_fact(&self, def: &FactDef, batch: FactBatch) -> Result<(), Injected> {
    self.check(&def.name)?;
    Ok(ok(self.inner.commit_fact(def, batch).await))
  }

  async fn dead_letters(&self, table: &str) -> Result<Vec<DeadLetter>, Injected> {
    Ok(ok(self.inner.dead_letters(table).await))
  }
}

async fn failing_engine() -> (FailingStore, LoadEngine<FailingStore, MemoryStore>) {
  let store = FailingStore::default();
  let watermarks = WatermarkTracker::open(MemoryStore::new()).await.unwrap();
  let engine = LoadEngine::new(catalog(), store.clone(), watermarks).unwrap();
  (store, engine)
}

// ─── Catalog ─────────────────────────────────────────────────────────────────

#[test]
fn healthcare_catalog_is_complete_and_frozen() {
  let catalog = catalog();
  assert!(catalog.is_frozen());
  assert_eq!(catalog.dimensions().count(), 12);
  assert_eq!(catalog.facts().count(), 10);
  assert!(IntegrityValidator::validate(&catalog).is_clean());
}

#[test]
fn frozen_catalog_rejects_registration() {
  let mut catalog = healthcare::catalog().unwrap();
  let err = catalog
    .register_dimension(DimensionDef::new("DimShift", "ShiftKey", ScdType::None).key("ShiftID", DataType::Text))
    .unwrap_err();
  assert_eq!(err, SchemaError::CatalogFrozen("DimShift".into()));
}

#[test]
fn duplicate_definition_is_rejected() {
  let mut catalog = SchemaCatalog::new();
  let dim = DimensionDef::new("DimPayer", "PayerKey", ScdType::None).key("PayerID", DataType::Text);
  catalog.register_dimension(dim.clone()).unwrap();
  assert_eq!(
    catalog.register_dimension(dim).unwrap_err(),
    SchemaError::DuplicateDefinition("DimPayer".into())
  );
}

#[test]
fn reference_to_unregistered_dimension_is_rejected() {
  let mut catalog = SchemaCatalog::new();
  let unit = DimensionDef::new("DimUnit", "UnitKey", ScdType::Type1)
    .key("UnitID", DataType::Text)
    .column(ColumnDef::required("FacilityID", DataType::Text))
    .reference(Reference::mandatory("Facility", &["FacilityID"], "DimFacility"));
  assert_eq!(
    catalog.register_dimension(unit).unwrap_err(),
    SchemaError::UnknownReference { table: "DimUnit".into(), target: "DimFacility".into() }
  );
}

#[test]
fn nullable_natural_key_is_rejected() {
  let mut catalog = SchemaCatalog::new();
  let mut dim = DimensionDef::new("DimPayer", "PayerKey", ScdType::None);
  dim.natural_key.push("PayerID".into());
  dim.columns.push(ColumnDef::nullable("PayerID", DataType::Text));
  assert!(matches!(
    catalog.register_dimension(dim),
    Err(SchemaError::InvalidDefinition { .. })
  ));
}

#[test]
fn reference_arity_must_match_target_key() {
  let mut catalog = SchemaCatalog::new();
  catalog
    .register_dimension(DimensionDef::new("DimPayer", "PayerKey", ScdType::None).key("PayerID", DataType::Text))
    .unwrap();
  let fact = FactDef::new("FactClaim", FactKind::Event)
    .grain("ClaimID", DataType::Text)
    .column(ColumnDef::required("PayerID", DataType::Text))
    .column(ColumnDef::required("PlanID", DataType::Text))
    .reference(Reference::mandatory("Payer", &["PayerID", "PlanID"], "DimPayer"));
  assert!(matches!(
    catalog.register_fact(fact),
    Err(SchemaError::InvalidDefinition { .. })
  ));
}

#[test]
fn dependency_levels_order_dimensions_before_dependants() {
  let catalog = catalog();
  let levels = catalog.dependency_levels();
  let level_of = |name: &str| levels.iter().position(|l| l.iter().any(|t| t == name)).unwrap();
  assert!(level_of("DimFacility") < level_of("DimUnit"));
  assert!(level_of("DimUnit") < level_of("FactCensusDaily"));
  assert!(level_of("DimPayer") < level_of("DimPatient"));
  assert!(level_of("DimPatient") < level_of("FactEncounter"));
}

#[test]
fn relationships_include_incoming_and_outgoing_edges() {
  let catalog = catalog();
  let rels = catalog.relationships_of("DimUnit");
  assert!(rels.iter().any(|r| r.from == "DimUnit" && r.to == "DimFacility" && r.label == "Facility"));
  assert!(rels.iter().any(|r| r.from == "FactCensusDaily" && r.to == "DimUnit"));
  assert!(rels.iter().any(|r| r.from == "FactStaffingDaily" && r.to == "DimUnit"));
}

#[tokio::test]
async fn cycles_are_reported_and_block_the_engine() {
  let mut catalog = SchemaCatalog::new();
  let a = DimensionDef::new("DimA", "AKey", ScdType::Type1)
    .key("AID", DataType::Text)
    .column(ColumnDef::nullable("BID", DataType::Text))
    .reference(Reference::optional("B", &["BID"], "DimB"));
  let b = DimensionDef::new("DimB", "BKey", ScdType::Type1)
    .key("BID", DataType::Text)
    .column(ColumnDef::nullable("AID", DataType::Text))
    .reference(Reference::optional("A", &["AID"], "DimA"));
  catalog.insert_unchecked(TableDef::Dimension(a));
  catalog.insert_unchecked(TableDef::Dimension(b));
  catalog.freeze();

  let report = IntegrityValidator::validate(&catalog);
  assert_eq!(report.of_kind(IssueKind::Cycle).count(), 1);

  let store = MemoryStore::new();
  let watermarks = WatermarkTracker::open(store.clone()).await.unwrap();
  let err = LoadEngine::new(Arc::new(catalog), store, watermarks).err().unwrap();
  assert_eq!(err, SchemaError::Invalid(1));
}

#[tokio::test]
async fn engine_requires_a_frozen_catalog() {
  let mut catalog = SchemaCatalog::new();
  catalog
    .register_dimension(DimensionDef::new("DimPayer", "PayerKey", ScdType::None).key("PayerID", DataType::Text))
    .unwrap();
  let store = MemoryStore::new();
  let watermarks = WatermarkTracker::open(store.clone()).await.unwrap();
  let err = LoadEngine::new(Arc::new(catalog), store, watermarks).err().unwrap();
  assert_eq!(err, SchemaError::CatalogNotFrozen);
}

// ─── Dimensions ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn type1_reload_is_idempotent() {
  let e = engine().await;
  seed_reference_data(&e).await;

  let again = e
    .load("DimUnit", vec![row(2, json!({ "UnitID": "U1", "UnitName": "4 West", "FacilityID": "F1" }))])
    .await
    .unwrap();
  assert_eq!((again.inserted, again.updated, again.unchanged), (0, 0, 1));
  assert_eq!(dim_rows(&e, "DimUnit").await.len(), 1);
}

#[tokio::test]
async fn type1_change_overwrites_in_place() {
  let e = engine().await;
  seed_reference_data(&e).await;
  let before = dim_rows(&e, "DimUnit").await;

  let result = e
    .load("DimUnit", vec![row(3, json!({ "UnitID": "U1", "UnitName": "4 West ICU", "FacilityID": "F1" }))])
    .await
    .unwrap();
  assert_eq!(result.updated, 1);

  let after = dim_rows(&e, "DimUnit").await;
  assert_eq!(after.len(), 1);
  assert_eq!(after[0].surrogate_key, before[0].surrogate_key);
  assert_eq!(after[0].values["UnitName"], text("4 West ICU"));
  assert_eq!(after[0].refs["Facility"], Some(1));
}

#[tokio::test]
async fn type2_tracked_change_opens_a_new_version() {
  let e = engine().await;
  seed_reference_data(&e).await;

  let result = e
    .load("DimPatient", vec![row(5, json!({ "PatientID": "MRN1", "ZipCode": "10002" }))])
    .await
    .unwrap();
  assert_eq!(result.updated, 1);

  let mut rows = dim_rows(&e, "DimPatient").await;
  rows.sort_by_key(|r| r.surrogate_key);
  assert_eq!(rows.len(), 2);
  assert_eq!(rows.iter().filter(|r| r.is_current).count(), 1);

  let (old, new) = (&rows[0], &rows[1]);
  assert_ne!(old.surrogate_key, new.surrogate_key);
  assert!(!old.is_current);
  assert_eq!(old.effective_from, Some(day(1)));
  assert_eq!(old.effective_to, Some(day(5)));
  assert!(new.is_current);
  assert_eq!(new.effective_from, Some(day(5)));
  assert_eq!(new.effective_to, None);
  assert_eq!(new.values["ZipCode"], text("10002"));
}

#[tokio::test]
async fn type2_untracked_change_does_not_version() {
  let e = engine().await;
  seed_reference_data(&e).await;

  e.load("DimPatient", vec![row(4, json!({ "PatientID": "MRN1", "ZipCode": "10001", "Sex": "F" }))])
    .await
    .unwrap();

  let rows = dim_rows(&e, "DimPatient").await;
  assert_eq!(rows.len(), 1);
  assert_eq!(rows[0].values["Sex"], text("F"));
  assert_eq!(rows[0].effective_from, Some(day(1)));
}

#[tokio::test]
async fn type2_stale_rows_are_unchanged_or_rejected() {
  let e = engine().await;
  seed_reference_data(&e).await;
  e.load("DimPatient", vec![row(5, json!({ "PatientID": "MRN1", "ZipCode": "10002" }))])
    .await
    .unwrap();

  // Replaying the original version is a no-op.
  let replay = e
    .load("DimPatient", vec![row(1, json!({ "PatientID": "MRN1", "ZipCode": "10001" }))])
    .await
    .unwrap();
  assert_eq!(replay.unchanged, 1);
  assert!(replay.dead_letters.is_empty());

  let stale = e
    .load("DimPatient", vec![row(3, json!({ "PatientID": "MRN1", "ZipCode": "99999" }))])
    .await
    .unwrap();
  assert_eq!(stale.dead_letters.len(), 1);
  assert!(matches!(
    &stale.dead_letters[0].error,
    RowError::RangeViolation { column, .. } if column == "EventTime"
  ));
  assert_eq!(dim_rows(&e, "DimPatient").await.len(), 2);
}

#[tokio::test]
async fn type2_versions_within_one_batch_close_in_event_order() {
  let e = engine().await;
  seed_reference_data(&e).await;

  // Deliberately out of order.
  e.load("DimPatient", vec![
    row(9, json!({ "PatientID": "MRN1", "ZipCode": "10009" })),
    row(6, json!({ "PatientID": "MRN1", "ZipCode": "10006" })),
  ])
  .await
  .unwrap();

  let mut rows = dim_rows(&e, "DimPatient").await;
  rows.sort_by_key(|r| r.effective_from);
  let zips: Vec<_> = rows.iter().map(|r| r.values["ZipCode"].clone()).collect();
  assert_eq!(zips, vec![text("10001"), text("10006"), text("10009")]);
  assert_eq!(rows[0].effective_to, Some(day(6)));
  assert_eq!(rows[1].effective_to, Some(day(9)));
  assert!(rows[2].is_current);
}

#[tokio::test]
async fn immutable_dimension_rejects_changes() {
  let e = engine().await;
  seed_reference_data(&e).await;

  let result = e
    .load("DimPayer", vec![row(2, json!({ "PayerID": "P1", "PayerName": "Medicare Advantage" }))])
    .await
    .unwrap();
  assert_eq!(result.applied(), 0);
  assert_eq!(result.dead_letters.len(), 1);
  assert_eq!(result.dead_letters[0].error, RowError::ImmutableDimensionViolation {
    key:    "P1".into(),
    column: "PayerName".into(),
  });

  let payers = dim_rows(&e, "DimPayer").await;
  let p1 = payers.iter().find(|r| r.natural_key == KeyTuple::from_iter(["P1"])).unwrap();
  assert_eq!(p1.values["PayerName"], text("Medicare"));
}

#[tokio::test]
async fn conflicting_rows_for_one_key_dead_letter_the_later_one() {
  let e = engine().await;
  let result = e
    .load("DimFacility", vec![
      row(1, json!({ "FacilityID": "F1", "FacilityName": "General" })),
      row(1, json!({ "FacilityID": "F1", "FacilityName": "Generic" })),
      row(1, json!({ "FacilityID": "F1", "FacilityName": "General" })),
    ])
    .await
    .unwrap();
  assert_eq!((result.inserted, result.unchanged), (1, 1));
  assert_eq!(result.dead_letters.len(), 1);
  assert_eq!(result.dead_letters[0].row_index, 1);
  assert!(matches!(result.dead_letters[0].error, RowError::ConflictingNaturalKey { .. }));
}

#[tokio::test]
async fn unresolved_dimension_reference_is_dead_lettered() {
  let e = engine().await;
  let result = e
    .load("DimUnit", vec![row(1, json!({ "UnitID": "U9", "UnitName": "Orphan", "FacilityID": "F404" }))])
    .await
    .unwrap();
  assert_eq!(result.applied(), 0);
  assert!(matches!(
    &result.dead_letters[0].error,
    RowError::UnresolvedReference { target, key, .. } if target == "DimFacility" && key == "F404"
  ));
}

#[tokio::test]
async fn bad_values_are_dead_lettered_not_fatal() {
  let e = engine().await;
  let result = e
    .load("DimFacility", vec![
      row(1, json!({ "FacilityID": "F1", "FacilityName": "General", "LicensedBeds": "many" })),
      row(1, json!({ "FacilityID": "F2" })),
      row(1, json!({ "FacilityID": "F3", "FacilityName": "Northside", "LicensedBeds": 120 })),
    ])
    .await
    .unwrap();
  assert_eq!(result.inserted, 1);
  let columns: Vec<_> = result
    .dead_letters
    .iter()
    .map(|dl| match &dl.error {
      RowError::RangeViolation { column, .. } => column.clone(),
      other => panic!("unexpected {other:?}"),
    })
    .collect();
  assert_eq!(columns, vec!["LicensedBeds".to_owned(), "FacilityName".to_owned()]);
}

// ─── Facts ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn snapshot_reload_overwrites_one_row() {
  let e = engine().await;
  seed_reference_data(&e).await;
  let census = |d: u32, occupied: i64| {
    row(d, json!({
      "CensusDate": "2025-01-01",
      "FacilityID": "F1",
      "UnitID": "U1",
      "OccupiedBeds": occupied,
      "StaffedBeds": 24,
    }))
  };

  let first = e.load("FactCensusDaily", vec![census(2, 20)]).await.unwrap();
  assert_eq!(first.inserted, 1);
  let rerun = e.load("FactCensusDaily", vec![census(2, 20)]).await.unwrap();
  assert_eq!((rerun.inserted, rerun.updated, rerun.unchanged), (0, 0, 1));
  let corrected = e.load("FactCensusDaily", vec![census(3, 22)]).await.unwrap();
  assert_eq!(corrected.updated, 1);

  let rows = fact_rows(&e, "FactCensusDaily").await;
  assert_eq!(rows.len(), 1);
  assert_eq!(rows[0].measures["OccupiedBeds"], Some(22.0));
  assert_eq!(rows[0].dimension_refs["Unit"], Some(1));
  assert_eq!(rows[0].dimension_refs["CensusDate"], None);
}

#[tokio::test]
async fn snapshot_batch_keeps_the_latest_row_per_grain() {
  let e = engine().await;
  seed_reference_data(&e).await;
  let census = |d: u32, occupied: i64| {
    row(d, json!({ "CensusDate": "2025-01-01", "FacilityID": "F1", "UnitID": "U1", "OccupiedBeds": occupied }))
  };

  let result = e
    .load("FactCensusDaily", vec![census(4, 18), census(2, 30), census(3, 25)])
    .await
    .unwrap();
  assert_eq!((result.inserted, result.updated), (1, 2));
  let rows = fact_rows(&e, "FactCensusDaily").await;
  assert_eq!(rows[0].measures["OccupiedBeds"], Some(18.0));
  assert_eq!(rows[0].event_time, day(4));
}

#[tokio::test]
async fn event_fact_rejects_duplicate_grain() {
  let e = engine().await;
  seed_reference_data(&e).await;

  let first = e
    .load("FactEncounter", vec![encounter(2, "E1", "P1"), encounter(2, "E1", "P1")])
    .await
    .unwrap();
  assert_eq!(first.inserted, 1);
  assert_eq!(first.dead_letters.len(), 1);

  let again = e.load("FactEncounter", vec![encounter(3, "E1", "P2")]).await.unwrap();
  assert_eq!(again.applied(), 0);
  assert_eq!(again.dead_letters[0].error, RowError::DuplicateFactRow { grain: "E1".into() });

  let rows = fact_rows(&e, "FactEncounter").await;
  assert_eq!(rows.len(), 1);
  assert_eq!(rows[0].dimension_refs["Payer"], Some(1));
}

#[tokio::test]
async fn unknown_payer_is_dead_lettered_and_the_rest_commits() {
  let e = engine().await;
  seed_reference_data(&e).await;

  let result = e
    .load("FactEncounter", vec![
      encounter(2, "E1", "P1"),
      encounter(2, "E2", "P9"),
      encounter(2, "E3", "P2"),
    ])
    .await
    .unwrap();
  assert_eq!(result.inserted, 2);
  assert_eq!(result.dead_letters.len(), 1);
  let dl = &result.dead_letters[0];
  assert_eq!(dl.row_index, 1);
  assert_eq!(dl.row_id.as_deref(), Some("E2"));
  assert_eq!(dl.error, RowError::UnresolvedReference {
    reference: "Payer".into(),
    target:    "DimPayer".into(),
    key:       "P9".into(),
  });

  let stored = e.store().dead_letters("FactEncounter").await.unwrap();
  assert_eq!(stored, result.dead_letters);
  assert_eq!(fact_rows(&e, "FactEncounter").await.len(), 2);
}

#[tokio::test]
async fn unknown_optional_reference_is_left_empty() {
  let e = engine().await;
  seed_reference_data(&e).await;

  let mut row = encounter(2, "E1", "P1");
  row.values.insert("ServiceLineID".into(), json!("SL-404"));
  let result = e.load("FactEncounter", vec![row]).await.unwrap();
  assert_eq!(result.inserted, 1);

  let rows = fact_rows(&e, "FactEncounter").await;
  assert_eq!(rows[0].dimension_refs["ServiceLine"], None);
  assert_eq!(rows[0].values["ServiceLineID"], text("SL-404"));
}

#[tokio::test]
async fn facts_resolve_the_version_in_effect_at_event_time() {
  let e = engine().await;
  seed_reference_data(&e).await;
  e.load("DimPatient", vec![row(5, json!({ "PatientID": "MRN1", "ZipCode": "10002" }))])
    .await
    .unwrap();

  let mut early = encounter(1, "E0", "P1");
  early.event_time = Utc.with_ymd_and_hms(2024, 12, 31, 0, 0, 0).unwrap();
  e.load("FactEncounter", vec![early, encounter(3, "E1", "P1"), encounter(6, "E2", "P1")])
    .await
    .unwrap();

  let rows = fact_rows(&e, "FactEncounter").await;
  let patient_of = |id: &str| {
    rows
      .iter()
      .find(|r| r.id() == id)
      .and_then(|r| r.dimension_refs["Patient"])
      .unwrap()
  };
  assert_eq!(patient_of("E0"), 1);
  assert_eq!(patient_of("E1"), 1);
  assert_eq!(patient_of("E2"), 2);
}

#[tokio::test]
async fn late_arriving_patient_is_inferred_then_completed() {
  let e = engine().await;
  seed_reference_data(&e).await;
  e.load("DimDepartment", vec![row(1, json!({ "DepartmentID": "D1", "DepartmentName": "Cardiology", "FacilityID": "F1" }))])
    .await
    .unwrap();
  e.load("DimProvider", vec![row(1, json!({ "ProviderID": "NPI1", "ProviderName": "Dr. Reyes", "DepartmentID": "D1" }))])
    .await
    .unwrap();
  e.load("DimAppointmentType", vec![row(1, json!({ "AppointmentTypeID": "NEW", "AppointmentTypeName": "New patient" }))])
    .await
    .unwrap();

  let appointment = row(3, json!({
    "AppointmentID": "A1",
    "PatientID": "MRN7",
    "ProviderID": "NPI1",
    "DepartmentID": "D1",
    "AppointmentTypeID": "NEW",
    "AppointmentDate": "2025-01-20",
    "Status": "scheduled",
  }));
  let result = e.load("FactAppointment", vec![appointment]).await.unwrap();
  assert_eq!(result.inserted, 1);
  assert!(result.dead_letters.is_empty());

  let inferred = dim_rows(&e, "DimPatient")
    .await
    .into_iter()
    .find(|r| r.natural_key == KeyTuple::from_iter(["MRN7"]))
    .unwrap();
  assert!(inferred.inferred);
  assert_eq!(inferred.values["ZipCode"], Value::Null);
  let fact = &fact_rows(&e, "FactAppointment").await[0];
  assert_eq!(fact.dimension_refs["Patient"], Some(inferred.surrogate_key));

  let completed = e
    .load("DimPatient", vec![row(4, json!({ "PatientID": "MRN7", "ZipCode": "10455" }))])
    .await
    .unwrap();
  assert_eq!(completed.updated, 1);
  let rows: Vec<_> = dim_rows(&e, "DimPatient")
    .await
    .into_iter()
    .filter(|r| r.natural_key == KeyTuple::from_iter(["MRN7"]))
    .collect();
  assert_eq!(rows.len(), 1);
  assert_eq!(rows[0].surrogate_key, inferred.surrogate_key);
  assert!(!rows[0].inferred);
  assert_eq!(rows[0].effective_from, Some(day(3)));

  assert!(e.audit().await.unwrap().is_clean());
}

/// Everything an appointment references except patients beyond MRN1.
async fn seed_scheduling<S, W>(e: &LoadEngine<S, W>)
where
  S: WarehouseStore + 'static,
  W: crate::watermark::WatermarkStore + 'static,
{
  let batches = [
    ("DimFacility", json!({ "FacilityID": "F1", "FacilityName": "General" })),
    ("DimDepartment", json!({ "DepartmentID": "D1", "DepartmentName": "Cardiology", "FacilityID": "F1" })),
    ("DimProvider", json!({ "ProviderID": "NPI1", "ProviderName": "Dr. Reyes", "DepartmentID": "D1" })),
    ("DimAppointmentType", json!({ "AppointmentTypeID": "NEW", "AppointmentTypeName": "New patient" })),
    ("DimPatient", json!({ "PatientID": "MRN1", "ZipCode": "10001" })),
  ];
  for (table, values) in batches {
    e.load(table, vec![row(1, values)]).await.unwrap();
  }
}

fn appointment(d: u32, id: &str, patient: &str) -> SourceRow {
  row(d, json!({
    "AppointmentID": id,
    "PatientID": patient,
    "ProviderID": "NPI1",
    "DepartmentID": "D1",
    "AppointmentTypeID": "NEW",
    "AppointmentDate": "2025-01-20",
    "Status": "scheduled",
  }))
}

fn patients_named<'r>(rows: &'r [DimensionRow], id: &str) -> Vec<&'r DimensionRow> {
  let key = KeyTuple::from_iter([id]);
  rows.iter().filter(|r| r.natural_key == key).collect()
}

#[tokio::test]
async fn failed_fact_commit_keeps_no_inferred_members() {
  let (store, e) = failing_engine().await;
  seed_scheduling(&e).await;
  let high_water = e.store().surrogate_high_water("DimPatient").await.unwrap();

  store.fail("FactAppointment");
  let err = e
    .load("FactAppointment", vec![appointment(2, "A1", "MRN9")])
    .await
    .unwrap_err();
  assert!(matches!(err, Error::Commit { ref table, .. } if table == "FactAppointment"));

  let patients = dim_rows(&e, "DimPatient").await;
  assert!(patients_named(&patients, "MRN9").is_empty());
  assert_eq!(patients.len(), 1);
  assert_eq!(e.store().surrogate_high_water("DimPatient").await.unwrap(), high_water);
  assert!(fact_rows(&e, "FactAppointment").await.is_empty());
  assert!(e.watermarks().get("FactAppointment").await.is_none());
}

#[tokio::test]
async fn rejected_rows_infer_nothing() {
  let e = engine().await;
  seed_scheduling(&e).await;
  e.load("FactAppointment", vec![appointment(2, "A1", "MRN1")])
    .await
    .unwrap();

  // A1 again, for a patient nobody has seen: the duplicate is rejected
  // before the patient is inferred.
  let result = e
    .load("FactAppointment", vec![appointment(3, "A1", "GHOST")])
    .await
    .unwrap();
  assert_eq!(result.inserted, 0);
  assert_eq!(result.dead_letters.len(), 1);
  assert!(matches!(result.dead_letters[0].error, RowError::DuplicateFactRow { .. }));

  let patients = dim_rows(&e, "DimPatient").await;
  assert!(patients_named(&patients, "GHOST").is_empty());
  assert_eq!(e.store().surrogate_high_water("DimPatient").await.unwrap(), 1);
  assert!(e.audit().await.unwrap().is_clean());
}

#[tokio::test]
async fn one_batch_infers_each_unknown_key_once() {
  let e = engine().await;
  seed_scheduling(&e).await;
  let result = e
    .load("FactAppointment", vec![
      appointment(2, "A1", "MRN8"),
      appointment(2, "A1", "MRN5"),
      appointment(3, "A2", "MRN8"),
    ])
    .await
    .unwrap();
  assert_eq!(result.inserted, 2);
  assert_eq!(result.dead_letters.len(), 1);

  let patients = dim_rows(&e, "DimPatient").await;
  assert!(patients_named(&patients, "MRN5").is_empty());
  let mrn8 = patients_named(&patients, "MRN8");
  assert_eq!(mrn8.len(), 1);
  assert_eq!(mrn8[0].surrogate_key, 2);
  assert_eq!(e.store().surrogate_high_water("DimPatient").await.unwrap(), 2);

  let facts = fact_rows(&e, "FactAppointment").await;
  assert!(facts.iter().all(|f| f.dimension_refs["Patient"] == Some(2)));
  assert!(e.audit().await.unwrap().is_clean());
}

// ─── Watermarks ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn watermark_tracks_the_latest_committed_event() {
  let e = engine().await;
  assert!(e.watermarks().get("DimFacility").await.is_none());

  e.load("DimFacility", vec![
    row(3, json!({ "FacilityID": "F1", "FacilityName": "General" })),
    row(7, json!({ "FacilityID": "F2", "FacilityName": "Northside" })),
  ])
  .await
  .unwrap();
  let w = e.watermarks().get("DimFacility").await.unwrap();
  assert_eq!(w.last_loaded_value, day(7));
  assert_eq!(w.last_run_status, RunStatus::Success);

  // Empty batches and older batches never move it backwards.
  e.load("DimFacility", vec![]).await.unwrap();
  e.load("DimFacility", vec![row(2, json!({ "FacilityID": "F3", "FacilityName": "East" }))])
    .await
    .unwrap();
  assert_eq!(e.watermarks().get("DimFacility").await.unwrap().last_loaded_value, day(7));

  let reset = e.watermarks().reset("DimFacility", day(1)).await.unwrap();
  assert_eq!(reset.last_loaded_value, day(1));
  assert_eq!(e.watermarks().snapshot().await.len(), 1);
}

#[tokio::test]
async fn watermarks_survive_a_restart() {
  let store = MemoryStore::new();
  {
    let watermarks = WatermarkTracker::open(store.clone()).await.unwrap();
    let e = LoadEngine::new(catalog(), store.clone(), watermarks).unwrap();
    e.load("DimPayer", vec![row(4, json!({ "PayerID": "P1", "PayerName": "Medicare" }))])
      .await
      .unwrap();
  }
  let reopened = WatermarkTracker::open(store).await.unwrap();
  assert_eq!(reopened.get("DimPayer").await.unwrap().last_loaded_value, day(4));
}

#[tokio::test]
async fn failed_commit_leaves_watermark_in_place() {
  let (store, e) = failing_engine().await;
  e.load("DimFacility", vec![row(1, json!({ "FacilityID": "F1", "FacilityName": "General" }))])
    .await
    .unwrap();

  store.fail("DimFacility");
  let err = e
    .load("DimFacility", vec![row(5, json!({ "FacilityID": "F2", "FacilityName": "Northside" }))])
    .await
    .unwrap_err();
  assert!(matches!(err, Error::Commit { ref table, .. } if table == "DimFacility"));

  let w = e.watermarks().get("DimFacility").await.unwrap();
  assert_eq!(w.last_loaded_value, day(1));
  assert_eq!(w.last_run_status, RunStatus::Failed);
  assert_eq!(dim_rows(&e, "DimFacility").await.len(), 1);
}

// ─── Validation ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn audit_reports_corrupted_rows() {
  let e = engine().await;
  seed_reference_data(&e).await;
  assert!(e.audit().await.unwrap().is_clean());

  let def = e.catalog().dimension("DimPayer").unwrap();
  let mut rogue = dim_rows(&e, "DimPayer").await.remove(0);
  rogue.surrogate_key = 40;
  e.store()
    .commit_dimension(def, DimensionBatch { rows: vec![rogue], ..Default::default() })
    .await
    .unwrap();

  let report = e.audit().await.unwrap();
  assert_eq!(report.of_kind(IssueKind::DuplicateCurrentRow).count(), 1);
  assert_eq!(report.of_kind(IssueKind::SurrogateKeyDomain).count(), 1);

  let err = e.run(LoadPlan::new()).await.unwrap_err();
  assert!(matches!(err, Error::IntegrityBlocked(r) if r.issues.len() == 2));
}

// ─── Engine runs ─────────────────────────────────────────────────────────────

fn plan() -> LoadPlan {
  LoadPlan::from([
    ("DimFacility".to_owned(), vec![row(1, json!({ "FacilityID": "F1", "FacilityName": "General" }))]),
    ("DimPayer".to_owned(), vec![row(1, json!({ "PayerID": "P1", "PayerName": "Medicare" }))]),
    ("DimUnit".to_owned(), vec![row(1, json!({ "UnitID": "U1", "UnitName": "4 West", "FacilityID": "F1" }))]),
    ("FactCensusDaily".to_owned(), vec![row(2, json!({
      "CensusDate": "2025-01-01", "FacilityID": "F1", "UnitID": "U1", "OccupiedBeds": 20,
    }))]),
  ])
}

#[tokio::test]
async fn run_loads_every_table_in_dependency_order() {
  let e = engine().await;
  let report = e.run(plan()).await.unwrap();
  assert!(report.is_success());
  assert_eq!(report.results.len(), 4);
  assert!(report.results.iter().all(|r| r.run_id == report.run_id));
  assert!(report.results.iter().all(|r| r.dead_letters.is_empty()));
  assert_eq!(report.result("FactCensusDaily").unwrap().inserted, 1);
  assert!(e.audit().await.unwrap().is_clean());
}

#[tokio::test]
async fn run_skips_dependants_of_a_failed_table() {
  let (store, e) = failing_engine().await;
  store.fail("DimFacility");

  let report = e.run(plan()).await.unwrap();
  assert!(!report.is_success());
  assert_eq!(report.failed.len(), 1);
  assert_eq!(report.failed[0].table, "DimFacility");
  assert_eq!(report.skipped, vec!["DimUnit".to_owned(), "FactCensusDaily".to_owned()]);
  assert!(report.result("DimPayer").is_some());
  assert!(e.watermarks().get("DimUnit").await.is_none());
}

#[tokio::test]
async fn run_rejects_unknown_tables() {
  let e = engine().await;
  let plan = LoadPlan::from([("DimWeather".to_owned(), vec![])]);
  let err = e.run(plan).await.unwrap_err();
  assert!(matches!(err, Error::Schema(SchemaError::UnknownTable(t)) if t == "DimWeather"));
}

#[tokio::test]
async fn concurrent_loads_of_one_dimension_mint_distinct_keys() {
  let e = engine().await;
  let (a, b) = (e.clone(), e.clone());
  let (ra, rb) = tokio::join!(
    tokio::spawn(async move {
      a.load("DimPayer", vec![row(1, json!({ "PayerID": "P1", "PayerName": "Medicare" }))]).await
    }),
    tokio::spawn(async move {
      b.load("DimPayer", vec![row(1, json!({ "PayerID": "P2", "PayerName": "Acme Health" }))]).await
    }),
  );
  ra.unwrap().unwrap();
  rb.unwrap().unwrap();

  let mut keys: Vec<_> = dim_rows(&e, "DimPayer").await.iter().map(|r| r.surrogate_key).collect();
  keys.sort();
  assert_eq!(keys, vec![1, 2]);
  assert!(e.audit().await.unwrap().is_clean());
}
