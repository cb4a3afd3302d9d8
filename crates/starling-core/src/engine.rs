//! [`LoadEngine`] — dependency-ordered, per-table-locked load orchestration.
//!
//! Tables are loaded in the waves given by
//! [`SchemaCatalog::dependency_levels`]: everything in one wave runs
//! concurrently on tokio tasks, and a wave only starts once the previous one
//! has finished. Each table has one async write lock; a batch holds it from
//! its first read until its watermark has advanced.

use std::{
  collections::{BTreeMap, BTreeSet, HashMap, HashSet},
  sync::Arc,
};

use serde::Serialize;
use tokio::{
  sync::{Mutex, OwnedMutexGuard},
  task::JoinSet,
};
use uuid::Uuid;

use crate::{
  catalog::{LateArrivalPolicy, SchemaCatalog, TableDef},
  dimension::DimensionLoader,
  error::{Error, Result, SchemaError},
  fact::FactLoader,
  row::{LoadResult, SourceRow},
  store::WarehouseStore,
  validate::{IntegrityValidator, ValidationReport},
  watermark::{WatermarkStore, WatermarkTracker},
};

/// Incoming batches keyed by table name.
pub type LoadPlan = BTreeMap<String, Vec<SourceRow>>;

#[derive(Debug, Clone, Serialize)]
pub struct TableFailure {
  pub table: String,
  pub error: String,
}

/// Outcome of [`LoadEngine::run`].
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
  pub run_id:  Uuid,
  pub results: Vec<LoadResult>,
  pub failed:  Vec<TableFailure>,
  /// Tables not attempted because a table they reference failed.
  pub skipped: Vec<String>,
}

impl RunReport {
  pub fn is_success(&self) -> bool { self.failed.is_empty() && self.skipped.is_empty() }

  pub fn result(&self, table: &str) -> Option<&LoadResult> {
    self.results.iter().find(|r| r.table == table)
  }
}

struct Inner<S, W> {
  catalog:    Arc<SchemaCatalog>,
  store:      S,
  watermarks: WatermarkTracker<W>,
  locks:      HashMap<String, Arc<Mutex<()>>>,
}

/// Cloning is cheap; clones share the store, watermarks and locks.
pub struct LoadEngine<S, W> {
  inner: Arc<Inner<S, W>>,
}

impl<S, W> Clone for LoadEngine<S, W> {
  fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl<S, W> LoadEngine<S, W>
where
  S: WarehouseStore + 'static,
  W: WatermarkStore + 'static,
{
  /// Build an engine over a frozen, structurally valid catalog.
  pub fn new(
    catalog: Arc<SchemaCatalog>,
    store: S,
    watermarks: WatermarkTracker<W>,
  ) -> Result<Self, SchemaError> {
    if !catalog.is_frozen() {
      return Err(SchemaError::CatalogNotFrozen);
    }
    let report = IntegrityValidator::validate(&catalog);
    if !report.is_clean() {
      for issue in &report.issues {
        tracing::error!(table = %issue.table, kind = %issue.issue_kind, "{}", issue.detail);
      }
      return Err(SchemaError::Invalid(report.issues.len()));
    }
    let locks = catalog
      .tables()
      .map(|t| (t.name().to_owned(), Arc::new(Mutex::new(()))))
      .collect();
    Ok(Self { inner: Arc::new(Inner { catalog, store, watermarks, locks }) })
  }

  pub fn catalog(&self) -> &SchemaCatalog { &self.inner.catalog }

  pub fn store(&self) -> &S { &self.inner.store }

  pub fn watermarks(&self) -> &WatermarkTracker<W> { &self.inner.watermarks }

  /// Create backend tables for the catalog.
  pub async fn prepare(&self) -> Result<()> {
    self
      .inner
      .store
      .prepare(&self.inner.catalog)
      .await
      .map_err(|e| Error::commit("*", e))
  }

  /// Structural and row-level integrity audit of the current store.
  pub async fn audit(&self) -> Result<ValidationReport> {
    IntegrityValidator::audit(&self.inner.catalog, &self.inner.store).await
  }

  /// Load one batch into any table.
  pub async fn load(&self, table: &str, rows: Vec<SourceRow>) -> Result<LoadResult> {
    self.load_in_run(table, rows, Uuid::new_v4()).await
  }

  async fn load_in_run(&self, table: &str, rows: Vec<SourceRow>, run_id: Uuid) -> Result<LoadResult> {
    let inner = &self.inner;
    let def = inner
      .catalog
      .get(table)
      .ok_or_else(|| SchemaError::UnknownTable(table.to_owned()))?;

    // Facts that may mint inferred members also write their dimensions.
    let mut tables: BTreeSet<&str> = BTreeSet::from([table]);
    if let TableDef::Fact(f) = def
      && f.late_arrival == LateArrivalPolicy::InferMember
    {
      tables.extend(f.references.iter().map(|r| r.target.as_str()));
    }
    let _guards = self.lock(&tables).await?;

    match def {
      TableDef::Dimension(_) => {
        DimensionLoader::new(&inner.catalog, &inner.store, &inner.watermarks)
          .load_in_run(table, rows, run_id)
          .await
      }
      TableDef::Fact(_) => {
        FactLoader::new(&inner.catalog, &inner.store, &inner.watermarks)
          .load_in_run(table, rows, run_id)
          .await
      }
    }
  }

  /// Acquire the write locks of `tables` in name order.
  async fn lock(&self, tables: &BTreeSet<&str>) -> Result<Vec<OwnedMutexGuard<()>>> {
    let mut guards = Vec::with_capacity(tables.len());
    for table in tables {
      let lock = self
        .inner
        .locks
        .get(*table)
        .ok_or_else(|| SchemaError::UnknownTable((*table).to_owned()))?;
      tracing::debug!(table, "waiting for table lock");
      guards.push(Arc::clone(lock).lock_owned().await);
    }
    Ok(guards)
  }

  /// Load every batch of `plan` in dependency order.
  ///
  /// Fails up front if the plan names an unknown table or the integrity
  /// audit is not clean. Per-table failures are reported, not returned.
  pub async fn run(&self, mut plan: LoadPlan) -> Result<RunReport> {
    if let Some(unknown) = plan.keys().find(|t| self.inner.catalog.get(t).is_none()) {
      return Err(SchemaError::UnknownTable(unknown.clone()).into());
    }

    let audit = self.audit().await?;
    if !audit.is_clean() {
      return Err(Error::IntegrityBlocked(audit));
    }

    let run_id = Uuid::new_v4();
    tracing::info!(%run_id, tables = plan.len(), "load run started");

    let mut report = RunReport {
      run_id,
      results: Vec::new(),
      failed: Vec::new(),
      skipped: Vec::new(),
    };
    let mut blocked: HashSet<String> = HashSet::new();

    for wave in self.inner.catalog.dependency_levels() {
      let mut tasks = JoinSet::new();
      let mut spawned: HashMap<tokio::task::Id, String> = HashMap::new();
      for table in wave {
        let depends_on_blocked = self
          .inner
          .catalog
          .get(&table)
          .is_some_and(|t| t.references().iter().any(|r| blocked.contains(&r.target)));
        if depends_on_blocked {
          // Propagate so tables further down the graph are skipped too.
          if plan.remove(&table).is_some() {
            report.skipped.push(table.clone());
          }
          blocked.insert(table);
          continue;
        }
        let Some(rows) = plan.remove(&table) else {
          continue;
        };
        let engine = self.clone();
        let name = table.clone();
        let handle = tasks.spawn(async move {
          engine.load_in_run(&name, rows, run_id).await
        });
        spawned.insert(handle.id(), table);
      }

      while let Some(joined) = tasks.join_next_with_id().await {
        let (table, outcome) = match joined {
          Ok((id, outcome)) => (spawned.remove(&id), outcome),
          Err(join_error) => (
            spawned.remove(&join_error.id()),
            Err(Error::Task(join_error.to_string())),
          ),
        };
        let table = table.unwrap_or_default();
        match outcome {
          Ok(result) => report.results.push(result),
          Err(e) => {
            tracing::error!(%run_id, table = %table, error = %e, "table load failed");
            report.failed.push(TableFailure { table: table.clone(), error: e.to_string() });
            blocked.insert(table);
          }
        }
      }
    }

    report.results.sort_by(|a, b| a.table.cmp(&b.table));
    tracing::info!(
      %run_id,
      loaded = report.results.len(),
      failed = report.failed.len(),
      skipped = report.skipped.len(),
      "load run finished"
    );
    Ok(report)
  }
}
