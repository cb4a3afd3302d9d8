//! Error types for `starling-core`.
//!
//! Three tiers: [`SchemaError`] is fatal at startup, [`RowError`] is isolated
//! to one incoming row and dead-lettered, and [`Error`] aborts a whole batch
//! (or run) without advancing any watermark.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::validate::ValidationReport;

/// Catalog registration and definition errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
  #[error("table {0:?} is already defined")]
  DuplicateDefinition(String),

  #[error("{table:?} references {target:?}, which is not a registered dimension")]
  UnknownReference { table: String, target: String },

  #[error("catalog is frozen; cannot register {0:?}")]
  CatalogFrozen(String),

  #[error("catalog must be frozen before loading")]
  CatalogNotFrozen,

  #[error("invalid definition for {table:?}: {reason}")]
  InvalidDefinition { table: String, reason: String },

  #[error("unknown table: {0:?}")]
  UnknownTable(String),

  #[error("catalog failed structural validation with {0} issue(s)")]
  Invalid(usize),
}

/// A per-row rejection. Carried in dead letters, so it serialises.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RowError {
  #[error("reference {reference:?} to {target:?} with key {key:?} does not resolve")]
  UnresolvedReference {
    reference: String,
    target:    String,
    key:       String,
  },

  #[error("fact row with grain {grain:?} already exists")]
  DuplicateFactRow { grain: String },

  #[error("natural key {key:?} has conflicting versions at the same event time")]
  ConflictingNaturalKey { key: String },

  #[error("column {column:?} out of range: {reason}")]
  RangeViolation { column: String, reason: String },

  #[error("dimension row {key:?} is immutable; column {column:?} changed")]
  ImmutableDimensionViolation { key: String, column: String },
}

/// Batch- and run-level failures.
#[derive(Debug, Error)]
pub enum Error {
  #[error("schema error: {0}")]
  Schema(#[from] SchemaError),

  #[error("integrity audit found {} issue(s); loading is blocked", .0.issues.len())]
  IntegrityBlocked(ValidationReport),

  #[error("commit of {table:?} failed: {source}")]
  Commit {
    table:  String,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },

  #[error("reading {table:?} from the store failed: {source}")]
  Read {
    table:  String,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },

  #[error("watermark update for {table:?} failed: {source}")]
  Watermark {
    table:  String,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },

  #[error("load task panicked or was aborted: {0}")]
  Task(String),
}

impl Error {
  pub(crate) fn commit<E>(table: &str, source: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::Commit { table: table.to_owned(), source: Box::new(source) }
  }

  pub(crate) fn read<E>(table: &str, source: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::Read { table: table.to_owned(), source: Box::new(source) }
  }

  pub(crate) fn watermark<E>(table: &str, source: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::Watermark { table: table.to_owned(), source: Box::new(source) }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
