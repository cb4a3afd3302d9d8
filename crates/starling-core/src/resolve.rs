//! Shared row plumbing for the loaders: coercing source rows against column
//! definitions and resolving natural-key references to surrogate keys.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::{
  catalog::{ColumnDef, DimensionDef, Reference},
  error::RowError,
  row::{DimensionRow, Record, SourceRow, SurrogateKey},
  value::{KeyTuple, NaturalKey, Value, coerce},
};

/// Coerce every declared column of `row`. Undeclared source fields are
/// ignored; missing fields are null.
pub(crate) fn coerce_record(
  columns: &[ColumnDef],
  row: &SourceRow,
) -> Result<Record, RowError> {
  let mut record = Record::new();
  for column in columns {
    let raw = row.values.get(&column.name).unwrap_or(&serde_json::Value::Null);
    let value = coerce(&column.name, column.data_type, raw)?;
    if value.is_null() && !column.nullable {
      return Err(RowError::RangeViolation {
        column: column.name.clone(),
        reason: "required value is missing".into(),
      });
    }
    record.insert(column.name.clone(), value);
  }
  Ok(record)
}

/// Collect `columns` of `record` into a key tuple.
pub(crate) fn key_of(record: &Record, columns: &[String]) -> KeyTuple {
  KeyTuple(
    columns
      .iter()
      .map(|c| record.get(c).cloned().unwrap_or(Value::Null))
      .collect(),
  )
}

/// Natural-key index over every version of one dimension.
pub(crate) struct DimensionIndex {
  versions: HashMap<NaturalKey, Vec<DimensionRow>>,
  key_types: Vec<ColumnDef>,
}

impl DimensionIndex {
  pub(crate) fn build(def: &DimensionDef, rows: Vec<DimensionRow>) -> Self {
    let mut versions: HashMap<NaturalKey, Vec<DimensionRow>> = HashMap::new();
    for row in rows {
      versions.entry(row.natural_key.clone()).or_default().push(row);
    }
    for v in versions.values_mut() {
      v.sort_by_key(|r| (r.effective_from, r.surrogate_key));
    }
    let key_types = def
      .natural_key
      .iter()
      .filter_map(|k| def.column_def(k).cloned())
      .collect();
    Self { versions, key_types }
  }

  /// The surrogate key of the version of `key` in effect at `at`.
  ///
  /// Unversioned dimensions resolve to the current row. For TYPE2 history an
  /// event before the first version resolves to the first version.
  pub(crate) fn resolve(&self, key: &NaturalKey, at: DateTime<Utc>) -> Option<SurrogateKey> {
    let versions = self.versions.get(key)?;
    versions
      .iter()
      .find(|r| r.effective_at(at))
      .or_else(|| {
        versions
          .first()
          .filter(|first| first.effective_from.is_some_and(|from| at < from))
      })
      .or_else(|| versions.iter().find(|r| r.is_current))
      .map(|r| r.surrogate_key)
  }

  /// Re-coerce a referencing key into the target's natural-key types.
  pub(crate) fn normalize(&self, key: &NaturalKey) -> Result<NaturalKey, RowError> {
    key
      .0
      .iter()
      .zip(&self.key_types)
      .map(|(v, col)| coerce(&col.name, col.data_type, &v.to_json()))
      .collect::<Result<Vec<_>, _>>()
      .map(KeyTuple)
  }

  pub(crate) fn insert(&mut self, row: DimensionRow) {
    self.versions.entry(row.natural_key.clone()).or_default().push(row);
  }
}

/// Outcome of resolving one reference of one row.
pub(crate) enum Resolution {
  /// Resolved, or an optional reference with no value.
  Resolved(Option<SurrogateKey>),
  /// A mandatory reference (or a present optional one) that did not match.
  Missing(NaturalKey),
}

/// Resolve every reference of `record` as of `at`.
///
/// Optional references whose value is present but unknown resolve to
/// `None`; mandatory ones are reported back with their normalised key.
pub(crate) fn resolve_references(
  references: &[Reference],
  record: &Record,
  at: DateTime<Utc>,
  indexes: &HashMap<String, DimensionIndex>,
) -> Result<BTreeMap<String, Resolution>, RowError> {
  let mut out = BTreeMap::new();
  for r in references {
    let raw = key_of(record, &r.columns);
    let unresolved = || RowError::UnresolvedReference {
      reference: r.name.clone(),
      target:    r.target.clone(),
      key:       raw.to_string(),
    };

    if raw.has_null() {
      if r.optional {
        out.insert(r.name.clone(), Resolution::Resolved(None));
        continue;
      }
      return Err(unresolved());
    }

    let Some(index) = indexes.get(&r.target) else {
      return Err(unresolved());
    };
    let key = index.normalize(&raw)?;
    let resolution = match index.resolve(&key, at) {
      Some(sk) => Resolution::Resolved(Some(sk)),
      None if r.optional => {
        tracing::debug!(reference = %r.name, key = %key, "optional reference left unresolved");
        Resolution::Resolved(None)
      }
      None => Resolution::Missing(key),
    };
    out.insert(r.name.clone(), resolution);
  }
  Ok(out)
}
