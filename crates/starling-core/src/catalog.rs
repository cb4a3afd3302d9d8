//! [`SchemaCatalog`] — typed dimension and fact definitions and the
//! relationship graph between them.
//!
//! Registration is dependency-ordered: a table may only reference dimensions
//! that are already registered, so the relationship graph is acyclic by
//! construction. Once [`SchemaCatalog::freeze`] is called the catalog is
//! read-only and can be shared by the loaders.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{error::SchemaError, value::DataType};

/// Bookkeeping columns every persisted table may carry. Data columns must not
/// use these names.
pub const RESERVED_COLUMNS: &[&str] = &[
  "EffectiveFrom",
  "EffectiveTo",
  "IsCurrent",
  "IsInferred",
  "EventTime",
  "LoadTime",
];

// ─── Columns and references ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
  pub name:      String,
  #[serde(rename = "type")]
  pub data_type: DataType,
  #[serde(default)]
  pub nullable:  bool,
}

impl ColumnDef {
  pub fn required(name: impl Into<String>, data_type: DataType) -> Self {
    Self { name: name.into(), data_type, nullable: false }
  }

  pub fn nullable(name: impl Into<String>, data_type: DataType) -> Self {
    Self { name: name.into(), data_type, nullable: true }
  }
}

/// A many-to-one edge from the declaring table to a dimension.
///
/// `columns` hold the target's natural key, positionally. The resolved
/// surrogate key travels under [`Reference::key_column`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
  pub name:     String,
  pub columns:  Vec<String>,
  pub target:   String,
  #[serde(default)]
  pub optional: bool,
}

impl Reference {
  pub fn mandatory(
    name: impl Into<String>,
    columns: &[&str],
    target: impl Into<String>,
  ) -> Self {
    Self {
      name:     name.into(),
      columns:  columns.iter().map(|c| (*c).to_owned()).collect(),
      target:   target.into(),
      optional: false,
    }
  }

  pub fn optional(
    name: impl Into<String>,
    columns: &[&str],
    target: impl Into<String>,
  ) -> Self {
    Self { optional: true, ..Self::mandatory(name, columns, target) }
  }

  /// Column holding the resolved surrogate key, e.g. `FacilityKey`.
  pub fn key_column(&self) -> String { format!("{}Key", self.name) }
}

// ─── Dimension ───────────────────────────────────────────────────────────────

/// How a dimension reacts to attribute changes on an existing natural key.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Default,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ScdType {
  /// Reference data: the row may never change once loaded.
  None,
  /// Overwrite in place, keeping the surrogate key.
  #[default]
  Type1,
  /// Close the current version and open a new one with a new surrogate key.
  Type2,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionDef {
  pub name:          String,
  /// Name of the surrogate key column, e.g. `FacilityKey`.
  pub surrogate_key: String,
  pub natural_key:   Vec<String>,
  pub columns:       Vec<ColumnDef>,
  #[serde(default)]
  pub scd_type:      ScdType,
  /// Columns whose change opens a new TYPE2 version. Empty means all
  /// non-key columns.
  #[serde(default)]
  pub tracked:       Vec<String>,
  #[serde(default)]
  pub references:    Vec<Reference>,
}

impl DimensionDef {
  pub fn new(
    name: impl Into<String>,
    surrogate_key: impl Into<String>,
    scd_type: ScdType,
  ) -> Self {
    Self {
      name: name.into(),
      surrogate_key: surrogate_key.into(),
      natural_key: Vec::new(),
      columns: Vec::new(),
      scd_type,
      tracked: Vec::new(),
      references: Vec::new(),
    }
  }

  /// Declare a required natural-key column.
  pub fn key(mut self, name: &str, data_type: DataType) -> Self {
    self.natural_key.push(name.to_owned());
    self.columns.push(ColumnDef::required(name, data_type));
    self
  }

  pub fn column(mut self, column: ColumnDef) -> Self {
    self.columns.push(column);
    self
  }

  pub fn track(mut self, columns: &[&str]) -> Self {
    self.tracked.extend(columns.iter().map(|c| (*c).to_owned()));
    self
  }

  pub fn reference(mut self, reference: Reference) -> Self {
    self.references.push(reference);
    self
  }

  pub fn column_def(&self, name: &str) -> Option<&ColumnDef> {
    self.columns.iter().find(|c| c.name == name)
  }

  /// Whether a change in `column` opens a new TYPE2 version.
  pub fn is_tracked(&self, column: &str) -> bool {
    if self.natural_key.iter().any(|k| k == column) {
      return false;
    }
    self.tracked.is_empty() || self.tracked.iter().any(|t| t == column)
  }

  fn check(&self) -> Result<(), SchemaError> {
    let invalid = |reason: String| SchemaError::InvalidDefinition {
      table: self.name.clone(),
      reason,
    };

    check_columns(&self.name, &self.columns)?;
    if self.natural_key.is_empty() {
      return Err(invalid("natural key is empty".into()));
    }
    for key in &self.natural_key {
      match self.column_def(key) {
        None => return Err(invalid(format!("natural key column {key:?} is not declared"))),
        Some(c) if c.nullable => {
          return Err(invalid(format!("natural key column {key:?} is nullable")));
        }
        Some(_) => {}
      }
    }
    if self.surrogate_key.is_empty()
      || self.column_def(&self.surrogate_key).is_some()
      || RESERVED_COLUMNS.contains(&self.surrogate_key.as_str())
    {
      return Err(invalid(format!(
        "surrogate key column {:?} collides with a data column",
        self.surrogate_key
      )));
    }
    for tracked in &self.tracked {
      if self.column_def(tracked).is_none() {
        return Err(invalid(format!("tracked column {tracked:?} is not declared")));
      }
    }
    check_references(&self.name, &self.columns, &self.references)
  }
}

// ─── Fact ────────────────────────────────────────────────────────────────────

/// Whether re-loading an existing grain overwrites it or is rejected.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FactKind {
  /// Keyed by a unique business id; duplicates are rejected.
  Event,
  /// Keyed by a periodic grain (e.g. a date); re-loads overwrite.
  Snapshot,
}

/// What a fact load does with a mandatory reference that does not resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LateArrivalPolicy {
  #[default]
  DeadLetter,
  /// Mint a placeholder dimension row carrying only the natural key.
  InferMember,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactDef {
  pub name:         String,
  pub kind:         FactKind,
  pub grain:        Vec<String>,
  pub columns:      Vec<ColumnDef>,
  #[serde(default)]
  pub measures:     Vec<ColumnDef>,
  #[serde(default)]
  pub references:   Vec<Reference>,
  #[serde(default)]
  pub late_arrival: LateArrivalPolicy,
}

impl FactDef {
  pub fn new(name: impl Into<String>, kind: FactKind) -> Self {
    Self {
      name: name.into(),
      kind,
      grain: Vec::new(),
      columns: Vec::new(),
      measures: Vec::new(),
      references: Vec::new(),
      late_arrival: LateArrivalPolicy::default(),
    }
  }

  /// Declare a required grain column.
  pub fn grain(mut self, name: &str, data_type: DataType) -> Self {
    self.grain.push(name.to_owned());
    self.columns.push(ColumnDef::required(name, data_type));
    self
  }

  pub fn column(mut self, column: ColumnDef) -> Self {
    self.columns.push(column);
    self
  }

  pub fn measure(mut self, name: &str, data_type: DataType) -> Self {
    self.measures.push(ColumnDef::nullable(name, data_type));
    self
  }

  pub fn reference(mut self, reference: Reference) -> Self {
    self.references.push(reference);
    self
  }

  pub fn late_arrival(mut self, policy: LateArrivalPolicy) -> Self {
    self.late_arrival = policy;
    self
  }

  pub fn column_def(&self, name: &str) -> Option<&ColumnDef> {
    self.columns.iter().find(|c| c.name == name)
  }

  fn check(&self) -> Result<(), SchemaError> {
    let invalid = |reason: String| SchemaError::InvalidDefinition {
      table: self.name.clone(),
      reason,
    };

    let all: Vec<ColumnDef> =
      self.columns.iter().chain(&self.measures).cloned().collect();
    check_columns(&self.name, &all)?;

    if self.grain.is_empty() {
      return Err(invalid("grain is empty".into()));
    }
    for g in &self.grain {
      match self.column_def(g) {
        None => return Err(invalid(format!("grain column {g:?} is not declared"))),
        Some(c) if c.nullable => {
          return Err(invalid(format!("grain column {g:?} is nullable")));
        }
        Some(_) => {}
      }
    }
    if let Some(m) = self.measures.iter().find(|m| !m.data_type.is_numeric()) {
      return Err(invalid(format!("measure {:?} is not numeric", m.name)));
    }
    check_references(&self.name, &self.columns, &self.references)
  }
}

fn check_columns(table: &str, columns: &[ColumnDef]) -> Result<(), SchemaError> {
  let mut seen = HashSet::new();
  for c in columns {
    if !seen.insert(c.name.as_str()) {
      return Err(SchemaError::InvalidDefinition {
        table:  table.to_owned(),
        reason: format!("column {:?} declared twice", c.name),
      });
    }
    if RESERVED_COLUMNS.contains(&c.name.as_str()) {
      return Err(SchemaError::InvalidDefinition {
        table:  table.to_owned(),
        reason: format!("column name {:?} is reserved", c.name),
      });
    }
  }
  Ok(())
}

fn check_references(
  table: &str,
  columns: &[ColumnDef],
  references: &[Reference],
) -> Result<(), SchemaError> {
  let mut names = HashSet::new();
  for r in references {
    let invalid = |reason: String| SchemaError::InvalidDefinition {
      table: table.to_owned(),
      reason,
    };
    if !names.insert(r.name.as_str()) {
      return Err(invalid(format!("reference {:?} declared twice", r.name)));
    }
    if r.columns.is_empty() {
      return Err(invalid(format!("reference {:?} has no columns", r.name)));
    }
    if columns.iter().any(|c| c.name == r.key_column()) {
      return Err(invalid(format!(
        "reference key column {:?} collides with a data column",
        r.key_column()
      )));
    }
    for col in &r.columns {
      if !columns.iter().any(|c| &c.name == col) {
        return Err(invalid(format!(
          "reference {:?} uses undeclared column {col:?}",
          r.name
        )));
      }
    }
  }
  Ok(())
}

// ─── Catalog ─────────────────────────────────────────────────────────────────

/// A registered table definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableDef {
  Dimension(DimensionDef),
  Fact(FactDef),
}

impl TableDef {
  pub fn name(&self) -> &str {
    match self {
      Self::Dimension(d) => &d.name,
      Self::Fact(f) => &f.name,
    }
  }

  pub fn references(&self) -> &[Reference] {
    match self {
      Self::Dimension(d) => &d.references,
      Self::Fact(f) => &f.references,
    }
  }

  pub fn as_dimension(&self) -> Option<&DimensionDef> {
    match self {
      Self::Dimension(d) => Some(d),
      Self::Fact(_) => None,
    }
  }

  pub fn as_fact(&self) -> Option<&FactDef> {
    match self {
      Self::Fact(f) => Some(f),
      Self::Dimension(_) => None,
    }
  }
}

/// A directed, labelled many-to-one edge in the relationship graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Relationship {
  pub from:     String,
  pub to:       String,
  pub label:    String,
  pub columns:  Vec<String>,
  pub optional: bool,
}

/// Shape of a catalog declared in a TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogFile {
  #[serde(default)]
  pub dimensions: Vec<DimensionDef>,
  #[serde(default)]
  pub facts:      Vec<FactDef>,
}

/// The source of truth for table definitions and their relationships.
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
  tables: Vec<TableDef>,
  index:  HashMap<String, usize>,
  frozen: bool,
}

impl SchemaCatalog {
  pub fn new() -> Self { Self::default() }

  /// Register every definition of `file` in file order, dimensions first.
  pub fn from_file(file: CatalogFile) -> Result<Self, SchemaError> {
    let mut catalog = Self::new();
    for d in file.dimensions {
      catalog.register_dimension(d)?;
    }
    for f in file.facts {
      catalog.register_fact(f)?;
    }
    Ok(catalog)
  }

  pub fn register_dimension(&mut self, def: DimensionDef) -> Result<(), SchemaError> {
    self.admit(&def.name, &def.references)?;
    def.check()?;
    for r in &def.references {
      self.check_arity(&def.name, r)?;
    }
    self.insert(TableDef::Dimension(def));
    Ok(())
  }

  pub fn register_fact(&mut self, def: FactDef) -> Result<(), SchemaError> {
    self.admit(&def.name, &def.references)?;
    def.check()?;
    for r in &def.references {
      self.check_arity(&def.name, r)?;
    }
    self.insert(TableDef::Fact(def));
    Ok(())
  }

  fn admit(&self, name: &str, references: &[Reference]) -> Result<(), SchemaError> {
    if self.frozen {
      return Err(SchemaError::CatalogFrozen(name.to_owned()));
    }
    if self.index.contains_key(name) {
      return Err(SchemaError::DuplicateDefinition(name.to_owned()));
    }
    for r in references {
      if self.dimension(&r.target).is_none() {
        return Err(SchemaError::UnknownReference {
          table:  name.to_owned(),
          target: r.target.clone(),
        });
      }
    }
    Ok(())
  }

  fn check_arity(&self, table: &str, r: &Reference) -> Result<(), SchemaError> {
    let target = self.dimension(&r.target).ok_or_else(|| {
      SchemaError::UnknownReference { table: table.to_owned(), target: r.target.clone() }
    })?;
    if target.natural_key.len() != r.columns.len() {
      return Err(SchemaError::InvalidDefinition {
        table:  table.to_owned(),
        reason: format!(
          "reference {:?} has {} column(s) but {:?} has a {}-column natural key",
          r.name,
          r.columns.len(),
          target.name,
          target.natural_key.len()
        ),
      });
    }
    Ok(())
  }

  fn insert(&mut self, table: TableDef) {
    self.index.insert(table.name().to_owned(), self.tables.len());
    self.tables.push(table);
  }

  /// Bypass registration checks, to build graphs registration would refuse.
  #[cfg(test)]
  pub(crate) fn insert_unchecked(&mut self, table: TableDef) { self.insert(table); }

  /// Make the catalog read-only.
  pub fn freeze(&mut self) { self.frozen = true; }

  pub fn is_frozen(&self) -> bool { self.frozen }

  pub fn get(&self, name: &str) -> Option<&TableDef> {
    self.index.get(name).map(|&i| &self.tables[i])
  }

  pub fn dimension(&self, name: &str) -> Option<&DimensionDef> {
    self.get(name).and_then(TableDef::as_dimension)
  }

  pub fn fact(&self, name: &str) -> Option<&FactDef> {
    self.get(name).and_then(TableDef::as_fact)
  }

  /// All tables in registration order.
  pub fn tables(&self) -> impl Iterator<Item = &TableDef> { self.tables.iter() }

  pub fn dimensions(&self) -> impl Iterator<Item = &DimensionDef> {
    self.tables.iter().filter_map(TableDef::as_dimension)
  }

  pub fn facts(&self) -> impl Iterator<Item = &FactDef> {
    self.tables.iter().filter_map(TableDef::as_fact)
  }

  /// Every edge that starts or ends at `table_name`.
  pub fn relationships_of(&self, table_name: &str) -> Vec<Relationship> {
    self
      .tables
      .iter()
      .flat_map(|t| {
        t.references().iter().map(move |r| Relationship {
          from:     t.name().to_owned(),
          to:       r.target.clone(),
          label:    r.name.clone(),
          columns:  r.columns.clone(),
          optional: r.optional,
        })
      })
      .filter(|rel| rel.from == table_name || rel.to == table_name)
      .collect()
  }

  /// Tables grouped into waves: every table only references tables in
  /// earlier waves. Facts never share a wave with a dimension they use.
  pub fn dependency_levels(&self) -> Vec<Vec<String>> {
    let mut level: HashMap<&str, usize> = HashMap::new();
    let mut waves: Vec<Vec<String>> = Vec::new();
    for t in &self.tables {
      let l = t
        .references()
        .iter()
        .filter_map(|r| level.get(r.target.as_str()))
        .map(|l| l + 1)
        .max()
        .unwrap_or(0);
      level.insert(t.name(), l);
      if waves.len() <= l {
        waves.resize_with(l + 1, Vec::new);
      }
      waves[l].push(t.name().to_owned());
    }
    waves
  }
}
