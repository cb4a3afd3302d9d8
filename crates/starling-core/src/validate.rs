//! [`IntegrityValidator`] — structural checks over a catalog and row-level
//! audits over a store. Neither mutates anything; both return a
//! [`ValidationReport`].

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{
  catalog::{Reference, SchemaCatalog, TableDef},
  error::{Error, Result},
  resolve::key_of,
  row::SurrogateKey,
  store::WarehouseStore,
  value::{GrainKey, NaturalKey},
};

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IssueKind {
  /// A reference whose target is missing or is not a dimension.
  DanglingReference,
  /// Dimension references that loop back on themselves.
  Cycle,
  /// Surrogate key naming collisions, non-positive keys, or keys beyond the
  /// recorded sequence.
  SurrogateKeyDomain,
  /// Natural key or grain missing, undeclared or nullable.
  KeyDeclaration,
  DuplicateGrain,
  DuplicateSurrogateKey,
  /// More than one current version for one natural key.
  DuplicateCurrentRow,
  NullMandatoryReference,
  /// A stored reference pointing at a surrogate key that does not exist.
  UnresolvedSurrogateKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
  pub table:          String,
  pub issue_kind:     IssueKind,
  pub row_identifier: Option<String>,
  pub detail:         String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
  pub issues: Vec<Issue>,
}

impl ValidationReport {
  pub fn is_clean(&self) -> bool { self.issues.is_empty() }

  pub fn of_kind(&self, kind: IssueKind) -> impl Iterator<Item = &Issue> {
    self.issues.iter().filter(move |i| i.issue_kind == kind)
  }

  fn push(
    &mut self,
    table: &str,
    issue_kind: IssueKind,
    row_identifier: Option<String>,
    detail: impl Into<String>,
  ) {
    self.issues.push(Issue {
      table: table.to_owned(),
      issue_kind,
      row_identifier,
      detail: detail.into(),
    });
  }
}

pub struct IntegrityValidator;

impl IntegrityValidator {
  /// Structural checks over the catalog alone.
  pub fn validate(catalog: &SchemaCatalog) -> ValidationReport {
    let mut report = ValidationReport::default();

    for table in catalog.tables() {
      let name = table.name();
      for r in table.references() {
        if catalog.dimension(&r.target).is_none() {
          report.push(
            name,
            IssueKind::DanglingReference,
            None,
            format!("reference {:?} targets {:?}, which is not a dimension", r.name, r.target),
          );
        }
      }

      match table {
        TableDef::Dimension(d) => {
          if d.natural_key.is_empty() {
            report.push(name, IssueKind::KeyDeclaration, None, "natural key is empty");
          }
          if let Some(r) = d.references.iter().find(|r| r.key_column() == d.surrogate_key) {
            report.push(
              name,
              IssueKind::SurrogateKeyDomain,
              None,
              format!("reference {:?} reuses surrogate key column {:?}", r.name, d.surrogate_key),
            );
          }
        }
        TableDef::Fact(f) => {
          if f.grain.is_empty() {
            report.push(name, IssueKind::KeyDeclaration, None, "grain is empty");
          }
          for g in &f.grain {
            if f.column_def(g).is_none_or(|c| c.nullable) {
              report.push(
                name,
                IssueKind::KeyDeclaration,
                None,
                format!("grain column {g:?} is undeclared or nullable"),
              );
            }
          }
        }
      }
    }

    for cycle in find_cycles(catalog) {
      report.push(&cycle[0], IssueKind::Cycle, None, cycle.join(" -> "));
    }
    report
  }

  /// Structural checks plus row-level checks against `store`.
  pub async fn audit<S: WarehouseStore>(
    catalog: &SchemaCatalog,
    store: &S,
  ) -> Result<ValidationReport> {
    let mut report = Self::validate(catalog);
    let mut keys: HashMap<String, HashSet<SurrogateKey>> = HashMap::new();

    for dim in catalog.dimensions() {
      let rows = store
        .dimension_rows(dim)
        .await
        .map_err(|e| Error::read(&dim.name, e))?;
      let high_water = store
        .surrogate_high_water(&dim.name)
        .await
        .map_err(|e| Error::read(&dim.name, e))?;

      let mut seen = HashSet::new();
      let mut current: BTreeMap<NaturalKey, usize> = BTreeMap::new();
      for row in &rows {
        let id = Some(row.surrogate_key.to_string());
        if row.surrogate_key <= 0 || row.surrogate_key > high_water {
          report.push(
            &dim.name,
            IssueKind::SurrogateKeyDomain,
            id.clone(),
            format!("surrogate key outside 1..={high_water}"),
          );
        }
        if !seen.insert(row.surrogate_key) {
          report.push(&dim.name, IssueKind::DuplicateSurrogateKey, id.clone(), "surrogate key reused");
        }
        if row.is_current {
          *current.entry(row.natural_key.clone()).or_default() += 1;
        }
        if !row.inferred {
          check_refs(&mut report, &dim.name, &dim.references, &row.refs, &keys, id);
        }
      }
      for (key, count) in current.into_iter().filter(|(_, c)| *c > 1) {
        report.push(
          &dim.name,
          IssueKind::DuplicateCurrentRow,
          Some(key.to_string()),
          format!("{count} current versions"),
        );
      }
      keys.insert(dim.name.clone(), seen);
    }

    for fact in catalog.facts() {
      let rows = store
        .fact_rows(fact)
        .await
        .map_err(|e| Error::read(&fact.name, e))?;
      let mut grains: HashSet<GrainKey> = HashSet::new();
      for row in &rows {
        let grain = key_of(&row.values, &fact.grain);
        let id = Some(grain.to_string());
        if !grains.insert(grain) {
          report.push(&fact.name, IssueKind::DuplicateGrain, id.clone(), "grain repeated");
        }
        check_refs(&mut report, &fact.name, &fact.references, &row.dimension_refs, &keys, id);
      }
    }

    Ok(report)
  }
}

fn check_refs(
  report: &mut ValidationReport,
  table: &str,
  references: &[Reference],
  refs: &BTreeMap<String, Option<SurrogateKey>>,
  keys: &HashMap<String, HashSet<SurrogateKey>>,
  row_identifier: Option<String>,
) {
  for r in references {
    match refs.get(&r.name).copied().flatten() {
      None if !r.optional => report.push(
        table,
        IssueKind::NullMandatoryReference,
        row_identifier.clone(),
        format!("mandatory reference {:?} is null", r.name),
      ),
      None => {}
      Some(sk) => {
        if !keys.get(&r.target).is_some_and(|k| k.contains(&sk)) {
          report.push(
            table,
            IssueKind::UnresolvedSurrogateKey,
            row_identifier.clone(),
            format!("{:?} points at missing {}.{sk}", r.name, r.target),
          );
        }
      }
    }
  }
}

/// Every cycle among dimension-to-dimension references, as a path that
/// starts and ends at the same table.
fn find_cycles(catalog: &SchemaCatalog) -> Vec<Vec<String>> {
  #[derive(Clone, Copy, PartialEq)]
  enum Mark {
    Visiting,
    Done,
  }

  fn visit(
    catalog: &SchemaCatalog,
    node: &str,
    marks: &mut HashMap<String, Mark>,
    path: &mut Vec<String>,
    cycles: &mut Vec<Vec<String>>,
  ) {
    match marks.get(node) {
      Some(Mark::Done) => return,
      Some(Mark::Visiting) => {
        if let Some(start) = path.iter().position(|p| p == node) {
          let mut cycle = path[start..].to_vec();
          cycle.push(node.to_owned());
          cycles.push(cycle);
        }
        return;
      }
      None => {}
    }
    marks.insert(node.to_owned(), Mark::Visiting);
    path.push(node.to_owned());
    if let Some(dim) = catalog.dimension(node) {
      for r in &dim.references {
        visit(catalog, &r.target, marks, path, cycles);
      }
    }
    path.pop();
    marks.insert(node.to_owned(), Mark::Done);
  }

  let mut marks = HashMap::new();
  let mut cycles = Vec::new();
  for dim in catalog.dimensions() {
    visit(catalog, &dim.name, &mut marks, &mut Vec::new(), &mut cycles);
  }
  cycles
}
