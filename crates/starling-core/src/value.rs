//! Typed column values and their coercion from source JSON.
//!
//! Every column in the catalog declares a [`DataType`]. Incoming rows carry
//! loosely-typed JSON; coercion turns them into [`Value`]s or reports a
//! [`RowError::RangeViolation`].

use std::{cmp::Ordering, fmt, hash::Hash};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RowError;

// ─── DataType ────────────────────────────────────────────────────────────────

/// The declared type of a column.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DataType {
  Integer,
  Decimal,
  Text,
  Boolean,
  Date,
  Timestamp,
}

impl DataType {
  pub fn is_numeric(self) -> bool {
    matches!(self, Self::Integer | Self::Decimal)
  }
}

// ─── Value ───────────────────────────────────────────────────────────────────

/// A single typed cell.
///
/// Values have a total order so they can participate in natural keys and
/// grain tuples; decimals compare with [`f64::total_cmp`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
  Null,
  Boolean(bool),
  Integer(i64),
  Decimal(f64),
  Text(String),
  Date(NaiveDate),
  Timestamp(DateTime<Utc>),
}

impl Value {
  pub fn is_null(&self) -> bool { matches!(self, Self::Null) }

  /// Numeric view used for measures.
  pub fn as_f64(&self) -> Option<f64> {
    match self {
      Self::Integer(i) => Some(*i as f64),
      Self::Decimal(d) => Some(*d),
      _ => None,
    }
  }

  fn rank(&self) -> u8 {
    match self {
      Self::Null => 0,
      Self::Boolean(_) => 1,
      Self::Integer(_) => 2,
      Self::Decimal(_) => 3,
      Self::Text(_) => 4,
      Self::Date(_) => 5,
      Self::Timestamp(_) => 6,
    }
  }

  /// Render back to plain JSON, the inverse of [`coerce`] for valid input.
  pub fn to_json(&self) -> serde_json::Value {
    use serde_json::Value as J;
    match self {
      Self::Null => J::Null,
      Self::Boolean(b) => J::Bool(*b),
      Self::Integer(i) => J::from(*i),
      Self::Decimal(d) => J::from(*d),
      Self::Text(s) => J::String(s.clone()),
      Self::Date(d) => J::String(d.format("%Y-%m-%d").to_string()),
      Self::Timestamp(t) => J::String(t.to_rfc3339()),
    }
  }
}

impl PartialEq for Value {
  fn eq(&self, other: &Self) -> bool { self.cmp(other) == Ordering::Equal }
}

impl Eq for Value {}

impl PartialOrd for Value {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for Value {
  fn cmp(&self, other: &Self) -> Ordering {
    match (self, other) {
      (Self::Null, Self::Null) => Ordering::Equal,
      (Self::Boolean(a), Self::Boolean(b)) => a.cmp(b),
      (Self::Integer(a), Self::Integer(b)) => a.cmp(b),
      (Self::Decimal(a), Self::Decimal(b)) => a.total_cmp(b),
      (Self::Text(a), Self::Text(b)) => a.cmp(b),
      (Self::Date(a), Self::Date(b)) => a.cmp(b),
      (Self::Timestamp(a), Self::Timestamp(b)) => a.cmp(b),
      _ => self.rank().cmp(&other.rank()),
    }
  }
}

impl Hash for Value {
  fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
    self.rank().hash(state);
    match self {
      Self::Null => {}
      Self::Boolean(b) => b.hash(state),
      Self::Integer(i) => i.hash(state),
      Self::Decimal(d) => d.to_bits().hash(state),
      Self::Text(s) => s.hash(state),
      Self::Date(d) => d.hash(state),
      Self::Timestamp(t) => t.hash(state),
    }
  }
}

impl fmt::Display for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Null => f.write_str("NULL"),
      Self::Boolean(b) => write!(f, "{b}"),
      Self::Integer(i) => write!(f, "{i}"),
      Self::Decimal(d) => write!(f, "{d}"),
      Self::Text(s) => f.write_str(s),
      Self::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
      Self::Timestamp(t) => f.write_str(&t.to_rfc3339()),
    }
  }
}

impl From<&str> for Value {
  fn from(s: &str) -> Self { Self::Text(s.to_owned()) }
}

impl From<String> for Value {
  fn from(s: String) -> Self { Self::Text(s) }
}

impl From<i64> for Value {
  fn from(i: i64) -> Self { Self::Integer(i) }
}

impl From<NaiveDate> for Value {
  fn from(d: NaiveDate) -> Self { Self::Date(d) }
}

// ─── Key tuples ──────────────────────────────────────────────────────────────

/// An ordered tuple of values: a natural key or a fact grain.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct KeyTuple(pub Vec<Value>);

/// The business identifier of a dimension entity.
pub type NaturalKey = KeyTuple;

/// The uniqueness tuple of a fact row.
pub type GrainKey = KeyTuple;

impl KeyTuple {
  pub fn has_null(&self) -> bool { self.0.iter().any(Value::is_null) }
}

impl fmt::Display for KeyTuple {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (i, v) in self.0.iter().enumerate() {
      if i > 0 {
        f.write_str("|")?;
      }
      write!(f, "{v}")?;
    }
    Ok(())
  }
}

impl<V: Into<Value>> FromIterator<V> for KeyTuple {
  fn from_iter<I: IntoIterator<Item = V>>(iter: I) -> Self {
    Self(iter.into_iter().map(Into::into).collect())
  }
}

// ─── Coercion ────────────────────────────────────────────────────────────────

/// Coerce a JSON value into the declared type of `column`.
pub fn coerce(
  column: &str,
  data_type: DataType,
  raw: &serde_json::Value,
) -> Result<Value, RowError> {
  use serde_json::Value as J;

  let bad = |reason: String| RowError::RangeViolation {
    column: column.to_owned(),
    reason,
  };

  if raw.is_null() {
    return Ok(Value::Null);
  }

  match data_type {
    DataType::Integer => match raw {
      J::Number(n) => n
        .as_i64()
        .map(Value::Integer)
        .ok_or_else(|| bad(format!("{n} is not an integer"))),
      J::String(s) => s
        .trim()
        .parse()
        .map(Value::Integer)
        .map_err(|_| bad(format!("{s:?} is not an integer"))),
      other => Err(bad(format!("expected integer, got {other}"))),
    },
    DataType::Decimal => {
      let d = match raw {
        J::Number(n) => n.as_f64(),
        J::String(s) => s.trim().parse().ok(),
        _ => None,
      }
      .ok_or_else(|| bad(format!("expected decimal, got {raw}")))?;
      if !d.is_finite() {
        return Err(bad(format!("{d} is not finite")));
      }
      Ok(Value::Decimal(d))
    }
    DataType::Text => match raw {
      J::String(s) => Ok(Value::Text(s.clone())),
      J::Number(n) => Ok(Value::Text(n.to_string())),
      J::Bool(b) => Ok(Value::Text(b.to_string())),
      other => Err(bad(format!("expected text, got {other}"))),
    },
    DataType::Boolean => match raw {
      J::Bool(b) => Ok(Value::Boolean(*b)),
      J::Number(n) if n.as_i64() == Some(0) => Ok(Value::Boolean(false)),
      J::Number(n) if n.as_i64() == Some(1) => Ok(Value::Boolean(true)),
      J::String(s) => match s.to_ascii_lowercase().as_str() {
        "true" | "y" | "yes" | "1" => Ok(Value::Boolean(true)),
        "false" | "n" | "no" | "0" => Ok(Value::Boolean(false)),
        _ => Err(bad(format!("{s:?} is not a boolean"))),
      },
      other => Err(bad(format!("expected boolean, got {other}"))),
    },
    DataType::Date => match raw {
      J::String(s) => parse_date(s)
        .map(Value::Date)
        .ok_or_else(|| bad(format!("{s:?} is not a date"))),
      other => Err(bad(format!("expected date string, got {other}"))),
    },
    DataType::Timestamp => match raw {
      J::String(s) => parse_timestamp(s)
        .map(Value::Timestamp)
        .ok_or_else(|| bad(format!("{s:?} is not a timestamp"))),
      other => Err(bad(format!("expected timestamp string, got {other}"))),
    },
  }
}

/// Accepts `YYYY-MM-DD` or a full timestamp (truncated to its UTC date).
pub fn parse_date(s: &str) -> Option<NaiveDate> {
  let s = s.trim();
  NaiveDate::parse_from_str(s, "%Y-%m-%d")
    .ok()
    .or_else(|| parse_timestamp(s).map(|t| t.date_naive()))
}

/// Accepts RFC 3339, or a naive `YYYY-MM-DD HH:MM:SS` / `YYYY-MM-DDTHH:MM:SS`
/// interpreted as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
  let s = s.trim();
  if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
    return Some(dt.with_timezone(&Utc));
  }
  ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
    .iter()
    .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
    .map(|naive| naive.and_utc())
}
