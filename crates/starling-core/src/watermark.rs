//! Per-table incremental-load watermarks.
//!
//! A watermark records the greatest source `event_time` a table has
//! committed. It is created on the first successful batch, advanced only
//! after a batch commits, and only moved backwards by an explicit
//! [`WatermarkTracker::reset`].

use std::{collections::HashMap, future::Future};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Error, Result};

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
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
  Success,
  Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
  pub table_name:        String,
  pub last_loaded_value: DateTime<Utc>,
  pub last_run_status:   RunStatus,
  pub updated_at:        DateTime<Utc>,
}

/// Durable storage for watermarks.
///
/// `persist_watermark` must not return before the write is durable.
pub trait WatermarkStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  fn load_watermarks(
    &self,
  ) -> impl Future<Output = Result<Vec<Watermark>, Self::Error>> + Send + '_;

  fn persist_watermark(
    &self,
    watermark: Watermark,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;
}

/// Process-wide watermark state, initialised from a [`WatermarkStore`] and
/// written through to it.
pub struct WatermarkTracker<W> {
  store: W,
  state: RwLock<HashMap<String, Watermark>>,
}

impl<W: WatermarkStore> WatermarkTracker<W> {
  /// Load persisted watermarks from `store`.
  pub async fn open(store: W) -> Result<Self> {
    let loaded = store
      .load_watermarks()
      .await
      .map_err(|e| Error::watermark("*", e))?;
    let state = loaded
      .into_iter()
      .map(|w| (w.table_name.clone(), w))
      .collect();
    Ok(Self { store, state: RwLock::new(state) })
  }

  pub fn store(&self) -> &W { &self.store }

  pub async fn get(&self, table: &str) -> Option<Watermark> {
    self.state.read().await.get(table).cloned()
  }

  pub async fn snapshot(&self) -> Vec<Watermark> {
    let mut all: Vec<_> = self.state.read().await.values().cloned().collect();
    all.sort_by(|a, b| a.table_name.cmp(&b.table_name));
    all
  }

  /// Record a committed batch whose greatest event time is `value`.
  /// Never moves the watermark backwards.
  pub async fn advance(&self, table: &str, value: DateTime<Utc>) -> Result<Watermark> {
    let next = match self.get(table).await {
      Some(w) if w.last_loaded_value > value => w.last_loaded_value,
      _ => value,
    };
    self.write(table, next, RunStatus::Success).await
  }

  /// Record a failed batch. The value is left untouched; a table that never
  /// loaded successfully has no watermark to mark.
  pub async fn mark_failed(&self, table: &str) -> Result<Option<Watermark>> {
    let Some(current) = self.get(table).await else {
      return Ok(None);
    };
    self
      .write(table, current.last_loaded_value, RunStatus::Failed)
      .await
      .map(Some)
  }

  /// Explicit reprocessing: set the watermark to `value`, even backwards.
  pub async fn reset(&self, table: &str, value: DateTime<Utc>) -> Result<Watermark> {
    tracing::info!(table, to = %value, "resetting watermark");
    self.write(table, value, RunStatus::Success).await
  }

  async fn write(
    &self,
    table: &str,
    value: DateTime<Utc>,
    status: RunStatus,
  ) -> Result<Watermark> {
    let watermark = Watermark {
      table_name:        table.to_owned(),
      last_loaded_value: value,
      last_run_status:   status,
      updated_at:        Utc::now(),
    };
    // Durable first; memory only follows a successful persist.
    self
      .store
      .persist_watermark(watermark.clone())
      .await
      .map_err(|e| Error::watermark(table, e))?;
    self
      .state
      .write()
      .await
      .insert(table.to_owned(), watermark.clone());
    Ok(watermark)
  }
}
