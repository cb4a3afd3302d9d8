//! Core types, loaders and trait definitions for the Starling warehouse.
//!
//! This crate knows nothing about SQL. Storage backends implement
//! [`store::WarehouseStore`] and [`watermark::WatermarkStore`]; everything
//! else (catalog, SCD handling, fact resolution, validation, scheduling)
//! lives here.

// Native `async fn` in traits; the `Send` bounds are spelled out on the
// trait signatures themselves.
#![allow(async_fn_in_trait)]

pub mod catalog;
pub mod dimension;
pub mod engine;
pub mod error;
pub mod fact;
pub mod healthcare;
pub mod memory;
pub mod row;
pub mod store;
pub mod validate;
pub mod value;
pub mod watermark;

mod resolve;

pub use catalog::SchemaCatalog;
pub use engine::{LoadEngine, LoadPlan, RunReport};
pub use error::{Error, Result, RowError, SchemaError};
pub use row::{LoadResult, SourceRow};

#[cfg(test)]
mod tests;
