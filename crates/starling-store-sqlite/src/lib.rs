//! SQLite backend for the Starling warehouse.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. One physical table per catalog table,
//! plus bookkeeping tables for watermarks, surrogate sequences and dead
//! letters.

mod encode;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use schema::render_ddl;
pub use store::SqliteStore;
