//! Shared store used as the request/response exchange.
//!
//! The store itself is an external collaborator: the oracle reads request rows
//! from it and writes result rows back. This module holds the backend seam
//! ([`StoreBackend`]), the retrying client every protocol goes through
//! ([`StoreClient`]), and two backends: an in-process [`MemoryStore`] and a
//! SQLite-backed [`SqliteStore`].

mod client;
mod memory;
mod sqlite;

pub use client::StoreClient;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::StoreError;
use crate::types::{Predicate, Row};
use async_trait::async_trait;

/// Raw access to a store engine.
///
/// Implementations report busy/locked conditions as
/// [`StoreError::Contention`] and everything else as [`StoreError::Fatal`];
/// retrying is the client's job.
#[async_trait]
pub trait StoreBackend: Send + Sync + 'static {
    /// Append one row.
    async fn insert(&self, row: &Row) -> Result<(), StoreError>;

    /// Append several rows. Either all rows are written or none are.
    async fn insert_all(&self, rows: &[Row]) -> Result<(), StoreError> {
        for row in rows {
            self.insert(row).await?;
        }
        Ok(())
    }

    /// Return every row matching `predicate`.
    async fn select(&self, predicate: &Predicate) -> Result<Vec<Row>, StoreError>;

    /// Release the underlying handle. Later operations fail.
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
