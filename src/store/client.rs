//! Retrying store client.

use super::StoreBackend;
use crate::config::FatalPolicy;
use crate::error::{Result, StoreError};
use crate::metrics::ExchangeMetrics;
use crate::types::{Predicate, Row};
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{error, trace};

/// Store access with the exchange's retry semantics.
///
/// Contention is retried indefinitely and never surfaced. Any other failure is
/// logged together with the offending row or predicate, then handled per the
/// configured [`FatalPolicy`].
#[derive(Clone)]
pub struct StoreClient {
    backend: Arc<dyn StoreBackend>,
    policy: FatalPolicy,
    metrics: Arc<ExchangeMetrics>,
}

impl StoreClient {
    pub fn new(
        backend: Arc<dyn StoreBackend>,
        policy: FatalPolicy,
        metrics: Arc<ExchangeMetrics>,
    ) -> Self {
        Self {
            backend,
            policy,
            metrics,
        }
    }

    /// Write one row.
    pub async fn write(&self, row: &Row) -> Result<()> {
        loop {
            match self.backend.insert(row).await {
                Ok(()) => return Ok(()),
                Err(StoreError::Contention) => self.note_contention("insert"),
                Err(err) => return self.fatal(row, err),
            }
        }
    }

    /// Write several rows as one unit.
    pub async fn write_all(&self, rows: &[Row]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        loop {
            match self.backend.insert_all(rows).await {
                Ok(()) => return Ok(()),
                Err(StoreError::Contention) => self.note_contention("insert_all"),
                Err(err) => return self.fatal(&rows[0], err),
            }
        }
    }

    /// Run `predicate` and feed every returned row to `on_row`.
    ///
    /// Returns the number of rows delivered.
    pub async fn query<F>(&self, predicate: &Predicate, mut on_row: F) -> Result<usize>
    where
        F: FnMut(Row),
    {
        let rows = loop {
            match self.backend.select(predicate).await {
                Ok(rows) => break rows,
                Err(StoreError::Contention) => self.note_contention("select"),
                Err(err) => return self.fatal(predicate, err),
            }
        };
        let count = rows.len();
        rows.into_iter().for_each(&mut on_row);
        Ok(count)
    }

    /// Close the backend.
    pub async fn close(&self) -> Result<()> {
        match self.backend.close().await {
            Ok(()) => Ok(()),
            Err(err) => self.fatal(&"close", err),
        }
    }

    fn note_contention(&self, op: &'static str) {
        self.metrics.store_retries.inc();
        trace!(op, "Store busy, retrying");
    }

    fn fatal<T, C: Debug + ?Sized>(&self, context: &C, err: StoreError) -> Result<T> {
        self.metrics.store_failures.inc();
        error!(context = ?context, error = %err, "Fatal store error");
        match self.policy {
            FatalPolicy::Abort => std::process::exit(1),
            FatalPolicy::Propagate => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::store::MemoryStore;
    use crate::types::{IdFilter, KindTag, OperatingMode, RequestRow, ResultRow};

    fn client(store: Arc<MemoryStore>) -> (StoreClient, Arc<ExchangeMetrics>) {
        let metrics = Arc::new(ExchangeMetrics::new());
        (
            StoreClient::new(store, FatalPolicy::Propagate, metrics.clone()),
            metrics,
        )
    }

    fn request(id: u64) -> Row {
        Row::Request(RequestRow {
            kind: KindTag::Bgk,
            tag: "t".into(),
            rank: 0,
            id,
            fields: vec![1.0; 9],
            mode: OperatingMode::Default,
        })
    }

    #[tokio::test]
    async fn test_write_retries_through_contention() {
        let store = Arc::new(MemoryStore::new());
        store.inject_contention(3);
        let (client, metrics) = client(store.clone());

        client.write(&request(0)).await.unwrap();

        assert_eq!(store.requests().len(), 1);
        assert_eq!(metrics.snapshot().store_retries, 3);
    }

    #[tokio::test]
    async fn test_query_retries_and_delivers_rows() {
        let store = Arc::new(MemoryStore::new());
        store.push_result(ResultRow {
            kind: KindTag::Bgk,
            tag: "t".into(),
            rank: 0,
            id: 4,
            fields: vec![0.0; 12],
            provenance: 1,
        });
        store.inject_contention(2);
        let (client, _) = client(store.clone());

        let mut seen = Vec::new();
        let count = client
            .query(
                &Predicate::results(KindTag::Bgk, "t", 0, IdFilter::Exact(4)),
                |row| seen.push(row),
            )
            .await
            .unwrap();

        assert_eq!(count, 1);
        assert_eq!(seen.len(), 1);
    }

    #[tokio::test]
    async fn test_fatal_error_propagates() {
        let store = Arc::new(MemoryStore::new());
        store.inject_failure(StoreError::fatal("INSERT", "disk full"));
        let (client, metrics) = client(store.clone());

        let err = client.write(&request(0)).await.unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::Fatal { .. })));
        assert_eq!(metrics.snapshot().store_failures, 1);
        assert!(store.requests().is_empty());
    }
}
