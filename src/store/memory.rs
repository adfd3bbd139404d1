//! In-process store backend.

use super::StoreBackend;
use crate::error::StoreError;
use crate::types::{Predicate, RequestRow, ResultRow, Row, TableSide};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Default)]
struct Tables {
    requests: Vec<RequestRow>,
    results: Vec<ResultRow>,
}

/// Store held entirely in memory.
///
/// Rows are kept in insertion order and never deduplicated, so a result
/// written twice for one id is returned twice. Contention and fatal failures
/// can be injected to exercise the client's retry policy.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    contention: AtomicUsize,
    failure: Mutex<Option<StoreError>>,
    closed: AtomicBool,
    selects: AtomicU64,
    inserts: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report the next `n` operations as busy.
    pub fn inject_contention(&self, n: usize) {
        self.contention.store(n, Ordering::SeqCst);
    }

    /// Fail the next operation with `err`.
    pub fn inject_failure(&self, err: StoreError) {
        *self.failure.lock() = Some(err);
    }

    /// Number of select calls that reached the tables.
    pub fn select_count(&self) -> u64 {
        self.selects.load(Ordering::SeqCst)
    }

    /// Number of rows written.
    pub fn insert_count(&self) -> u64 {
        self.inserts.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RequestRow> {
        self.tables.lock().requests.clone()
    }

    pub fn results(&self) -> Vec<ResultRow> {
        self.tables.lock().results.clone()
    }

    /// Write a result row directly, bypassing injected faults.
    pub fn push_result(&self, row: ResultRow) {
        self.tables.lock().results.push(row);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check(&self, statement: &str) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::fatal(statement, "store closed"));
        }
        if let Some(err) = self.failure.lock().take() {
            return Err(err);
        }
        let busy = self
            .contention
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if busy {
            return Err(StoreError::Contention);
        }
        Ok(())
    }

    fn append(tables: &mut Tables, row: &Row) {
        match row {
            Row::Request(r) => tables.requests.push(r.clone()),
            Row::Result(r) => tables.results.push(r.clone()),
        }
    }
}

#[async_trait]
impl StoreBackend for MemoryStore {
    async fn insert(&self, row: &Row) -> Result<(), StoreError> {
        self.check("insert")?;
        Self::append(&mut self.tables.lock(), row);
        self.inserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn insert_all(&self, rows: &[Row]) -> Result<(), StoreError> {
        self.check("insert_all")?;
        let mut tables = self.tables.lock();
        for row in rows {
            Self::append(&mut tables, row);
        }
        self.inserts.fetch_add(rows.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    async fn select(&self, predicate: &Predicate) -> Result<Vec<Row>, StoreError> {
        self.check("select")?;
        self.selects.fetch_add(1, Ordering::SeqCst);
        let tables = self.tables.lock();
        let rows = match predicate.side {
            TableSide::Requests => tables
                .requests
                .iter()
                .filter(|r| r.kind == predicate.kind)
                .filter(|r| predicate.matches_stream(&r.tag, r.rank, r.id))
                .cloned()
                .map(Row::Request)
                .collect(),
            TableSide::Results => tables
                .results
                .iter()
                .filter(|r| r.kind == predicate.kind)
                .filter(|r| predicate.matches_stream(&r.tag, r.rank, r.id))
                .cloned()
                .map(Row::Result)
                .collect(),
        };
        Ok(rows)
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IdFilter, KindTag, OperatingMode};

    fn result(kind: KindTag, rank: u32, id: u64) -> ResultRow {
        ResultRow {
            kind,
            tag: "t".into(),
            rank,
            id,
            fields: vec![id as f64],
            provenance: 0,
        }
    }

    #[tokio::test]
    async fn test_select_filters_kind_rank_and_range() {
        let store = MemoryStore::new();
        for id in 0..6 {
            store.push_result(result(KindTag::Bgk, 1, id));
        }
        store.push_result(result(KindTag::Bgk, 2, 3));
        store.push_result(result(KindTag::LbmToOneDmd, 1, 3));

        let rows = store
            .select(&Predicate::results(KindTag::Bgk, "t", 1, IdFilter::Range(2, 4)))
            .await
            .unwrap();
        let ids: Vec<u64> = rows
            .iter()
            .map(|r| match r {
                Row::Result(r) => r.id,
                Row::Request(_) => unreachable!(),
            })
            .collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_closed_store_is_fatal() {
        let store = MemoryStore::new();
        store.close().await.unwrap();
        let row = Row::Request(RequestRow {
            kind: KindTag::Bgk,
            tag: "t".into(),
            rank: 0,
            id: 0,
            fields: vec![],
            mode: OperatingMode::Kill,
        });
        assert!(matches!(
            store.insert(&row).await,
            Err(StoreError::Fatal { .. })
        ));
    }

    #[tokio::test]
    async fn test_contention_counts_down() {
        let store = MemoryStore::new();
        store.inject_contention(1);
        let p = Predicate::all_requests(KindTag::Bgk);
        assert_eq!(store.select(&p).await, Err(StoreError::Contention));
        assert!(store.select(&p).await.unwrap().is_empty());
        assert_eq!(store.select_count(), 1);
    }
}
