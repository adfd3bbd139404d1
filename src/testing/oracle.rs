//! In-process stand-in for the oracle service.

use crate::error::StoreError;
use crate::store::StoreBackend;
use crate::types::{KindTag, OperatingMode, Predicate, RequestRow, ResultRow, Row};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Oracle behaviour knobs.
#[derive(Debug, Clone)]
pub struct OracleOptions {
    /// Pause between scans of the request tables.
    pub interval: Duration,

    /// Kinds whose request tables are scanned.
    pub kinds: Vec<KindTag>,

    /// Write every result twice, the second copy with perturbed values.
    pub duplicate_results: bool,
}

impl Default for OracleOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_micros(200),
            kinds: KindTag::ALL.to_vec(),
            duplicate_results: false,
        }
    }
}

impl OracleOptions {
    pub fn with_duplicates(mut self) -> Self {
        self.duplicate_results = true;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// What the oracle did before it stopped.
#[derive(Debug, Clone, Default)]
pub struct OracleReport {
    /// Requests answered.
    pub answered: usize,

    /// A kill-switch request was observed.
    pub killed: bool,
}

/// Answers request rows found in a store with deterministic results.
///
/// Result field `j` is the request's first field plus `j`, and provenance is
/// the request mode, with `Default` resolved to `Analytic`. The oracle exits
/// after the scan in which it sees a kill-switch request.
pub struct MockOracle {
    handle: JoinHandle<OracleReport>,
    stop: watch::Sender<bool>,
}

impl MockOracle {
    pub fn spawn(backend: Arc<dyn StoreBackend>) -> Self {
        Self::spawn_with(backend, OracleOptions::default())
    }

    pub fn spawn_with(backend: Arc<dyn StoreBackend>, options: OracleOptions) -> Self {
        let (stop, stopped) = watch::channel(false);
        let handle = tokio::spawn(run(backend, options, stopped));
        Self { handle, stop }
    }

    /// Wait until the oracle has processed a kill-switch request.
    pub async fn join(self) -> OracleReport {
        self.handle.await.unwrap_or_default()
    }

    /// Stop scanning and return the report.
    pub async fn stop(self) -> OracleReport {
        let _ = self.stop.send(true);
        self.join().await
    }
}

/// Deterministic result fields for a request of `kind`.
pub fn oracle_answer(kind: KindTag, fields: &[f64]) -> Vec<f64> {
    let base = fields.first().copied().unwrap_or_default();
    (0..kind.schema().result_width())
        .map(|j| base + j as f64)
        .collect()
}

/// Provenance the oracle reports for a request made in `mode`.
pub fn oracle_provenance(mode: OperatingMode) -> OperatingMode {
    match mode {
        OperatingMode::Default => OperatingMode::Analytic,
        other => other,
    }
}

type RequestKey = (KindTag, String, u32, u64);

async fn run(
    backend: Arc<dyn StoreBackend>,
    options: OracleOptions,
    mut stopped: watch::Receiver<bool>,
) -> OracleReport {
    let mut answered: HashSet<RequestKey> = HashSet::new();
    let mut report = OracleReport::default();

    info!(kinds = ?options.kinds, "Oracle started");
    loop {
        for &kind in &options.kinds {
            let rows = match backend.select(&Predicate::all_requests(kind)).await {
                Ok(rows) => rows,
                Err(StoreError::Contention) => continue,
                Err(err) => {
                    warn!(error = %err, "Oracle scan failed");
                    return report;
                }
            };

            for row in rows {
                let Row::Request(request) = row else { continue };
                let key = (request.kind, request.tag.clone(), request.rank, request.id);
                if answered.contains(&key) {
                    continue;
                }
                if request.mode.is_kill() {
                    report.killed = true;
                    answered.insert(key);
                    continue;
                }
                if answer(backend.as_ref(), &request, options.duplicate_results).await {
                    answered.insert(key);
                    report.answered += 1;
                }
            }
        }

        if report.killed {
            info!(answered = report.answered, "Oracle received kill-switch request");
            return report;
        }

        tokio::select! {
            _ = tokio::time::sleep(options.interval) => {}
            _ = stopped.changed() => {
                debug!(answered = report.answered, "Oracle stopped");
                return report;
            }
        }
    }
}

async fn answer(backend: &dyn StoreBackend, request: &RequestRow, duplicate: bool) -> bool {
    let fields = oracle_answer(request.kind, &request.fields);
    let result = ResultRow {
        kind: request.kind,
        tag: request.tag.clone(),
        rank: request.rank,
        id: request.id,
        fields: fields.clone(),
        provenance: oracle_provenance(request.mode).code(),
    };

    let mut rows = vec![Row::Result(result.clone())];
    if duplicate {
        rows.push(Row::Result(ResultRow {
            fields: fields.iter().map(|f| f + 1000.0).collect(),
            ..result
        }));
    }
    backend.insert_all(&rows).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn request(id: u64, mode: OperatingMode) -> Row {
        Row::Request(RequestRow {
            kind: KindTag::LbmToOneDmd,
            tag: "o".into(),
            rank: 0,
            id,
            fields: vec![id as f64 * 10.0, 0.0, 0.0],
            mode,
        })
    }

    #[test]
    fn test_answer_shape() {
        assert_eq!(oracle_answer(KindTag::LbmToOneDmd, &[4.0, 1.0, 1.0]), vec![4.0]);
        let bgk = oracle_answer(KindTag::Bgk, &[2.0; 9]);
        assert_eq!(bgk.len(), 12);
        assert_eq!(bgk[11], 13.0);
        assert_eq!(oracle_provenance(OperatingMode::Default), OperatingMode::Analytic);
        assert_eq!(oracle_provenance(OperatingMode::FastFgs), OperatingMode::FastFgs);
    }

    #[tokio::test]
    async fn test_answers_each_request_once_and_stops_on_kill() {
        let store = Arc::new(MemoryStore::new());
        store.insert(&request(0, OperatingMode::Fgs)).await.unwrap();
        store.insert(&request(1, OperatingMode::Default)).await.unwrap();
        let oracle = MockOracle::spawn(store.clone());

        tokio::time::sleep(Duration::from_millis(5)).await;
        store.insert(&request(2, OperatingMode::Kill)).await.unwrap();
        let report = oracle.join().await;

        assert!(report.killed);
        assert_eq!(report.answered, 2);
        let results = store.results();
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .any(|r| r.id == 1 && r.provenance == OperatingMode::Analytic.code()));
    }
}
