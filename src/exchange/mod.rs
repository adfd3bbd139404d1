//! Request submission and result polling against the shared store.
//!
//! [`Exchange`] owns everything one process needs to talk to the oracle: the
//! retrying [`StoreClient`], the id allocator, the kind registry with its
//! result tables, and the polling policy. It implements the single-request and
//! batch-request protocols directly; the collective broker builds on
//! [`Exchange::submit_for_rank`] and the [`Reconciler`].

mod ids;
mod poll;
mod reconcile;
mod table;

pub use ids::{IdScope, RequestIdAllocator};
pub use poll::{DeadlineExpired, Poller};
pub use reconcile::Reconciler;
pub use table::AsyncResultTable;

use crate::config::{GlueConfig, PollConfig};
use crate::error::{Error, ProtocolError, Result};
use crate::kinds::{Kind, KindBinding, KindRegistry};
use crate::metrics::ExchangeMetrics;
use crate::store::{StoreBackend, StoreClient};
use crate::types::{
    IdFilter, KindTag, OperatingMode, Predicate, Rank, RequestId, RequestRow, ResultRow, Row,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Request/response exchange over one store connection.
pub struct Exchange {
    store: StoreClient,
    ids: RequestIdAllocator,
    kinds: KindRegistry,
    poll: PollConfig,
    metrics: Arc<ExchangeMetrics>,
}

impl Exchange {
    /// Exchange serving every known request kind.
    pub fn new(backend: Arc<dyn StoreBackend>, config: &GlueConfig) -> Self {
        Self::with_kinds(backend, config, KindRegistry::with_all_kinds())
    }

    /// Exchange serving only the kinds in `kinds`.
    pub fn with_kinds(
        backend: Arc<dyn StoreBackend>,
        config: &GlueConfig,
        kinds: KindRegistry,
    ) -> Self {
        let metrics = Arc::new(ExchangeMetrics::new());
        let store = StoreClient::new(backend, config.store.fatal_policy, metrics.clone());
        Self {
            store,
            ids: RequestIdAllocator::new(),
            kinds,
            poll: config.poll.clone(),
            metrics,
        }
    }

    pub fn store(&self) -> &StoreClient {
        &self.store
    }

    pub fn kinds(&self) -> &KindRegistry {
        &self.kinds
    }

    pub fn metrics(&self) -> &Arc<ExchangeMetrics> {
        &self.metrics
    }

    pub fn reconciler(&self) -> Reconciler<'_> {
        Reconciler::new(&self.store, &self.kinds, &self.poll, &self.metrics)
    }

    /// Submit one request and wait for its result.
    ///
    /// A kill-switch request is written and `None` is returned without
    /// querying for a result.
    pub async fn request_single<K: Kind>(
        &self,
        request: &K::Request,
        rank: Rank,
        tag: &str,
        mode: OperatingMode,
    ) -> Result<Option<K::Response>> {
        let binding = self.kinds.get(K::TAG)?;
        let _timer = self.metrics.request_latency.start_timer();

        let id = self.ids.next_id(IdScope::Global);
        let row = request_row(K::TAG, tag, rank, id, K::request_fields(request), mode);
        self.store.write(&Row::Request(row)).await?;
        self.metrics.record_written(1);
        debug!(kind = K::TAG.name(), rank, tag, id, %mode, "Request written");

        if mode.is_kill() {
            self.metrics.record_answered(1);
            return Ok(None);
        }

        let row = match self.await_global(binding, K::TAG, rank, tag, id).await {
            Ok(row) => row,
            Err(err) => {
                self.metrics.record_abandoned(1);
                return Err(err);
            }
        };
        Ok(Some(K::decode_response(&row)?))
    }

    /// [`request_single`](Self::request_single) with the default mode.
    pub async fn request_single_default<K: Kind>(
        &self,
        request: &K::Request,
        rank: Rank,
        tag: &str,
    ) -> Result<Option<K::Response>> {
        self.request_single::<K>(request, rank, tag, OperatingMode::Default)
            .await
    }

    /// Submit several requests and wait for all results.
    ///
    /// Results are returned in ascending request id order. Kill-switch mode is
    /// rejected before anything is written.
    pub async fn request_batch<K: Kind>(
        &self,
        requests: &[K::Request],
        rank: Rank,
        tag: &str,
        mode: OperatingMode,
    ) -> Result<Vec<K::Response>> {
        if mode.is_kill() {
            return Err(ProtocolError::KillInBatch.into());
        }
        let binding = self.kinds.get(K::TAG)?;
        let _timer = self.metrics.request_latency.start_timer();

        let ids = self.ids.next_ids(IdScope::Global, requests.len());
        let rows: Vec<Row> = requests
            .iter()
            .zip(&ids)
            .map(|(request, &id)| {
                Row::Request(request_row(K::TAG, tag, rank, id, K::request_fields(request), mode))
            })
            .collect();
        self.store.write_all(&rows).await?;
        self.metrics.record_written(rows.len() as u64);
        debug!(kind = K::TAG.name(), rank, tag, count = ids.len(), %mode, "Batch written");

        let pending: BTreeSet<RequestId> = ids.into_iter().collect();
        let mut responses = Vec::with_capacity(pending.len());
        for (resolved, &id) in pending.iter().enumerate() {
            let row = match self.await_global(binding, K::TAG, rank, tag, id).await {
                Ok(row) => row,
                Err(err) => {
                    self.metrics
                        .record_abandoned((pending.len() - resolved) as u64);
                    return Err(err);
                }
            };
            responses.push(K::decode_response(&row)?);
        }
        Ok(responses)
    }

    /// Ask the oracle serving `K` to shut down.
    pub async fn stop_service<K: Kind>(&self, rank: Rank, tag: &str) -> Result<()> {
        info!(kind = K::TAG.name(), rank, tag, "Sending kill-switch request");
        self.request_single::<K>(&K::kill_request(), rank, tag, OperatingMode::Kill)
            .await
            .map(|_| ())
    }

    /// Write request rows on behalf of `rank` using that rank's id counter.
    ///
    /// Returns the ids in the order of `payloads`.
    pub async fn submit_for_rank(
        &self,
        kind: KindTag,
        rank: Rank,
        tag: &str,
        mode: OperatingMode,
        payloads: Vec<Vec<f64>>,
    ) -> Result<Vec<RequestId>> {
        let schema = self.kinds.get(kind)?.schema();
        if let Some(bad) = payloads.iter().find(|p| p.len() != schema.request_width()) {
            return Err(ProtocolError::FieldCount {
                expected: schema.request_width(),
                found: bad.len(),
            }
            .into());
        }

        let ids = self.ids.next_ids(IdScope::Rank(rank), payloads.len());
        let rows: Vec<Row> = payloads
            .into_iter()
            .zip(&ids)
            .map(|(fields, &id)| Row::Request(request_row(kind, tag, rank, id, fields, mode)))
            .collect();
        self.store.write_all(&rows).await?;
        self.metrics.record_written(rows.len() as u64);
        trace!(kind = kind.name(), rank, count = ids.len(), "Forwarded requests for rank");
        Ok(ids)
    }

    async fn await_global(
        &self,
        binding: &KindBinding,
        kind: KindTag,
        rank: Rank,
        tag: &str,
        id: RequestId,
    ) -> Result<ResultRow> {
        let table = binding.global_table();
        let predicate = Predicate::results(kind, tag, rank, IdFilter::Exact(id));
        let mut poller = Poller::new(&self.poll);

        loop {
            self.metrics.poll_rounds.inc();
            self.store
                .query(&predicate, |row| {
                    if let Row::Result(row) = row {
                        let inserted = table.insert_if_absent(row.id, row);
                        self.metrics.record_observation(inserted);
                    }
                })
                .await?;

            if let Some(row) = table.remove(id) {
                self.metrics.record_answered(1);
                trace!(rank, id, rounds = poller.rounds(), "Result observed");
                return Ok(row);
            }

            if poller.pause().await.is_err() {
                self.metrics.timeouts.inc();
                warn!(kind = kind.name(), rank, tag, id, "Deadline expired waiting for result");
                return Err(Error::Timeout {
                    rank,
                    first_id: id,
                    outstanding: 1,
                });
            }
        }
    }
}

fn request_row(
    kind: KindTag,
    tag: &str,
    rank: Rank,
    id: RequestId,
    fields: Vec<f64>,
    mode: OperatingMode,
) -> RequestRow {
    RequestRow {
        kind,
        tag: tag.to_string(),
        rank,
        id,
        fields,
        mode,
    }
}
