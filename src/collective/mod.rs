//! Collective requests brokered by one rank of a group.
//!
//! Every rank calls [`GlueSession::collective_request`] with its own requests.
//! Rank 0 (the broker) is the only rank holding a store connection: it writes
//! its own requests, receives every other rank's requests in chunks of at most
//! `chunk_capacity`, forwards them to the store under the sender's rank, waits
//! for the results and sends them back chunk by chunk.
//!
//! ```text
//!  worker r                         broker (rank 0)                 store
//!  ─────────                        ───────────────                 ─────
//!  count ───── gather_counts ─────▶ counts[r]
//!  chunk k (tag n-k) ─────────────▶ write rows (rank r ids) ──────▶ REQS
//!                                   resolve ids ◀───────────────── RESULTS
//!  results k (tag n-k) ◀────────── send
//! ```
//!
//! If the broker's round fails, every worker still waiting for results gets
//! the failure on [`ABORT_TAG`]: a broker deadline surfaces as
//! [`Error::Timeout`], anything else as [`ProtocolError::BrokerAborted`].

mod chunk;

pub use chunk::{Chunk, ChunkPlan};

use crate::config::{CollectiveConfig, GlueConfig};
use crate::error::{Error, ProtocolError, Result};
use crate::exchange::Exchange;
use crate::group::wire::{decode_values, encode_values};
use crate::group::{Communicator, Transfer, ABORT_TAG};
use crate::kinds::{Bgk, Kind, KindRegistry};
use crate::metrics::ExchangeMetrics;
use crate::store::{SqliteStore, StoreBackend};
use crate::types::{Rank, RequestId, ResultRow, WireTag};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Rank that talks to the store.
pub const BROKER_RANK: Rank = 0;

/// One rank's handle on a collective exchange.
pub struct GlueSession<C> {
    comm: C,
    exchange: Option<Exchange>,
    collective: CollectiveConfig,
    metrics: Arc<ExchangeMetrics>,
}

impl<C: Communicator> GlueSession<C> {
    /// Join the exchange. The broker opens the SQLite store at
    /// `config.store.path`, creating tables if configured to.
    pub async fn connect(config: &GlueConfig, comm: C) -> Result<Self> {
        config.validate()?;
        let kinds = KindRegistry::with_all_kinds();
        let backend: Option<Arc<dyn StoreBackend>> = if comm.rank() == BROKER_RANK {
            let store = SqliteStore::open(&config.store).await?;
            if config.store.create_schema {
                store.init_schema(kinds.schemas()).await?;
            }
            Some(Arc::new(store))
        } else {
            None
        };
        Self::assemble(config, comm, backend, kinds)
    }

    /// Join the exchange using `backend` on the broker. Other ranks drop it.
    pub async fn connect_with(
        config: &GlueConfig,
        comm: C,
        backend: Arc<dyn StoreBackend>,
    ) -> Result<Self> {
        config.validate()?;
        let backend = (comm.rank() == BROKER_RANK).then_some(backend);
        Self::assemble(config, comm, backend, KindRegistry::with_all_kinds())
    }

    fn assemble(
        config: &GlueConfig,
        comm: C,
        backend: Option<Arc<dyn StoreBackend>>,
        kinds: KindRegistry,
    ) -> Result<Self> {
        let exchange = backend.map(|b| Exchange::with_kinds(b, config, kinds));
        let metrics = exchange
            .as_ref()
            .map_or_else(|| Arc::new(ExchangeMetrics::new()), |e| e.metrics().clone());
        info!(
            rank = comm.rank(),
            size = comm.size(),
            broker = exchange.is_some(),
            "Joined collective exchange"
        );
        Ok(Self {
            comm,
            exchange,
            collective: config.collective.clone(),
            metrics,
        })
    }

    pub fn rank(&self) -> Rank {
        self.comm.rank()
    }

    pub fn is_broker(&self) -> bool {
        self.comm.rank() == BROKER_RANK
    }

    /// The store exchange, held only by the broker.
    pub fn exchange(&self) -> Option<&Exchange> {
        self.exchange.as_ref()
    }

    pub fn metrics(&self) -> &Arc<ExchangeMetrics> {
        &self.metrics
    }

    pub fn communicator(&self) -> &C {
        &self.comm
    }

    /// Submit this rank's requests as part of a group-wide call.
    ///
    /// Must be called by every rank of the group. Returns one response per
    /// request, aligned with `requests`. After a failed round, transfers from
    /// that round may still be queued, so the group should not be reused.
    pub async fn collective_request<K: Kind>(
        &self,
        requests: &[K::Request],
    ) -> Result<Vec<K::Response>> {
        let plan = ChunkPlan::new(requests.len(), self.collective.chunk_capacity)?;
        let counts = self
            .comm
            .gather_counts(BROKER_RANK, requests.len() as u64)
            .await?;

        match counts {
            Some(counts) => {
                let mut round = BrokerRound::new(self.rank(), &counts);
                let outcome = self.broker_round::<K>(requests, &counts, &mut round).await;
                if let Err(err) = &outcome {
                    self.metrics.record_abandoned(round.unresolved);
                    self.abort_round(&round, err).await;
                }
                outcome
            }
            None => self.worker_round::<K>(requests, plan).await,
        }
    }

    /// Pass the broker's failure to every worker still waiting on results.
    async fn abort_round(&self, round: &BrokerRound, err: &Error) {
        warn!(
            rank = self.rank(),
            waiting = round.waiting.len(),
            error = %err,
            "Collective round failed"
        );
        let payload = match bincode::serialize(&RoundAbort::from_error(err)) {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                warn!(error = %e, "Cannot encode round abort");
                return;
            }
        };
        for &peer in &round.waiting {
            if let Err(e) = self.comm.send(peer, ABORT_TAG, payload.clone()).await {
                warn!(peer, error = %e, "Cannot notify worker of failed round");
            }
        }
    }

    async fn broker_round<K: Kind>(
        &self,
        requests: &[K::Request],
        counts: &[u64],
        round: &mut BrokerRound,
    ) -> Result<Vec<K::Response>> {
        let rank = self.rank();
        let exchange = self
            .exchange
            .as_ref()
            .ok_or(ProtocolError::MissingStore(rank))?;
        let capacity = self.collective.chunk_capacity;
        let tag = self.collective.tag.as_str();
        let mode = self.collective.mode;
        let width = K::schema().request_width();
        let _timer = self.metrics.request_latency.start_timer();

        let own = requests.iter().map(K::request_fields).collect();
        let own_ids = exchange.submit_for_rank(K::TAG, rank, tag, mode, own).await?;
        round.unresolved += own_ids.len() as u64;

        let mut forwarded: Vec<(Rank, WireTag, Vec<RequestId>)> = Vec::new();
        for (peer, &count) in counts.iter().enumerate() {
            let peer = peer as Rank;
            if peer == rank {
                continue;
            }
            let plan = ChunkPlan::new(count as usize, capacity)?;
            let mut found = 0;
            for chunk in plan.chunks() {
                let payload = self.comm.recv(peer, chunk.tag).await?;
                let values = decode_values(payload, width, capacity)?;
                self.metrics.chunks_received.inc();
                let fields: Vec<Vec<f64>> = values.chunks_exact(width).map(<[f64]>::to_vec).collect();
                found += fields.len();
                let ids = exchange.submit_for_rank(K::TAG, peer, tag, mode, fields).await?;
                round.unresolved += ids.len() as u64;
                debug!(peer, wire_tag = chunk.tag, count = ids.len(), "Forwarded chunk");
                forwarded.push((peer, chunk.tag, ids));
            }
            if found != count as usize {
                return Err(ProtocolError::ChunkAccounting {
                    rank: peer,
                    expected: count as usize,
                    found,
                }
                .into());
            }
        }

        let reconciler = exchange.reconciler();
        for (peer, wire_tag, ids) in forwarded {
            let rows = reconciler.resolve(K::TAG, peer, tag, &ids).await?;
            round.answered(exchange.metrics(), rows.len());
            let payload = encode_results::<K>(&rows)?;
            self.comm.send(peer, wire_tag, payload).await?;
            self.metrics.chunks_sent.inc();
            // Tag 1 is a rank's last chunk.
            if wire_tag == 1 {
                round.waiting.remove(&peer);
            }
        }

        let rows = reconciler.resolve(K::TAG, rank, tag, &own_ids).await?;
        round.answered(exchange.metrics(), rows.len());
        debug!(rank, count = rows.len(), "Collective round complete");
        rows.iter()
            .map(|row| K::decode_response(row).map_err(Into::into))
            .collect()
    }

    async fn worker_round<K: Kind>(
        &self,
        requests: &[K::Request],
        plan: ChunkPlan,
    ) -> Result<Vec<K::Response>> {
        let rank = self.rank();
        if plan.count() == 0 {
            return Ok(Vec::new());
        }
        let capacity = plan.capacity();
        let result_width = K::schema().result_width() + 1;
        let abort = self.comm.irecv(BROKER_RANK, ABORT_TAG);

        let sends: Vec<Transfer<()>> = plan
            .chunks()
            .map(|chunk| {
                let values: Vec<f64> = requests[chunk.range()]
                    .iter()
                    .flat_map(K::request_fields)
                    .collect();
                self.comm.isend(BROKER_RANK, chunk.tag, encode_values(&values))
            })
            .collect();
        Transfer::wait_all(sends).await?;
        self.metrics.chunks_sent.inc_by(plan.count() as u64);
        debug!(rank, chunks = plan.count(), "Requests sent to broker");

        let chunks: Vec<Chunk> = plan.chunks().collect();
        let recvs: Vec<Transfer<Bytes>> = chunks
            .iter()
            .map(|chunk| self.comm.irecv(BROKER_RANK, chunk.tag))
            .collect();
        let payloads = tokio::select! {
            payloads = Transfer::wait_all(recvs) => payloads?,
            notice = abort.wait() => return Err(RoundAbort::decode(notice?)),
        };
        self.metrics.chunks_received.inc_by(payloads.len() as u64);

        let mut responses = Vec::with_capacity(requests.len());
        for (chunk, payload) in chunks.iter().zip(payloads) {
            let values = decode_values(payload, result_width, capacity)?;
            let records = values.chunks_exact(result_width);
            if records.len() != chunk.len {
                return Err(ProtocolError::ChunkAccounting {
                    rank,
                    expected: chunk.len,
                    found: records.len(),
                }
                .into());
            }
            for record in records {
                responses.push(decode_result::<K>(rank, &self.collective.tag, record)?);
            }
        }
        Ok(responses)
    }

    /// Leave the exchange. The broker sends one kill-switch request and closes
    /// the store.
    pub async fn close(self) -> Result<()> {
        self.close_service::<Bgk>().await
    }

    /// As [`close`](Self::close), addressing the kill-switch to kind `K`.
    pub async fn close_service<K: Kind>(self) -> Result<()> {
        if let Some(exchange) = &self.exchange {
            exchange
                .stop_service::<K>(self.rank(), &self.collective.tag)
                .await?;
            exchange.store().close().await?;
            info!(rank = self.rank(), "Closed collective exchange");
        }
        Ok(())
    }
}

/// Broker bookkeeping kept outside the round so a failure can be reported.
struct BrokerRound {
    /// Workers that have not yet received their last chunk.
    waiting: BTreeSet<Rank>,
    /// Requests written this round and not yet resolved.
    unresolved: u64,
}

impl BrokerRound {
    fn new(broker: Rank, counts: &[u64]) -> Self {
        let waiting = counts
            .iter()
            .enumerate()
            .filter(|&(peer, &count)| peer as Rank != broker && count > 0)
            .map(|(peer, _)| peer as Rank)
            .collect();
        Self {
            waiting,
            unresolved: 0,
        }
    }

    fn answered(&mut self, metrics: &ExchangeMetrics, count: usize) {
        metrics.record_answered(count as u64);
        self.unresolved = self.unresolved.saturating_sub(count as u64);
    }
}

/// Failure of a collective round as sent to waiting workers.
#[derive(Debug, Serialize, Deserialize)]
enum RoundAbort {
    Timeout {
        rank: Rank,
        first_id: RequestId,
        outstanding: usize,
    },
    Failed(String),
}

impl RoundAbort {
    fn from_error(err: &Error) -> Self {
        match err {
            Error::Timeout {
                rank,
                first_id,
                outstanding,
            } => Self::Timeout {
                rank: *rank,
                first_id: *first_id,
                outstanding: *outstanding,
            },
            other => Self::Failed(other.to_string()),
        }
    }

    fn decode(payload: Bytes) -> Error {
        match bincode::deserialize::<RoundAbort>(&payload) {
            Ok(Self::Timeout {
                rank,
                first_id,
                outstanding,
            }) => Error::Timeout {
                rank,
                first_id,
                outstanding,
            },
            Ok(Self::Failed(reason)) => ProtocolError::BrokerAborted(reason).into(),
            Err(e) => e.into(),
        }
    }
}

/// Pack result rows as `fields..., provenance` records.
fn encode_results<K: Kind>(rows: &[ResultRow]) -> Result<Bytes> {
    let width = K::schema().result_width();
    let mut values = Vec::with_capacity(rows.len() * (width + 1));
    for row in rows {
        if row.fields.len() != width {
            return Err(ProtocolError::FieldCount {
                expected: width,
                found: row.fields.len(),
            }
            .into());
        }
        values.extend_from_slice(&row.fields);
        values.push(row.provenance as f64);
    }
    Ok(encode_values(&values))
}

fn decode_result<K: Kind>(rank: Rank, tag: &str, record: &[f64]) -> Result<K::Response> {
    let (fields, provenance) = record.split_at(record.len() - 1);
    let row = ResultRow {
        kind: K::TAG,
        tag: tag.to_string(),
        rank,
        id: 0,
        fields: fields.to_vec(),
        provenance: provenance[0] as i64,
    };
    Ok(K::decode_response(&row)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FatalPolicy, PollConfig};
    use crate::error::Error;
    use crate::group::LocalGroup;
    use crate::kinds::{LbmRequest, LbmToOneDmd};
    use crate::error::StoreError;
    use crate::store::MemoryStore;
    use crate::testing::MockOracle;
    use crate::types::{KindTag, OperatingMode};
    use std::time::Duration;

    fn config(capacity: usize) -> GlueConfig {
        GlueConfig::default()
            .with_chunk_capacity(capacity)
            .with_fatal_policy(FatalPolicy::Propagate)
            .with_poll_config(
                PollConfig::default()
                    .with_backoff(Duration::from_micros(50), Duration::from_millis(2))
                    .with_deadline(Duration::from_secs(20)),
            )
    }

    fn lbm(rank: Rank, i: usize) -> LbmRequest {
        LbmRequest {
            distance: f64::from(rank) * 100_000.0 + i as f64,
            density: 1.0,
            temperature: 2.0,
        }
    }

    #[test]
    fn test_result_records_carry_provenance() {
        let row = ResultRow {
            kind: KindTag::LbmToOneDmd,
            tag: "TAG".into(),
            rank: 1,
            id: 9,
            fields: vec![0.25],
            provenance: OperatingMode::Mystic.code(),
        };
        let payload = encode_results::<LbmToOneDmd>(&[row]).unwrap();
        let values = decode_values(payload, 2, 1).unwrap();
        let response = decode_result::<LbmToOneDmd>(1, "TAG", &values).unwrap();
        assert_eq!(response.adsorption, 0.25);
        assert_eq!(response.provenance, OperatingMode::Mystic);
    }

    #[tokio::test]
    async fn test_two_rank_round_with_small_chunks() {
        let store = Arc::new(MemoryStore::new());
        let oracle = MockOracle::spawn(store.clone());
        let config = config(4);

        let handles: Vec<_> = LocalGroup::new(2)
            .into_iter()
            .map(|comm| {
                let config = config.clone();
                let store = store.clone();
                tokio::spawn(async move {
                    let session = GlueSession::connect_with(&config, comm, store).await.unwrap();
                    let rank = session.rank();
                    let requests: Vec<LbmRequest> = (0..10).map(|i| lbm(rank, i)).collect();
                    let responses = session
                        .collective_request::<LbmToOneDmd>(&requests)
                        .await
                        .unwrap();
                    (rank, requests, responses, session.metrics().snapshot())
                })
            })
            .collect();

        for handle in handles {
            let (rank, requests, responses, metrics) = handle.await.unwrap();
            assert_eq!(responses.len(), requests.len());
            for (request, response) in requests.iter().zip(&responses) {
                assert_eq!(response.adsorption, request.distance);
                assert_eq!(response.provenance, OperatingMode::Analytic);
            }
            if rank == 1 {
                assert_eq!(metrics.chunks_sent, 3);
                assert_eq!(metrics.chunks_received, 3);
            }
        }
        oracle.stop().await;
        assert_eq!(store.requests().len(), 20);
    }

    /// Run one round on every rank of a local group, bounding each rank's wait.
    async fn bounded_round(
        config: GlueConfig,
        store: Arc<MemoryStore>,
        counts: [usize; 2],
    ) -> Vec<std::result::Result<Result<Vec<crate::kinds::LbmResponse>>, tokio::time::error::Elapsed>> {
        let handles: Vec<_> = LocalGroup::new(2)
            .into_iter()
            .map(|comm| {
                let config = config.clone();
                let store = store.clone();
                tokio::spawn(async move {
                    let session = GlueSession::connect_with(&config, comm, store).await.unwrap();
                    let rank = session.rank();
                    let requests: Vec<LbmRequest> =
                        (0..counts[rank as usize]).map(|i| lbm(rank, i)).collect();
                    let outcome = tokio::time::timeout(
                        Duration::from_secs(5),
                        session.collective_request::<LbmToOneDmd>(&requests),
                    )
                    .await;
                    (outcome, session.metrics().snapshot().outstanding)
                })
            })
            .collect();

        let mut outcomes = Vec::new();
        for handle in handles {
            let (outcome, outstanding) = handle.await.unwrap();
            assert_eq!(outstanding, 0);
            outcomes.push(outcome);
        }
        outcomes
    }

    #[tokio::test]
    async fn test_broker_deadline_reaches_waiting_worker() {
        let store = Arc::new(MemoryStore::new());
        let config = config(8).with_deadline(Duration::from_millis(50));

        let mut outcomes = bounded_round(config, store.clone(), [2, 3]).await;
        let worker = outcomes.pop().unwrap().expect("worker must not hang");
        let broker = outcomes.pop().unwrap().expect("broker must not hang");

        for outcome in [broker, worker] {
            assert!(matches!(
                outcome,
                Err(Error::Timeout {
                    rank: 1,
                    first_id: 0,
                    outstanding: 3
                })
            ));
        }
        assert_eq!(store.requests().len(), 5);
    }

    #[tokio::test]
    async fn test_broker_store_failure_reaches_waiting_worker() {
        let store = Arc::new(MemoryStore::new());
        store.inject_failure(StoreError::fatal("INSERT INTO LBMTOONEDMDREQS", "disk full"));

        let mut outcomes = bounded_round(config(8), store.clone(), [2, 3]).await;
        let worker = outcomes.pop().unwrap().expect("worker must not hang");
        let broker = outcomes.pop().unwrap().expect("broker must not hang");

        assert!(matches!(broker, Err(Error::Store(StoreError::Fatal { .. }))));
        match worker {
            Err(Error::Protocol(ProtocolError::BrokerAborted(reason))) => {
                assert!(reason.contains("disk full"), "{reason}");
            }
            other => panic!("unexpected worker outcome {other:?}"),
        }
        assert!(store.requests().is_empty());
    }

    #[tokio::test]
    async fn test_worker_without_store_is_not_broker() {
        let comms = LocalGroup::new(2);
        let store: Arc<dyn StoreBackend> = Arc::new(MemoryStore::new());
        let mut sessions = Vec::new();
        for comm in comms {
            sessions.push(
                GlueSession::connect_with(&config(8), comm, store.clone())
                    .await
                    .unwrap(),
            );
        }
        assert!(sessions[0].is_broker());
        assert!(sessions[0].exchange().is_some());
        assert!(!sessions[1].is_broker());
        assert!(sessions[1].exchange().is_none());
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_config() {
        let comm = LocalGroup::new(1).remove(0);
        let store: Arc<dyn StoreBackend> = Arc::new(MemoryStore::new());
        let result = GlueSession::connect_with(&config(0), comm, store).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_close_sends_kill_switch_from_broker() {
        let store = Arc::new(MemoryStore::new());
        let comm = LocalGroup::new(1).remove(0);
        let session = GlueSession::connect_with(&config(8), comm, store.clone())
            .await
            .unwrap();
        session.close().await.unwrap();

        let written = store.requests();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].mode, OperatingMode::Kill);
        assert_eq!(written[0].tag, "TAG");
        assert!(store.is_closed());
    }

    #[tokio::test]
    async fn test_connect_opens_sqlite_on_broker() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(8);
        config.store = config
            .store
            .clone()
            .with_create_schema(true);
        config.store.path = dir.path().join("glue.db");

        let comm = LocalGroup::new(1).remove(0);
        let session = GlueSession::connect(&config, comm).await.unwrap();
        assert!(session.is_broker());
        session.close().await.unwrap();
    }
}
