//! Multi-rank harness for collective requests.

use super::oracle::{MockOracle, OracleOptions, OracleReport};
use crate::collective::GlueSession;
use crate::config::GlueConfig;
use crate::error::{Error, Result};
use crate::group::{Communicator, LocalGroup, TcpGroup};
use crate::kinds::Kind;
use crate::metrics::MetricsSnapshot;
use crate::store::{MemoryStore, StoreBackend};
use crate::types::Rank;
use std::sync::Arc;
use tracing::debug;

/// What one rank submitted and got back in one round.
#[derive(Debug, Clone)]
pub struct RankOutcome<K: Kind> {
    pub rank: Rank,
    pub round: usize,
    pub requests: Vec<K::Request>,
    pub responses: Vec<K::Response>,
}

/// Everything a rank produced over a run.
#[derive(Debug, Clone)]
pub struct RankReport<K: Kind> {
    pub rank: Rank,
    pub rounds: Vec<RankOutcome<K>>,
    pub metrics: MetricsSnapshot,
}

/// A group of ranks sharing one in-memory store answered by a [`MockOracle`].
pub struct TestCluster {
    size: usize,
    config: GlueConfig,
    store: Arc<MemoryStore>,
    oracle: MockOracle,
}

impl TestCluster {
    pub fn new(size: usize, config: GlueConfig) -> Self {
        Self::with_oracle(size, config, OracleOptions::default())
    }

    /// A cluster whose oracle runs with `options`.
    pub fn with_oracle(size: usize, config: GlueConfig, options: OracleOptions) -> Self {
        let store = Arc::new(MemoryStore::new());
        let oracle = MockOracle::spawn_with(store.clone(), options);
        Self {
            size,
            config,
            store,
            oracle,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// One collective round over in-process endpoints.
    pub async fn run<K, F>(&self, requests_for: F) -> Result<Vec<RankReport<K>>>
    where
        K: Kind,
        F: Fn(Rank, usize) -> Vec<K::Request>,
    {
        self.run_rounds::<K, F>(1, requests_for).await
    }

    /// `rounds` consecutive collective rounds over in-process endpoints.
    pub async fn run_rounds<K, F>(&self, rounds: usize, requests_for: F) -> Result<Vec<RankReport<K>>>
    where
        K: Kind,
        F: Fn(Rank, usize) -> Vec<K::Request>,
    {
        run_sessions::<K, _, F>(LocalGroup::new(self.size), &self.config, self.store.clone(), rounds, &requests_for)
            .await
    }

    /// `rounds` collective rounds over loopback TCP.
    pub async fn run_tcp<K, F>(&self, rounds: usize, requests_for: F) -> Result<Vec<RankReport<K>>>
    where
        K: Kind,
        F: Fn(Rank, usize) -> Vec<K::Request>,
    {
        let group = TcpGroup::bind(([127, 0, 0, 1], 0).into(), self.size).await?;
        let addr = group.local_addr()?;
        let size = self.size;
        let workers: Vec<_> = (1..size as Rank)
            .map(|rank| tokio::spawn(TcpGroup::connect(addr, rank, size)))
            .collect();

        let mut comms = vec![group.accept().await?];
        for worker in workers {
            comms.push(worker.await.map_err(|e| Error::Internal(e.to_string()))??);
        }
        run_sessions::<K, _, F>(comms, &self.config, self.store.clone(), rounds, &requests_for).await
    }

    /// Stop the oracle.
    pub async fn shutdown(self) -> OracleReport {
        self.oracle.stop().await
    }
}

async fn run_sessions<K, C, F>(
    comms: Vec<C>,
    config: &GlueConfig,
    store: Arc<MemoryStore>,
    rounds: usize,
    requests_for: &F,
) -> Result<Vec<RankReport<K>>>
where
    K: Kind,
    C: Communicator,
    F: Fn(Rank, usize) -> Vec<K::Request>,
{
    let handles: Vec<_> = comms
        .into_iter()
        .map(|comm| {
            let rank = comm.rank();
            let plan: Vec<Vec<K::Request>> = (0..rounds).map(|round| requests_for(rank, round)).collect();
            let config = config.clone();
            let backend: Arc<dyn StoreBackend> = store.clone();
            tokio::spawn(async move {
                let session = GlueSession::connect_with(&config, comm, backend).await?;
                let mut outcomes = Vec::with_capacity(plan.len());
                for (round, requests) in plan.into_iter().enumerate() {
                    let responses = session.collective_request::<K>(&requests).await?;
                    debug!(rank, round, count = responses.len(), "Rank finished round");
                    outcomes.push(RankOutcome {
                        rank,
                        round,
                        requests,
                        responses,
                    });
                }
                Ok::<_, Error>(RankReport {
                    rank,
                    rounds: outcomes,
                    metrics: session.metrics().snapshot(),
                })
            })
        })
        .collect();

    let mut reports = Vec::with_capacity(handles.len());
    for handle in handles {
        reports.push(handle.await.map_err(|e| Error::Internal(e.to_string()))??);
    }
    Ok(reports)
}
