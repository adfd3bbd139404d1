//! Matching of result rows back to the requests of one rank.

use super::poll::Poller;
use crate::config::PollConfig;
use crate::error::{Error, ProtocolError, Result};
use crate::kinds::KindRegistry;
use crate::metrics::ExchangeMetrics;
use crate::store::StoreClient;
use crate::types::{IdFilter, KindTag, Predicate, Rank, RequestId, ResultRow, Row};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, trace, warn};

/// Resolves a set of per-rank request ids into result rows.
///
/// Each round queries the inclusive range between the smallest and largest
/// outstanding id, so the range shrinks as results arrive. Rows for ids that
/// are not outstanding are ignored.
pub struct Reconciler<'a> {
    store: &'a StoreClient,
    kinds: &'a KindRegistry,
    poll: &'a PollConfig,
    metrics: &'a ExchangeMetrics,
}

impl<'a> Reconciler<'a> {
    pub(crate) fn new(
        store: &'a StoreClient,
        kinds: &'a KindRegistry,
        poll: &'a PollConfig,
        metrics: &'a ExchangeMetrics,
    ) -> Self {
        Self {
            store,
            kinds,
            poll,
            metrics,
        }
    }

    /// Wait for a result for every id and return them aligned with `ids`.
    ///
    /// `ids` must be distinct.
    pub async fn resolve(
        &self,
        kind: KindTag,
        rank: Rank,
        tag: &str,
        ids: &[RequestId],
    ) -> Result<Vec<ResultRow>> {
        let table = self.kinds.get(kind)?.rank_table(rank);
        let positions: HashMap<RequestId, usize> =
            ids.iter().enumerate().map(|(pos, &id)| (id, pos)).collect();
        let mut outstanding: BTreeSet<RequestId> = ids.iter().copied().collect();
        let mut slots: Vec<Option<ResultRow>> = vec![None; ids.len()];
        let mut poller = Poller::new(self.poll);

        debug!(rank, tag, kind = kind.name(), count = ids.len(), "Reconciling results");

        loop {
            let (Some(&lo), Some(&hi)) = (outstanding.first(), outstanding.last()) else {
                break;
            };
            self.metrics.poll_rounds.inc();
            let predicate = Predicate::results(kind, tag, rank, IdFilter::Range(lo, hi));
            let mut observed = Vec::new();
            self.store
                .query(&predicate, |row| {
                    let Row::Result(row) = row else { return };
                    if !outstanding.contains(&row.id) {
                        return;
                    }
                    let id = row.id;
                    let inserted = table.insert_if_absent(id, row);
                    self.metrics.record_observation(inserted);
                    if inserted {
                        observed.push(id);
                    }
                })
                .await?;

            for id in observed {
                if let (Some(row), Some(&pos)) = (table.remove(id), positions.get(&id)) {
                    slots[pos] = Some(row);
                    outstanding.remove(&id);
                }
            }

            if outstanding.is_empty() {
                break;
            }
            trace!(rank, remaining = outstanding.len(), "Results outstanding");
            if poller.pause().await.is_err() {
                self.metrics.timeouts.inc();
                warn!(
                    rank,
                    first_id = lo,
                    outstanding = outstanding.len(),
                    "Reconcile deadline expired"
                );
                return Err(Error::Timeout {
                    rank,
                    first_id: outstanding.first().copied().unwrap_or(lo),
                    outstanding: outstanding.len(),
                });
            }
        }

        let found = slots.iter().filter(|s| s.is_some()).count();
        slots
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                ProtocolError::ChunkAccounting {
                    rank,
                    expected: ids.len(),
                    found,
                }
                .into()
            })
    }
}
