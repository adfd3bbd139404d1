//! Point-to-point transfers between the ranks of a coordinating group.
//!
//! A [`Communicator`] is one rank's endpoint. Transfers are addressed by
//! destination rank and a [`WireTag`]; on the receiving side they are matched by
//! `(source, tag)` in arrival order. Tag [`CONTROL_TAG`] is reserved for
//! collective bookkeeping such as [`Communicator::gather_counts`], and
//! [`ABORT_TAG`] for failed collective rounds.
//!
//! Two implementations are provided: [`LocalGroup`] wires endpoints together
//! in-process, and [`TcpGroup`] connects every rank to rank 0 over TCP.

mod local;
mod mailbox;
mod tcp;
pub mod wire;

pub use local::{LocalComm, LocalGroup};
pub use mailbox::Mailbox;
pub use tcp::{TcpComm, TcpGroup};

use crate::error::{Error, NetworkError, Result};
use crate::types::{Rank, WireTag};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::try_join_all;
use tokio::sync::oneshot;

/// Tag reserved for control traffic.
pub const CONTROL_TAG: WireTag = 0;

/// Tag reserved for telling ranks that a collective round failed.
pub const ABORT_TAG: WireTag = WireTag::MAX;

/// Handle to a non-blocking transfer.
///
/// The transfer is posted when the handle is created; `wait` only collects
/// the outcome.
#[must_use = "a transfer must be waited on"]
pub struct Transfer<T> {
    peer: Rank,
    state: TransferState<T>,
}

enum TransferState<T> {
    Done(std::result::Result<T, NetworkError>),
    Pending(oneshot::Receiver<std::result::Result<T, NetworkError>>),
}

impl<T> Transfer<T> {
    /// A transfer that has already completed.
    pub fn ready(peer: Rank, outcome: std::result::Result<T, NetworkError>) -> Self {
        Self {
            peer,
            state: TransferState::Done(outcome),
        }
    }

    /// A transfer completed by whoever holds the sender half.
    pub fn pending(
        peer: Rank,
        outcome: oneshot::Receiver<std::result::Result<T, NetworkError>>,
    ) -> Self {
        Self {
            peer,
            state: TransferState::Pending(outcome),
        }
    }

    pub fn peer(&self) -> Rank {
        self.peer
    }

    /// Wait for the transfer to complete.
    pub async fn wait(self) -> Result<T> {
        let outcome = match self.state {
            TransferState::Done(outcome) => outcome,
            TransferState::Pending(rx) => rx
                .await
                .unwrap_or(Err(NetworkError::ConnectionClosed(self.peer))),
        };
        outcome.map_err(Error::from)
    }

    /// Wait for every transfer, returning outcomes in input order.
    pub async fn wait_all<I>(transfers: I) -> Result<Vec<T>>
    where
        I: IntoIterator<Item = Transfer<T>>,
    {
        try_join_all(transfers.into_iter().map(Transfer::wait)).await
    }
}

/// One rank's endpoint in a group.
#[async_trait]
pub trait Communicator: Send + Sync + 'static {
    fn rank(&self) -> Rank;

    fn size(&self) -> usize;

    /// Start sending `payload` to `dest`.
    fn isend(&self, dest: Rank, tag: WireTag, payload: Bytes) -> Transfer<()>;

    /// Post a receive for the next transfer from `source` with `tag`.
    fn irecv(&self, source: Rank, tag: WireTag) -> Transfer<Bytes>;

    /// Send `payload` to `dest` and wait until it has left this endpoint.
    async fn send(&self, dest: Rank, tag: WireTag, payload: Bytes) -> Result<()> {
        self.isend(dest, tag, payload).wait().await
    }

    /// Receive the next transfer from `source` with `tag`.
    async fn recv(&self, source: Rank, tag: WireTag) -> Result<Bytes> {
        self.irecv(source, tag).wait().await
    }

    /// Collect every rank's `count` at `root`.
    ///
    /// The root gets `Some(counts)` indexed by rank; every other rank gets
    /// `None`.
    async fn gather_counts(&self, root: Rank, count: u64) -> Result<Option<Vec<u64>>> {
        check_rank(root, self.size())?;
        if self.rank() != root {
            self.send(root, CONTROL_TAG, Bytes::copy_from_slice(&count.to_be_bytes()))
                .await?;
            return Ok(None);
        }

        let peers: Vec<Rank> = (0..self.size() as Rank).filter(|&r| r != root).collect();
        let posted: Vec<Transfer<Bytes>> = peers
            .iter()
            .map(|&peer| self.irecv(peer, CONTROL_TAG))
            .collect();
        let payloads = Transfer::wait_all(posted).await?;

        let mut counts = vec![0u64; self.size()];
        counts[root as usize] = count;
        for (peer, payload) in peers.into_iter().zip(payloads) {
            let raw: [u8; 8] = payload.as_ref().try_into().map_err(|_| {
                NetworkError::ReceiveFailed(format!(
                    "count from rank {peer} has {} bytes",
                    payload.len()
                ))
            })?;
            counts[peer as usize] = u64::from_be_bytes(raw);
        }
        Ok(Some(counts))
    }
}

pub(crate) fn check_rank(rank: Rank, size: usize) -> std::result::Result<(), NetworkError> {
    if (rank as usize) < size {
        Ok(())
    } else {
        Err(NetworkError::InvalidRank { rank, size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_all_preserves_order() {
        let (tx, rx) = oneshot::channel();
        let transfers = vec![
            Transfer::pending(1, rx),
            Transfer::ready(2, Ok(Bytes::from_static(b"second"))),
        ];
        tx.send(Ok(Bytes::from_static(b"first"))).unwrap();

        let out = Transfer::wait_all(transfers).await.unwrap();
        assert_eq!(out[0], Bytes::from_static(b"first"));
        assert_eq!(out[1], Bytes::from_static(b"second"));
    }

    #[tokio::test]
    async fn test_dropped_sender_reports_closed_peer() {
        let (tx, rx) = oneshot::channel::<std::result::Result<(), NetworkError>>();
        drop(tx);
        let err = Transfer::pending(7, rx).wait().await.unwrap_err();
        assert!(matches!(err, Error::Network(NetworkError::ConnectionClosed(7))));
    }

    #[tokio::test]
    async fn test_gather_counts_over_local_group() {
        let comms = LocalGroup::new(4);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                tokio::spawn(async move {
                    let count = u64::from(comm.rank()) * 10 + 1;
                    comm.gather_counts(0, count).await.unwrap()
                })
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        assert_eq!(results[0], Some(vec![1, 11, 21, 31]));
        assert!(results[1..].iter().all(Option::is_none));
    }

    #[tokio::test]
    async fn test_gather_counts_rejects_bad_root() {
        let comms = LocalGroup::new(2);
        let err = comms[0].gather_counts(5, 1).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Network(NetworkError::InvalidRank { rank: 5, size: 2 })
        ));
    }
}
