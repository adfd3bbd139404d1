//! TCP group in a star around rank 0.
//!
//! Every worker rank holds one connection to rank 0; rank 0 holds one per
//! worker. Workers can therefore only exchange transfers with rank 0, which is
//! all the collective broker needs.

use super::wire::{frame_message, read_frame, write_frame, Frame};
use super::{check_rank, Communicator, Mailbox, Transfer};
use crate::error::{NetworkError, Result};
use crate::types::{Rank, WireTag};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CONNECT_ATTEMPTS: u32 = 50;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Root rank of every TCP group.
pub const HUB_RANK: Rank = 0;

struct Outbound {
    frame: Frame,
    done: oneshot::Sender<std::result::Result<(), NetworkError>>,
}

/// Listener side of a TCP group, owned by rank 0 until every worker joins.
pub struct TcpGroup {
    listener: TcpListener,
    size: usize,
}

impl TcpGroup {
    /// Listen for the workers of a group of `size` ranks.
    pub async fn bind(addr: SocketAddr, size: usize) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(NetworkError::Io)?;
        info!(addr = %listener.local_addr().map_err(NetworkError::Io)?, size, "Group listening");
        Ok(Self { listener, size })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr().map_err(NetworkError::Io)?)
    }

    /// Wait for all `size - 1` workers and return rank 0's endpoint.
    pub async fn accept(self) -> Result<TcpComm> {
        let mut comm = TcpComm::new(HUB_RANK, self.size);
        while comm.peers.len() + 1 < self.size {
            let (stream, peer_addr) = self.listener.accept().await.map_err(NetworkError::Io)?;
            stream.set_nodelay(true).map_err(NetworkError::Io)?;
            let (mut reader, writer) = stream.into_split();

            let rank = match read_frame(&mut reader).await? {
                Some(Frame::Hello { rank, size }) if size as usize == self.size => rank,
                other => {
                    return Err(NetworkError::ConnectionFailed {
                        addr: peer_addr.to_string(),
                        reason: format!("unexpected handshake {other:?}"),
                    }
                    .into())
                }
            };
            check_rank(rank, self.size)?;
            if rank == HUB_RANK || comm.peers.contains_key(&rank) {
                return Err(NetworkError::ConnectionFailed {
                    addr: peer_addr.to_string(),
                    reason: format!("rank {rank} already connected"),
                }
                .into());
            }

            debug!(rank, peer = %peer_addr, "Worker joined");
            comm.attach(rank, reader, writer);
        }
        info!(size = self.size, "All workers joined");
        Ok(comm)
    }

    /// Join the group listening at `addr` as `rank`.
    pub async fn connect(addr: SocketAddr, rank: Rank, size: usize) -> Result<TcpComm> {
        check_rank(rank, size)?;
        let stream = connect_with_retry(addr).await?;
        stream.set_nodelay(true).map_err(NetworkError::Io)?;
        let (reader, mut writer) = stream.into_split();
        write_frame(
            &mut writer,
            &Frame::Hello {
                rank,
                size: size as u32,
            },
        )
        .await?;

        let mut comm = TcpComm::new(rank, size);
        comm.attach(HUB_RANK, reader, writer);
        debug!(rank, addr = %addr, "Joined group");
        Ok(comm)
    }
}

async fn connect_with_retry(addr: SocketAddr) -> Result<TcpStream> {
    let mut last = None;
    for _ in 0..CONNECT_ATTEMPTS {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                last = Some(e);
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
        }
    }
    Err(NetworkError::ConnectionFailed {
        addr: addr.to_string(),
        reason: last.map_or_else(|| "no attempt made".to_string(), |e| e.to_string()),
    }
    .into())
}

/// Endpoint of a TCP group.
pub struct TcpComm {
    rank: Rank,
    size: usize,
    mailbox: Arc<Mailbox>,
    peers: HashMap<Rank, mpsc::UnboundedSender<Outbound>>,
    tasks: Vec<JoinHandle<()>>,
}

impl TcpComm {
    fn new(rank: Rank, size: usize) -> Self {
        Self {
            rank,
            size,
            mailbox: Arc::new(Mailbox::new()),
            peers: HashMap::new(),
            tasks: Vec::new(),
        }
    }

    fn attach(&mut self, peer: Rank, reader: OwnedReadHalf, writer: OwnedWriteHalf) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.insert(peer, tx);
        self.tasks
            .push(tokio::spawn(read_loop(peer, reader, self.mailbox.clone())));
        self.tasks.push(tokio::spawn(write_loop(peer, writer, rx)));
    }
}

impl Drop for TcpComm {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn read_loop(peer: Rank, mut reader: OwnedReadHalf, mailbox: Arc<Mailbox>) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(Frame::Data {
                source,
                tag,
                payload,
            })) => mailbox.deliver(source, tag, Bytes::from(payload)),
            Ok(Some(frame)) => warn!(peer, ?frame, "Ignoring unexpected frame"),
            Ok(None) => {
                debug!(peer, "Peer closed connection");
                break;
            }
            Err(e) => {
                warn!(peer, error = %e, "Read from peer failed");
                break;
            }
        }
    }
    mailbox.close_source(peer);
}

async fn write_loop(
    peer: Rank,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(Outbound { frame, done }) = outbound.recv().await {
        // An unencodable frame fails only its own transfer.
        let framed = match frame_message(&frame) {
            Ok(framed) => framed,
            Err(e) => {
                warn!(peer, error = %e, "Dropping frame");
                let _ = done.send(Err(NetworkError::SendFailed(e.to_string())));
                continue;
            }
        };
        match writer.write_all(&framed).await {
            Ok(()) => {
                let _ = done.send(Ok(()));
            }
            Err(e) => {
                warn!(peer, error = %e, "Write to peer failed");
                let _ = done.send(Err(NetworkError::SendFailed(e.to_string())));
                break;
            }
        }
    }
    outbound.close();
    while let Some(Outbound { done, .. }) = outbound.recv().await {
        let _ = done.send(Err(NetworkError::ConnectionClosed(peer)));
    }
}

#[async_trait]
impl Communicator for TcpComm {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn isend(&self, dest: Rank, tag: WireTag, payload: Bytes) -> Transfer<()> {
        if let Err(err) = check_rank(dest, self.size) {
            return Transfer::ready(dest, Err(err));
        }
        if dest == self.rank {
            self.mailbox.deliver(self.rank, tag, payload);
            return Transfer::ready(dest, Ok(()));
        }
        let Some(peer) = self.peers.get(&dest) else {
            return Transfer::ready(
                dest,
                Err(NetworkError::Unroutable {
                    from: self.rank,
                    to: dest,
                }),
            );
        };

        let (done, outcome) = oneshot::channel();
        let frame = Frame::Data {
            source: self.rank,
            tag,
            payload: payload.to_vec(),
        };
        match peer.send(Outbound { frame, done }) {
            Ok(()) => Transfer::pending(dest, outcome),
            Err(_) => Transfer::ready(dest, Err(NetworkError::ConnectionClosed(dest))),
        }
    }

    fn irecv(&self, source: Rank, tag: WireTag) -> Transfer<Bytes> {
        if let Err(err) = check_rank(source, self.size) {
            return Transfer::ready(source, Err(err));
        }
        if source != self.rank && !self.peers.contains_key(&source) {
            return Transfer::ready(
                source,
                Err(NetworkError::Unroutable {
                    from: source,
                    to: self.rank,
                }),
            );
        }
        Transfer::pending(source, self.mailbox.post(source, tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    async fn star(size: usize) -> Vec<TcpComm> {
        let group = TcpGroup::bind("127.0.0.1:0".parse().unwrap(), size)
            .await
            .unwrap();
        let addr = group.local_addr().unwrap();
        let workers: Vec<_> = (1..size as Rank)
            .map(|rank| tokio::spawn(TcpGroup::connect(addr, rank, size)))
            .collect();

        let mut comms = vec![group.accept().await.unwrap()];
        for worker in workers {
            comms.push(worker.await.unwrap().unwrap());
        }
        comms
    }

    #[tokio::test]
    async fn test_worker_round_trip_through_hub() {
        let comms = star(3).await;

        comms[2]
            .send(0, 7, Bytes::from_static(b"up"))
            .await
            .unwrap();
        assert_eq!(comms[0].recv(2, 7).await.unwrap(), Bytes::from_static(b"up"));

        let pending = comms[1].irecv(0, 7);
        comms[0]
            .send(1, 7, Bytes::from_static(b"down"))
            .await
            .unwrap();
        assert_eq!(pending.wait().await.unwrap(), Bytes::from_static(b"down"));
    }

    #[tokio::test]
    async fn test_gather_counts_over_tcp() {
        let mut comms = star(3).await;
        let hub = comms.remove(0);
        let workers: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                tokio::spawn(async move {
                    let count = u64::from(comm.rank()) + 100;
                    comm.gather_counts(0, count).await.unwrap()
                })
            })
            .collect();

        let counts = hub.gather_counts(0, 5).await.unwrap();
        for worker in workers {
            assert!(worker.await.unwrap().is_none());
        }
        assert_eq!(counts, Some(vec![5, 101, 102]));
    }

    #[tokio::test]
    async fn test_oversized_transfer_leaves_connection_usable() {
        let comms = star(2).await;
        let oversized = Bytes::from(vec![0u8; crate::group::wire::MAX_FRAME_LEN]);
        let err = comms[1].send(0, 2, oversized).await.unwrap_err();
        assert!(matches!(err, Error::Network(NetworkError::SendFailed(_))));

        comms[1]
            .send(0, 2, Bytes::from_static(b"after"))
            .await
            .unwrap();
        assert_eq!(comms[0].recv(1, 2).await.unwrap(), Bytes::from_static(b"after"));
    }

    #[tokio::test]
    async fn test_worker_cannot_reach_other_worker() {
        let comms = star(3).await;
        let err = comms[1]
            .send(2, 1, Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Network(NetworkError::Unroutable { from: 1, to: 2 })
        ));
    }

    #[tokio::test]
    async fn test_closed_peer_fails_pending_receive() {
        let mut comms = star(2).await;
        let worker = comms.pop().unwrap();
        let pending = comms[0].irecv(1, 3);
        drop(worker);

        let err = pending.wait().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Network(NetworkError::ConnectionClosed(1))
        ));
    }
}
