//! In-process group.

use super::{check_rank, Communicator, Mailbox, Transfer};
use crate::types::{Rank, WireTag};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Factory for endpoints that share memory.
pub struct LocalGroup;

impl LocalGroup {
    /// Create `size` connected endpoints, indexed by rank.
    pub fn new(size: usize) -> Vec<LocalComm> {
        let mailboxes: Arc<Vec<Mailbox>> = Arc::new((0..size).map(|_| Mailbox::new()).collect());
        (0..size as Rank)
            .map(|rank| LocalComm {
                rank,
                mailboxes: mailboxes.clone(),
            })
            .collect()
    }
}

/// Endpoint of a [`LocalGroup`].
#[derive(Clone)]
pub struct LocalComm {
    rank: Rank,
    mailboxes: Arc<Vec<Mailbox>>,
}

#[async_trait]
impl Communicator for LocalComm {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.mailboxes.len()
    }

    fn isend(&self, dest: Rank, tag: WireTag, payload: Bytes) -> Transfer<()> {
        let outcome = check_rank(dest, self.size()).map(|()| {
            self.mailboxes[dest as usize].deliver(self.rank, tag, payload);
        });
        Transfer::ready(dest, outcome)
    }

    fn irecv(&self, source: Rank, tag: WireTag) -> Transfer<Bytes> {
        match check_rank(source, self.size()) {
            Ok(()) => Transfer::pending(source, self.mailboxes[self.rank as usize].post(source, tag)),
            Err(err) => Transfer::ready(source, Err(err)),
        }
    }
}
