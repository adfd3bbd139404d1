//! Matching of incoming transfers to posted receives.

use crate::error::NetworkError;
use crate::types::{Rank, WireTag};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::oneshot;
use tracing::trace;

type Delivery = oneshot::Sender<Result<Bytes, NetworkError>>;

#[derive(Default)]
struct Slot {
    queued: VecDeque<Bytes>,
    waiters: VecDeque<Delivery>,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<(Rank, WireTag), Slot>,
    closed: HashSet<Rank>,
}

/// Per-endpoint inbox keyed by `(source, tag)`.
///
/// Messages with the same key are delivered in arrival order, and receives
/// posted for the same key are satisfied in posting order.
#[derive(Default)]
pub struct Mailbox {
    inner: Mutex<Inner>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand `payload` from `source` to the oldest matching receive, or queue it.
    pub fn deliver(&self, source: Rank, tag: WireTag, payload: Bytes) {
        let mut inner = self.inner.lock();
        let slot = inner.slots.entry((source, tag)).or_default();
        let mut payload = payload;
        while let Some(waiter) = slot.waiters.pop_front() {
            match waiter.send(Ok(payload)) {
                Ok(()) => return,
                // Receive was abandoned; try the next one.
                Err(Ok(returned)) => payload = returned,
                Err(Err(_)) => return,
            }
        }
        trace!(source, tag, "Queued transfer");
        slot.queued.push_back(payload);
    }

    /// Post a receive for `(source, tag)`.
    pub fn post(&self, source: Rank, tag: WireTag) -> oneshot::Receiver<Result<Bytes, NetworkError>> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        let closed = inner.closed.contains(&source);
        let slot = inner.slots.entry((source, tag)).or_default();
        if let Some(payload) = slot.queued.pop_front() {
            let _ = tx.send(Ok(payload));
        } else if closed {
            let _ = tx.send(Err(NetworkError::ConnectionClosed(source)));
        } else {
            slot.waiters.retain(|waiter| !waiter.is_closed());
            slot.waiters.push_back(tx);
        }
        rx
    }

    /// Fail every pending and future receive from `source`.
    ///
    /// Messages already queued stay deliverable.
    pub fn close_source(&self, source: Rank) {
        let mut inner = self.inner.lock();
        inner.closed.insert(source);
        for ((from, _), slot) in inner.slots.iter_mut() {
            if *from != source {
                continue;
            }
            for waiter in slot.waiters.drain(..) {
                let _ = waiter.send(Err(NetworkError::ConnectionClosed(source)));
            }
        }
    }

    /// Number of queued, unclaimed messages.
    pub fn queued(&self) -> usize {
        self.inner.lock().slots.values().map(|s| s.queued.len()).sum()
    }

    /// Number of posted receives not yet satisfied.
    pub fn waiting(&self) -> usize {
        self.inner.lock().slots.values().map(|s| s.waiters.len()).sum()
    }
}
