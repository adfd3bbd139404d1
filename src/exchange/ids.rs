//! Request id allocation.

use crate::types::{Rank, RequestId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Which counter an id is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdScope {
    /// One counter for the whole process (single and batch requests).
    Global,
    /// One counter per requesting rank (collective requests at the broker).
    Rank(Rank),
}

/// Issues strictly increasing request ids, starting at 0, never reused.
#[derive(Debug, Default)]
pub struct RequestIdAllocator {
    global: AtomicU64,
    per_rank: Mutex<Vec<RequestId>>,
}

impl RequestIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id in `scope`.
    pub fn next_id(&self, scope: IdScope) -> RequestId {
        match scope {
            IdScope::Global => self.global.fetch_add(1, Ordering::Relaxed),
            IdScope::Rank(rank) => {
                let mut counters = self.per_rank.lock();
                let slot = rank as usize;
                if counters.len() <= slot {
                    counters.resize(slot + 1, 0);
                }
                let id = counters[slot];
                counters[slot] += 1;
                id
            }
        }
    }

    /// Allocate `count` consecutive ids in `scope` under a single lock.
    pub fn next_ids(&self, scope: IdScope, count: usize) -> Vec<RequestId> {
        match scope {
            IdScope::Global => {
                let start = self.global.fetch_add(count as u64, Ordering::Relaxed);
                (start..start + count as u64).collect()
            }
            IdScope::Rank(rank) => {
                let mut counters = self.per_rank.lock();
                let slot = rank as usize;
                if counters.len() <= slot {
                    counters.resize(slot + 1, 0);
                }
                let start = counters[slot];
                counters[slot] += count as u64;
                (start..start + count as u64).collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_global_starts_at_zero() {
        let alloc = RequestIdAllocator::new();
        assert_eq!(alloc.next_id(IdScope::Global), 0);
        assert_eq!(alloc.next_id(IdScope::Global), 1);
        assert_eq!(alloc.next_id(IdScope::Global), 2);
    }

    #[test]
    fn test_rank_scopes_are_independent() {
        let alloc = RequestIdAllocator::new();
        assert_eq!(alloc.next_id(IdScope::Rank(5)), 0);
        assert_eq!(alloc.next_id(IdScope::Rank(5)), 1);
        assert_eq!(alloc.next_id(IdScope::Rank(0)), 0);
        assert_eq!(alloc.next_id(IdScope::Rank(2)), 0);
        assert_eq!(alloc.next_id(IdScope::Rank(5)), 2);
        // Global scope is untouched by rank allocations.
        assert_eq!(alloc.next_id(IdScope::Global), 0);
    }

    #[test]
    fn test_next_ids_is_contiguous() {
        let alloc = RequestIdAllocator::new();
        alloc.next_id(IdScope::Rank(1));
        assert_eq!(alloc.next_ids(IdScope::Rank(1), 3), vec![1, 2, 3]);
        assert_eq!(alloc.next_id(IdScope::Rank(1)), 4);
    }

    #[test]
    fn test_concurrent_ids_unique() {
        let alloc = Arc::new(RequestIdAllocator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let alloc = alloc.clone();
                std::thread::spawn(move || {
                    (0..500)
                        .map(|_| alloc.next_id(IdScope::Global))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(all.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(all.len(), 2000);
    }
}
