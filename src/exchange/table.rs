//! Thread-safe request id → result mapping.

use crate::types::RequestId;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Results observed in the store, keyed by request id.
///
/// Filled by store query callbacks and drained by the pollers. The first value
/// observed for an id wins; later observations are discarded, never overwritten.
#[derive(Debug)]
pub struct AsyncResultTable<T> {
    entries: Mutex<HashMap<RequestId, T>>,
}

impl<T> Default for AsyncResultTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AsyncResultTable<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record `value` for `id` unless a value is already present.
    ///
    /// Returns `true` if the value was stored.
    pub fn insert_if_absent(&self, id: RequestId, value: T) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(&id) {
            return false;
        }
        entries.insert(id, value);
        true
    }

    /// Remove and return the value for `id`.
    pub fn remove(&self, id: RequestId) -> Option<T> {
        self.entries.lock().remove(&id)
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<T: Clone> AsyncResultTable<T> {
    /// Copy out the value for `id`, leaving it in place.
    pub fn try_get(&self, id: RequestId) -> Option<T> {
        self.entries.lock().get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_first_write_wins() {
        let table = AsyncResultTable::new();
        assert!(table.insert_if_absent(3, "first"));
        assert!(!table.insert_if_absent(3, "second"));
        assert_eq!(table.try_get(3), Some("first"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_remove_then_absent() {
        let table = AsyncResultTable::new();
        table.insert_if_absent(1, 10.0);
        assert_eq!(table.remove(1), Some(10.0));
        assert_eq!(table.try_get(1), None);
        assert_eq!(table.remove(1), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_concurrent_observer_and_reader() {
        let table = Arc::new(AsyncResultTable::new());
        let writer = {
            let table = table.clone();
            std::thread::spawn(move || {
                for id in 0..1000u64 {
                    table.insert_if_absent(id, id * 2);
                    // Duplicate delivery from a second observation.
                    table.insert_if_absent(id, u64::MAX);
                }
            })
        };

        let mut seen = 0;
        while seen < 1000 {
            if let Some(value) = table.try_get(seen) {
                assert_eq!(value, seen * 2);
                seen += 1;
            }
        }
        writer.join().unwrap();
        assert_eq!(table.len(), 1000);
    }
}
