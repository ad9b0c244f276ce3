//! Bounded registry of addresses already migrated to the blob store.
//!
//! The set guarantees at most one in-flight flush per address: the scanner
//! marks an address before handing it to a worker, and a failed write
//! unmarks it so the next scan retries. Capacity is bounded by address
//! count; the oldest entries are evicted first.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

/// Default capacity of the flushed set.
pub(crate) const FLUSHED_KEYS_LIMIT: usize = 256 * 1024;

struct Inner {
    by_key: HashMap<String, u64>,
    by_clock: BTreeMap<u64, String>,
    clock: u64,
}

/// Internally synchronized, count-bounded set of flushed addresses.
pub(crate) struct FlushedSet {
    inner: Mutex<Inner>,
    cap: usize,
}

impl FlushedSet {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                by_key: HashMap::new(),
                by_clock: BTreeMap::new(),
                clock: 0,
            }),
            cap: cap.max(1),
        }
    }

    /// Mark an address. Inserting over capacity evicts the oldest entry.
    pub(crate) fn add(&self, key: &str) {
        let mut inner = self.inner.lock();
        if inner.by_key.contains_key(key) {
            return;
        }
        inner.clock += 1;
        let clock = inner.clock;
        inner.by_key.insert(key.to_string(), clock);
        inner.by_clock.insert(clock, key.to_string());

        while inner.by_key.len() > self.cap {
            let Some((_, oldest)) = inner.by_clock.pop_first() else {
                break;
            };
            inner.by_key.remove(&oldest);
        }
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.inner.lock().by_key.contains_key(key)
    }

    /// Unmark an address so the next scan picks it up again.
    pub(crate) fn remove(&self, key: &str) {
        let mut inner = self.inner.lock();
        if let Some(clock) = inner.by_key.remove(key) {
            inner.by_clock.remove(&clock);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().by_key.len()
    }
}
