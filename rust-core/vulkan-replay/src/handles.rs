//! Hash-keyed handle maps with stable slots
//!
//! Workers write created handles through slots that were registered at
//! enqueue time on the main thread. Each slot is an `Arc`'d atomic, so its
//! address never moves while an item is in flight and no per-slot locking is
//! needed; a zero value is the null handle. Readers of another kind's slots
//! are always separated from the writers by a queue barrier.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use replay_archive::Hash;

/// One handle cell. Zero means "not created" or "creation failed".
#[derive(Debug, Default)]
pub struct HandleSlot(AtomicU64);

impl HandleSlot {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, handle: u64) {
        self.0.store(handle, Ordering::Relaxed);
    }

    /// Clear the slot, returning the prior handle so it can be destroyed.
    pub fn take(&self) -> u64 {
        self.0.swap(0, Ordering::Relaxed)
    }
}

/// Insertion-ordered map from content hash to handle slot.
#[derive(Debug, Default)]
pub struct HandleMap {
    entries: HashMap<Hash, Arc<HandleSlot>>,
    order: Vec<Hash>,
}

impl HandleMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the slot for a hash. The returned `Arc` stays valid for
    /// the lifetime of the map regardless of later insertions.
    pub fn slot(&mut self, hash: Hash) -> Arc<HandleSlot> {
        match self.entries.entry(hash) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.get().clone(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                self.order.push(hash);
                entry.insert(Arc::new(HandleSlot::new())).clone()
            }
        }
    }

    /// Whether an entry exists for the hash. An entry means the resource was
    /// enqueued at some point; its handle may still be null.
    pub fn contains(&self, hash: Hash) -> bool {
        self.entries.contains_key(&hash)
    }

    /// Current handle value for a hash, if an entry exists.
    pub fn get(&self, hash: Hash) -> Option<u64> {
        self.entries.get(&hash).map(|slot| slot.get())
    }

    /// Number of entries (created or failed).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (Hash, u64)> + '_ {
        self.order.iter().filter_map(move |hash| {
            self.entries.get(hash).map(|slot| (*hash, slot.get()))
        })
    }

    /// Drain every non-null handle, in insertion order, for destruction.
    pub fn drain_handles(&mut self) -> Vec<u64> {
        let handles = self
            .order
            .iter()
            .filter_map(|hash| {
                let handle = self.entries.get(hash)?.take();
                (handle != 0).then_some(handle)
            })
            .collect();
        self.entries.clear();
        self.order.clear();
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_identity_is_stable_across_insertions() {
        let mut map = HandleMap::new();
        let slot = map.slot(0x1);
        for hash in 2..100u64 {
            map.slot(hash);
        }

        slot.set(0xabc);
        assert_eq!(map.get(0x1), Some(0xabc));
        assert!(Arc::ptr_eq(&slot, &map.slot(0x1)));
    }

    #[test]
    fn test_entry_exists_even_when_handle_is_null() {
        let mut map = HandleMap::new();
        map.slot(0x7);

        assert!(map.contains(0x7));
        assert_eq!(map.get(0x7), Some(0));
        assert_eq!(map.get(0x8), None);
    }

    #[test]
    fn test_drain_skips_null_handles_and_preserves_order() {
        let mut map = HandleMap::new();
        map.slot(0x1).set(10);
        map.slot(0x2);
        map.slot(0x3).set(30);

        assert_eq!(map.drain_handles(), vec![10, 30]);
        assert!(map.is_empty());
    }
}
