//! Fixed-layout progress control block
//!
//! The block is a `#[repr(C)]` struct of naturally aligned atomics so that
//! master, slaves and the supervising process can all map the same bytes and
//! agree on every offset. Counters are monotone statistics and use relaxed
//! ordering throughout; the faulty-module ring is the only multi-word
//! structure and is guarded by a spinlock that is safe to take from a signal
//! handler.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Identifies a mapped region as a control block.
pub const CONTROL_BLOCK_COOKIE: u64 = 0x5245_504c_4159_4342; // "REPLAYCB"
/// Layout version; bumped when fields move.
pub const CONTROL_BLOCK_VERSION: u32 = 1;
/// Capacity of the faulty-module ring.
pub const FAULTY_RING_CAPACITY: usize = 64;

/// Spinlock usable across processes and from signal handlers.
///
/// The faulty-module ring is written on crash paths where only
/// async-signal-safe operations are allowed, so this is a bare CAS loop with
/// no syscalls and no poisoning.
#[repr(transparent)]
pub struct ShmMutex(AtomicU32);

impl ShmMutex {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn lock(&self) {
        while self
            .0
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    pub fn unlock(&self) {
        self.0.store(0, Ordering::Release);
    }

    /// Run `f` under the lock.
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock();
        let result = f();
        self.unlock();
        result
    }
}

impl Default for ShmMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// The shared progress block. All fields are written with relaxed ordering;
/// they are statistics, not synchronization.
#[repr(C)]
pub struct ControlBlock {
    cookie: AtomicU64,
    version: AtomicU32,

    /// Set once the master has written totals and begun spawning work.
    progress_started: AtomicU32,
    /// Set when every slice has been attempted.
    progress_complete: AtomicU32,

    pub successful_graphics: AtomicU32,
    pub skipped_graphics: AtomicU32,
    pub total_graphics: AtomicU32,

    pub successful_compute: AtomicU32,
    pub skipped_compute: AtomicU32,
    pub total_compute: AtomicU32,

    pub total_modules: AtomicU32,
    pub banned_modules: AtomicU32,

    pub clean_crashes: AtomicU32,
    pub dirty_crashes: AtomicU32,

    /// Replay-position mirrors: one past the pipeline currently in flight in
    /// the active slave. The master reads these after a crash to narrow the
    /// next slice.
    pub current_graphics_index: AtomicU32,
    pub current_compute_index: AtomicU32,

    ring_lock: ShmMutex,
    ring_count: AtomicU32,
    faulty_ring: [AtomicU64; FAULTY_RING_CAPACITY],
}

/// Progress over one pipeline index space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineProgress {
    pub completed: u32,
    pub skipped: u32,
    pub total: u32,
}

/// Atomic snapshot of the whole block.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Progress {
    pub graphics: PipelineProgress,
    pub compute: PipelineProgress,
    pub total_modules: u32,
    pub banned_modules: u32,
    pub clean_crashes: u32,
    pub dirty_crashes: u32,
}

impl Default for ControlBlock {
    fn default() -> Self {
        const ZERO32: AtomicU32 = AtomicU32::new(0);
        const ZERO64: AtomicU64 = AtomicU64::new(0);
        Self {
            cookie: ZERO64,
            version: ZERO32,
            progress_started: ZERO32,
            progress_complete: ZERO32,
            successful_graphics: ZERO32,
            skipped_graphics: ZERO32,
            total_graphics: ZERO32,
            successful_compute: ZERO32,
            skipped_compute: ZERO32,
            total_compute: ZERO32,
            total_modules: ZERO32,
            banned_modules: ZERO32,
            clean_crashes: ZERO32,
            dirty_crashes: ZERO32,
            current_graphics_index: ZERO32,
            current_compute_index: ZERO32,
            ring_lock: ShmMutex::new(),
            ring_count: ZERO32,
            faulty_ring: [ZERO64; FAULTY_RING_CAPACITY],
        }
    }
}

impl ControlBlock {
    /// Size in bytes the backing region must provide.
    pub const fn byte_size() -> usize {
        std::mem::size_of::<ControlBlock>()
    }

    /// Stamp the cookie and version. Called once by the process that owns
    /// the region; freshly created shared memory is already zeroed.
    pub fn initialize(&self) {
        self.version.store(CONTROL_BLOCK_VERSION, Ordering::Relaxed);
        self.cookie.store(CONTROL_BLOCK_COOKIE, Ordering::Relaxed);
    }

    pub fn is_initialized(&self) -> bool {
        self.cookie.load(Ordering::Relaxed) == CONTROL_BLOCK_COOKIE
            && self.version.load(Ordering::Relaxed) == CONTROL_BLOCK_VERSION
    }

    /// True if the cookie is present but the layout version differs; readers
    /// must not interpret the rest of the block.
    pub fn is_version_mismatch(&self) -> bool {
        self.cookie.load(Ordering::Relaxed) == CONTROL_BLOCK_COOKIE
            && self.version.load(Ordering::Relaxed) != CONTROL_BLOCK_VERSION
    }

    pub fn mark_started(&self) {
        self.progress_started.store(1, Ordering::Relaxed);
    }

    pub fn has_started(&self) -> bool {
        self.progress_started.load(Ordering::Relaxed) != 0
    }

    pub fn mark_complete(&self) {
        self.progress_complete.store(1, Ordering::Relaxed);
    }

    pub fn is_complete(&self) -> bool {
        self.progress_complete.load(Ordering::Relaxed) != 0
    }

    /// Record a faulty module hash. Deduplicates, keeps `banned_modules` in
    /// sync with ring occupancy, and drops hashes once the ring is full.
    /// Async-signal-safe: atomics and a spinlock only.
    pub fn push_faulty_module(&self, hash: u64) {
        if hash == 0 {
            return;
        }

        self.ring_lock.lock();
        let count = self.ring_count.load(Ordering::Relaxed) as usize;
        let mut present = false;
        for slot in &self.faulty_ring[..count.min(FAULTY_RING_CAPACITY)] {
            if slot.load(Ordering::Relaxed) == hash {
                present = true;
                break;
            }
        }
        if !present && count < FAULTY_RING_CAPACITY {
            self.faulty_ring[count].store(hash, Ordering::Relaxed);
            self.ring_count.store(count as u32 + 1, Ordering::Relaxed);
            self.banned_modules.store(count as u32 + 1, Ordering::Relaxed);
        }
        self.ring_lock.unlock();
    }

    /// Copy out the ring contents.
    pub fn faulty_modules(&self) -> Vec<u64> {
        self.ring_lock.lock();
        let count = (self.ring_count.load(Ordering::Relaxed) as usize).min(FAULTY_RING_CAPACITY);
        let hashes = self.faulty_ring[..count]
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .collect();
        self.ring_lock.unlock();
        hashes
    }

    /// Relaxed snapshot of every counter.
    pub fn snapshot(&self) -> Progress {
        Progress {
            graphics: PipelineProgress {
                completed: self.successful_graphics.load(Ordering::Relaxed),
                skipped: self.skipped_graphics.load(Ordering::Relaxed),
                total: self.total_graphics.load(Ordering::Relaxed),
            },
            compute: PipelineProgress {
                completed: self.successful_compute.load(Ordering::Relaxed),
                skipped: self.skipped_compute.load(Ordering::Relaxed),
                total: self.total_compute.load(Ordering::Relaxed),
            },
            total_modules: self.total_modules.load(Ordering::Relaxed),
            banned_modules: self.banned_modules.load(Ordering::Relaxed),
            clean_crashes: self.clean_crashes.load(Ordering::Relaxed),
            dirty_crashes: self.dirty_crashes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fresh_block_is_uninitialized_and_zeroed() {
        let block = ControlBlock::default();
        assert!(!block.is_initialized());
        assert!(!block.has_started());
        assert!(!block.is_complete());

        block.initialize();
        assert!(block.is_initialized());
        assert!(!block.is_version_mismatch());

        let progress = block.snapshot();
        assert_eq!(progress.graphics, PipelineProgress::default());
        assert_eq!(progress.compute, PipelineProgress::default());
    }

    #[test]
    fn test_counters_show_up_in_snapshot() {
        let block = ControlBlock::default();
        block.successful_graphics.fetch_add(3, Ordering::Relaxed);
        block.skipped_graphics.fetch_add(1, Ordering::Relaxed);
        block.total_graphics.store(10, Ordering::Relaxed);
        block.dirty_crashes.fetch_add(1, Ordering::Relaxed);

        let progress = block.snapshot();
        assert_eq!(progress.graphics.completed, 3);
        assert_eq!(progress.graphics.skipped, 1);
        assert_eq!(progress.graphics.total, 10);
        assert_eq!(progress.dirty_crashes, 1);
    }

    #[test]
    fn test_faulty_ring_deduplicates_and_caps() {
        let block = ControlBlock::default();
        block.push_faulty_module(0xaa);
        block.push_faulty_module(0xbb);
        block.push_faulty_module(0xaa);
        block.push_faulty_module(0);

        assert_eq!(block.faulty_modules(), vec![0xaa, 0xbb]);
        assert_eq!(block.banned_modules.load(Ordering::Relaxed), 2);

        for i in 0..2 * FAULTY_RING_CAPACITY as u64 {
            block.push_faulty_module(0x1000 + i);
        }
        assert_eq!(block.faulty_modules().len(), FAULTY_RING_CAPACITY);
    }

    #[test]
    fn test_ring_is_consistent_under_contention() {
        let block = Arc::new(ControlBlock::default());
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let block = block.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..8 {
                    block.push_faulty_module((t << 8) | (i + 1));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let hashes = block.faulty_modules();
        assert_eq!(hashes.len(), 32);
        let unique: std::collections::HashSet<_> = hashes.iter().collect();
        assert_eq!(unique.len(), 32);
    }
}
