//! Work items and the shared work queue
//!
//! The queue is an unbounded FIFO guarded by a single mutex with two
//! condition variables: `work_available` wakes consumers, `work_done` wakes
//! the main thread once `completed` catches up with `queued`. Only the main
//! thread ever waits on `work_done`, so a single notify is enough.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use replay_archive::records::{ComputePipelineRecord, GraphicsPipelineRecord};
use replay_archive::{Hash, ResourceTag};

use crate::handles::HandleSlot;

/// Shader-module compilation work.
pub struct ShaderModuleWork {
    pub code: Vec<u32>,
    pub slot: Arc<HandleSlot>,
}

/// Graphics-pipeline compilation work with every referenced handle resolved.
pub struct GraphicsPipelineWork {
    pub record: GraphicsPipelineRecord,
    /// Raw module handles, one per record stage.
    pub stage_modules: Vec<u64>,
    /// Module content hashes, one per record stage, for crash attribution.
    pub stage_hashes: Vec<Hash>,
    pub layout: u64,
    pub render_pass: u64,
    /// Parent handle for derivatives; zero when not a derivative or when the
    /// parent itself failed to build.
    pub base_pipeline: u64,
    pub slot: Arc<HandleSlot>,
}

/// Compute-pipeline compilation work.
pub struct ComputePipelineWork {
    pub record: ComputePipelineRecord,
    pub stage_module: u64,
    pub stage_hash: Hash,
    pub layout: u64,
    pub base_pipeline: u64,
    pub slot: Arc<HandleSlot>,
}

/// What a worker should build.
pub enum WorkPayload {
    ShaderModule(ShaderModuleWork),
    GraphicsPipeline(GraphicsPipelineWork),
    ComputePipeline(ComputePipelineWork),
}

/// One unit of work. A `None` payload is a placeholder for a pipeline whose
/// references could not be resolved: the worker advances the slice index and
/// the skipped counter but does no device work, keeping the main thread's and
/// the workers' notion of replay position coherent.
pub struct WorkItem {
    pub hash: Hash,
    pub tag: ResourceTag,
    pub contributes_to_index: bool,
    pub payload: Option<WorkPayload>,
}

struct QueueState {
    items: VecDeque<WorkItem>,
    queued: u64,
    completed: u64,
    shutdown: bool,
}

/// Multi-producer / multi-consumer FIFO shared between the main thread and
/// the worker pool.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    work_available: Condvar,
    work_done: Condvar,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                queued: 0,
                completed: 0,
                shutdown: false,
            }),
            work_available: Condvar::new(),
            work_done: Condvar::new(),
        }
    }

    /// Enqueue one item and wake a worker.
    pub fn push(&self, item: WorkItem) {
        let mut state = self.state.lock();
        state.items.push_back(item);
        state.queued += 1;
        self.work_available.notify_one();
    }

    /// Block until an item is available. Returns `None` once shutdown has
    /// been initiated.
    pub fn next(&self) -> Option<WorkItem> {
        let mut state = self.state.lock();
        while !state.shutdown && state.items.is_empty() {
            self.work_available.wait(&mut state);
        }
        if state.shutdown {
            return None;
        }
        state.items.pop_front()
    }

    /// Mark one pulled item finished; wakes the barrier when the queue
    /// drains.
    pub fn complete_one(&self) {
        let mut state = self.state.lock();
        state.completed += 1;
        if state.completed == state.queued {
            self.work_done.notify_one();
        }
    }

    /// Full barrier: returns once every queued item has completed. After
    /// this, no worker is mid-item and every slot written for queued work is
    /// visible.
    pub fn wait_idle(&self) {
        let mut state = self.state.lock();
        while state.queued != state.completed {
            self.work_done.wait(&mut state);
        }
    }

    /// Ask workers to exit. Pending items are abandoned; callers barrier
    /// with [`WorkQueue::wait_idle`] first when they need them finished.
    pub fn initiate_shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.work_available.notify_all();
    }

    /// `(queued, completed)` counters.
    pub fn counters(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.queued, state.completed)
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    fn placeholder_item(hash: Hash) -> WorkItem {
        WorkItem {
            hash,
            tag: ResourceTag::GraphicsPipeline,
            contributes_to_index: true,
            payload: None,
        }
    }

    #[test]
    fn test_counters_track_push_and_complete() {
        let queue = WorkQueue::new();
        queue.push(placeholder_item(1));
        queue.push(placeholder_item(2));
        assert_eq!(queue.counters(), (2, 0));

        queue.next().unwrap();
        queue.complete_one();
        assert_eq!(queue.counters(), (2, 1));
    }

    #[test]
    fn test_wait_idle_blocks_until_drained() {
        let queue = Arc::new(WorkQueue::new());
        let processed = Arc::new(AtomicU64::new(0));

        let consumer = {
            let queue = queue.clone();
            let processed = processed.clone();
            std::thread::spawn(move || {
                while let Some(item) = queue.next() {
                    processed.fetch_add(item.hash, Ordering::Relaxed);
                    std::thread::sleep(Duration::from_millis(1));
                    queue.complete_one();
                }
            })
        };

        for hash in 1..=20u64 {
            queue.push(placeholder_item(hash));
        }
        queue.wait_idle();

        // Barrier semantics: every pushed item has fully completed.
        assert_eq!(processed.load(Ordering::Relaxed), (1..=20).sum::<u64>());
        assert_eq!(queue.counters(), (20, 20));

        queue.initiate_shutdown();
        consumer.join().unwrap();
    }

    #[test]
    fn test_shutdown_wakes_blocked_consumers() {
        let queue = Arc::new(WorkQueue::new());
        let consumer = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.next())
        };

        std::thread::sleep(Duration::from_millis(10));
        queue.initiate_shutdown();
        assert!(consumer.join().unwrap().is_none());
    }

    #[test]
    fn test_wait_idle_returns_immediately_when_empty() {
        let queue = WorkQueue::new();
        queue.wait_idle();
        assert_eq!(queue.counters(), (0, 0));
    }
}
