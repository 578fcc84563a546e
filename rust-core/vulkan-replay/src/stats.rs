//! Replay timing and count statistics
//!
//! Workers accumulate into thread-local counters and publish them here once
//! on exit, which keeps the hot path free of shared-cacheline traffic. All
//! fields are monotone and relaxed.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Shared statistic totals fed by worker threads.
#[derive(Debug, Default)]
pub struct ReplayStats {
    pub shader_module_ns: AtomicU64,
    pub graphics_pipeline_ns: AtomicU64,
    pub compute_pipeline_ns: AtomicU64,
    pub total_idle_ns: AtomicU64,
    pub thread_total_ns: AtomicU64,
    pub shader_module_count: AtomicU32,
    pub graphics_pipeline_count: AtomicU32,
    pub compute_pipeline_count: AtomicU32,
}

/// Plain copy of the totals at one point in time.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub shader_module_ns: u64,
    pub graphics_pipeline_ns: u64,
    pub compute_pipeline_ns: u64,
    pub total_idle_ns: u64,
    pub thread_total_ns: u64,
    pub shader_module_count: u32,
    pub graphics_pipeline_count: u32,
    pub compute_pipeline_count: u32,
}

impl ReplayStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one worker's local counters into the shared totals.
    #[allow(clippy::too_many_arguments)]
    pub fn publish_worker_totals(
        &self,
        shader_ns: u64,
        shader_count: u32,
        graphics_ns: u64,
        graphics_count: u32,
        compute_ns: u64,
        compute_count: u32,
        idle_ns: u64,
        total_ns: u64,
    ) {
        self.shader_module_ns.fetch_add(shader_ns, Ordering::Relaxed);
        self.shader_module_count.fetch_add(shader_count, Ordering::Relaxed);
        self.graphics_pipeline_ns.fetch_add(graphics_ns, Ordering::Relaxed);
        self.graphics_pipeline_count.fetch_add(graphics_count, Ordering::Relaxed);
        self.compute_pipeline_ns.fetch_add(compute_ns, Ordering::Relaxed);
        self.compute_pipeline_count.fetch_add(compute_count, Ordering::Relaxed);
        self.total_idle_ns.fetch_add(idle_ns, Ordering::Relaxed);
        self.thread_total_ns.fetch_add(total_ns, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            shader_module_ns: self.shader_module_ns.load(Ordering::Relaxed),
            graphics_pipeline_ns: self.graphics_pipeline_ns.load(Ordering::Relaxed),
            compute_pipeline_ns: self.compute_pipeline_ns.load(Ordering::Relaxed),
            total_idle_ns: self.total_idle_ns.load(Ordering::Relaxed),
            thread_total_ns: self.thread_total_ns.load(Ordering::Relaxed),
            shader_module_count: self.shader_module_count.load(Ordering::Relaxed),
            graphics_pipeline_count: self.graphics_pipeline_count.load(Ordering::Relaxed),
            compute_pipeline_count: self.compute_pipeline_count.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_totals_accumulate() {
        let stats = ReplayStats::new();
        stats.publish_worker_totals(100, 2, 5000, 3, 700, 1, 40, 6000);
        stats.publish_worker_totals(50, 1, 1000, 1, 0, 0, 10, 1100);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.shader_module_count, 3);
        assert_eq!(snapshot.shader_module_ns, 150);
        assert_eq!(snapshot.graphics_pipeline_count, 4);
        assert_eq!(snapshot.graphics_pipeline_ns, 6000);
        assert_eq!(snapshot.compute_pipeline_count, 1);
        assert_eq!(snapshot.thread_total_ns, 7100);
    }
}
