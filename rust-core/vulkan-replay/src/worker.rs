//! Worker thread loop
//!
//! Workers pull items off the shared queue and drive the device create
//! calls, which dominate replay latency and are the reason creation is
//! parallel at all. Statistics accumulate in locals and are folded into the
//! shared totals once, on thread exit.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use replay_control::ControlRegion;

use crate::crash;
use crate::device::ReplayDevice;
use crate::stats::ReplayStats;
use crate::work::{ComputePipelineWork, GraphicsPipelineWork, ShaderModuleWork, WorkItem, WorkPayload, WorkQueue};

/// State shared between the orchestrator and its workers.
pub(crate) struct WorkerShared {
    pub queue: Arc<WorkQueue>,
    pub device: OnceLock<Arc<dyn ReplayDevice>>,
    /// Raw driver cache handle; zero when caching is disabled.
    pub pipeline_cache: AtomicU64,
    pub loop_count: u32,
    pub robustness: bool,
    pub control: Option<Arc<ControlRegion>>,
    pub stats: ReplayStats,
    /// One past the pipeline currently in flight, kept coherent with the
    /// main thread's enqueue indices and mirrored into the control block.
    pub current_graphics_index: AtomicU32,
    pub current_compute_index: AtomicU32,
    pub on_thread_start: Option<Arc<dyn Fn() + Send + Sync>>,
}

struct LocalCounters {
    shader_ns: u64,
    shader_count: u32,
    graphics_ns: u64,
    graphics_count: u32,
    compute_ns: u64,
    compute_count: u32,
    idle_ns: u64,
}

pub(crate) fn worker_loop(shared: Arc<WorkerShared>) {
    if let Some(callback) = &shared.on_thread_start {
        callback();
    }

    let thread_start = Instant::now();
    let mut local = LocalCounters {
        shader_ns: 0,
        shader_count: 0,
        graphics_ns: 0,
        graphics_count: 0,
        compute_ns: 0,
        compute_count: 0,
        idle_ns: 0,
    };

    loop {
        let idle_start = Instant::now();
        let Some(item) = shared.queue.next() else {
            break;
        };
        local.idle_ns += idle_start.elapsed().as_nanos() as u64;

        process_item(&shared, item, &mut local);
        shared.queue.complete_one();
    }

    shared.stats.publish_worker_totals(
        local.shader_ns,
        local.shader_count,
        local.graphics_ns,
        local.graphics_count,
        local.compute_ns,
        local.compute_count,
        local.idle_ns,
        thread_start.elapsed().as_nanos() as u64,
    );
}

fn process_item(shared: &WorkerShared, item: WorkItem, local: &mut LocalCounters) {
    match item.payload {
        Some(WorkPayload::ShaderModule(work)) => {
            replay_shader_module(shared, item.hash, &work, local)
        }
        Some(WorkPayload::GraphicsPipeline(work)) => {
            advance_graphics_index(shared, item.contributes_to_index);
            replay_graphics_pipeline(shared, item.hash, &work, item.contributes_to_index, local);
        }
        Some(WorkPayload::ComputePipeline(work)) => {
            advance_compute_index(shared, item.contributes_to_index);
            replay_compute_pipeline(shared, item.hash, &work, item.contributes_to_index, local);
        }
        None => {
            // Placeholder item: keep the replay index coherent and account
            // the skip, but touch nothing else.
            match item.tag {
                replay_archive::ResourceTag::GraphicsPipeline => {
                    advance_graphics_index(shared, item.contributes_to_index);
                    if let Some(control) = &shared.control {
                        control
                            .block()
                            .skipped_graphics
                            .fetch_add(1, Ordering::Relaxed);
                    }
                }
                replay_archive::ResourceTag::ComputePipeline => {
                    advance_compute_index(shared, item.contributes_to_index);
                    if let Some(control) = &shared.control {
                        control
                            .block()
                            .skipped_compute
                            .fetch_add(1, Ordering::Relaxed);
                    }
                }
                tag => tracing::warn!("placeholder work item with unexpected tag {tag:?}"),
            }
        }
    }
}

fn advance_graphics_index(shared: &WorkerShared, contributes: bool) {
    if contributes {
        let index = shared.current_graphics_index.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(control) = &shared.control {
            control
                .block()
                .current_graphics_index
                .store(index, Ordering::Relaxed);
        }
    }
}

fn advance_compute_index(shared: &WorkerShared, contributes: bool) {
    if contributes {
        let index = shared.current_compute_index.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(control) = &shared.control {
            control
                .block()
                .current_compute_index
                .store(index, Ordering::Relaxed);
        }
    }
}

fn replay_shader_module(
    shared: &WorkerShared,
    hash: u64,
    work: &ShaderModuleWork,
    local: &mut LocalCounters,
) {
    let Some(device) = shared.device.get() else {
        tracing::error!("shader module {hash:016x} enqueued before device init");
        return;
    };

    for _ in 0..shared.loop_count {
        // Avoid leaking the previous iteration's module.
        let prior = work.slot.take();
        if prior != 0 {
            device.destroy_shader_module(prior);
        }

        let start = Instant::now();
        match device.create_shader_module(&work.code) {
            Ok(handle) => {
                local.shader_ns += start.elapsed().as_nanos() as u64;
                local.shader_count += 1;
                work.slot.set(handle);
            }
            Err(err) => {
                tracing::error!("failed to create shader module for hash {hash:016x}: {err}");
            }
        }
    }
}

fn replay_graphics_pipeline(
    shared: &WorkerShared,
    hash: u64,
    work: &GraphicsPipelineWork,
    contributes: bool,
    local: &mut LocalCounters,
) {
    let Some(device) = shared.device.get() else {
        tracing::error!("graphics pipeline {hash:016x} enqueued before device init");
        return;
    };

    // A derivative whose parent never materialized cannot compile either.
    if work.record.is_derivative() && work.base_pipeline == 0 {
        tracing::error!("graphics pipeline {hash:016x} is a derivative with a null parent");
        return;
    }

    if shared.robustness {
        crash::set_in_flight_modules(&work.stage_hashes);
    }

    let cache = shared.pipeline_cache.load(Ordering::Relaxed);
    for iteration in 0..shared.loop_count {
        let prior = work.slot.take();
        if prior != 0 {
            device.destroy_pipeline(prior);
        }

        let start = Instant::now();
        match device.create_graphics_pipeline(cache, work) {
            Ok(handle) => {
                if contributes {
                    local.graphics_ns += start.elapsed().as_nanos() as u64;
                    local.graphics_count += 1;
                }
                work.slot.set(handle);

                if iteration == 0 && contributes {
                    if let Some(control) = &shared.control {
                        control
                            .block()
                            .successful_graphics
                            .fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Err(err) => {
                tracing::error!("failed to create graphics pipeline for hash {hash:016x}: {err}");
            }
        }
    }

    if shared.robustness {
        crash::clear_in_flight_modules();
    }
}

fn replay_compute_pipeline(
    shared: &WorkerShared,
    hash: u64,
    work: &ComputePipelineWork,
    contributes: bool,
    local: &mut LocalCounters,
) {
    let Some(device) = shared.device.get() else {
        tracing::error!("compute pipeline {hash:016x} enqueued before device init");
        return;
    };

    if work.record.is_derivative() && work.base_pipeline == 0 {
        tracing::error!("compute pipeline {hash:016x} is a derivative with a null parent");
        return;
    }

    if shared.robustness {
        crash::set_in_flight_modules(&[work.stage_hash]);
    }

    let cache = shared.pipeline_cache.load(Ordering::Relaxed);
    for iteration in 0..shared.loop_count {
        let prior = work.slot.take();
        if prior != 0 {
            device.destroy_pipeline(prior);
        }

        let start = Instant::now();
        match device.create_compute_pipeline(cache, work) {
            Ok(handle) => {
                if contributes {
                    local.compute_ns += start.elapsed().as_nanos() as u64;
                    local.compute_count += 1;
                }
                work.slot.set(handle);

                if iteration == 0 && contributes {
                    if let Some(control) = &shared.control {
                        control
                            .block()
                            .successful_compute
                            .fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Err(err) => {
                tracing::error!("failed to create compute pipeline for hash {hash:016x}: {err}");
            }
        }
    }

    if shared.robustness {
        crash::clear_in_flight_modules();
    }
}
