//! Replay orchestration
//!
//! The orchestrator is the decoder's sink. It walks the archive tag by tag
//! in a fixed order, creates the trivial kinds inline, pushes shader-module
//! and pipeline work to the worker pool, and inserts barriers wherever the
//! next kind needs the previous kind's handles to be visible. Derivative
//! pipelines are parked until their parents have materialized; parents that
//! live outside the requested slice are injected on demand without advancing
//! the slice index.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use replay_archive::records::{
    ApplicationInfoRecord, ComputePipelineRecord, DescriptorSetLayoutRecord,
    GraphicsPipelineRecord, PipelineLayoutRecord, RenderPassRecord, SamplerRecord,
    ShaderModuleRecord,
};
use replay_archive::{
    ArchiveReader, Hash, RecordDecoder, RecordSink, ResourceTag, PLAYBACK_ORDER,
};
use replay_control::ControlRegion;

use crate::disk_cache::{DiskPipelineCache, PipelineCacheConfig};
use crate::handles::HandleMap;
use crate::stats::{ReplayStats, StatsSnapshot};
use crate::work::{
    ComputePipelineWork, GraphicsPipelineWork, ShaderModuleWork, WorkItem, WorkPayload, WorkQueue,
};
use crate::worker::{worker_loop, WorkerShared};
use crate::{device::ReplayDevice, ReplayError};

/// Builds the device once the application info (if any) is known.
pub type DeviceFactory =
    Box<dyn FnOnce(Option<&ApplicationInfoRecord>) -> Result<Arc<dyn ReplayDevice>> + Send>;

/// Replay configuration.
pub struct ReplayOptions {
    pub pipeline_cache: bool,
    pub on_disk_pipeline_cache_path: Option<PathBuf>,
    pub num_threads: u32,
    /// Create every module and pipeline this many times; handy for driver
    /// benchmarking.
    pub loop_count: u32,
    pub start_graphics_index: u32,
    pub end_graphics_index: u32,
    pub start_compute_index: u32,
    pub end_compute_index: u32,
    /// Arm crash attribution: snapshot in-flight module hashes before every
    /// pipeline create call.
    pub robustness: bool,
    pub control: Option<Arc<ControlRegion>>,
    /// Shader modules to skip entirely (known to crash the driver).
    pub masked_modules: HashSet<Hash>,
    pub on_worker_thread_start: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            pipeline_cache: false,
            on_disk_pipeline_cache_path: None,
            num_threads: num_cpus::get() as u32,
            loop_count: 1,
            start_graphics_index: 0,
            end_graphics_index: u32::MAX,
            start_compute_index: 0,
            end_compute_index: u32::MAX,
            robustness: false,
            control: None,
            masked_modules: HashSet::new(),
            on_worker_thread_start: None,
        }
    }
}

/// Final counts of one replay run.
#[derive(Debug, Clone)]
pub struct ReplayReport {
    pub samplers: usize,
    pub descriptor_set_layouts: usize,
    pub pipeline_layouts: usize,
    pub shader_modules: usize,
    pub render_passes: usize,
    pub graphics_pipelines: usize,
    pub compute_pipelines: usize,
    pub elapsed: Duration,
    pub stats: StatsSnapshot,
}

impl ReplayReport {
    pub fn total_objects(&self) -> usize {
        self.samplers
            + self.descriptor_set_layouts
            + self.pipeline_layouts
            + self.shader_modules
            + self.render_passes
            + self.graphics_pipelines
            + self.compute_pipelines
    }

    pub fn log_summary(&self) {
        let seconds = |ns: u64| ns as f64 * 1e-9;
        tracing::info!(
            "played back {} shader modules in {:.3} s (accumulated)",
            self.stats.shader_module_count,
            seconds(self.stats.shader_module_ns)
        );
        tracing::info!(
            "played back {} graphics pipelines in {:.3} s (accumulated)",
            self.stats.graphics_pipeline_count,
            seconds(self.stats.graphics_pipeline_ns)
        );
        tracing::info!(
            "played back {} compute pipelines in {:.3} s (accumulated)",
            self.stats.compute_pipeline_count,
            seconds(self.stats.compute_pipeline_ns)
        );
        tracing::info!(
            "workers idled for {:.3} s and ran for {:.3} s (accumulated)",
            seconds(self.stats.total_idle_ns),
            seconds(self.stats.thread_total_ns)
        );
        tracing::info!(
            "replayed {} objects in {} ms",
            self.total_objects(),
            self.elapsed.as_millis()
        );
        tracing::info!("  samplers:               {:7}", self.samplers);
        tracing::info!("  descriptor set layouts: {:7}", self.descriptor_set_layouts);
        tracing::info!("  pipeline layouts:       {:7}", self.pipeline_layouts);
        tracing::info!("  shader modules:         {:7}", self.shader_modules);
        tracing::info!("  render passes:          {:7}", self.render_passes);
        tracing::info!("  graphics pipelines:     {:7}", self.graphics_pipelines);
        tracing::info!("  compute pipelines:      {:7}", self.compute_pipelines);
    }
}

/// Hash-resolution view over the maps a pipeline record may reference.
struct ResolveContext<'a> {
    shader_modules: &'a HandleMap,
    pipeline_layouts: &'a HandleMap,
    render_passes: &'a HandleMap,
}

/// The per-kind behavior the deferred machinery needs from a pipeline
/// record.
trait PipelineRecordOps: Sized {
    const TAG: ResourceTag;
    fn is_derivative(&self) -> bool;
    fn allows_derivatives(&self) -> bool;
    fn base_pipeline(&self) -> Hash;
    /// Resolve references and build the worker payload; `None` when any
    /// required reference is unavailable (the item becomes a counted skip
    /// and no handle-map entry is created for it).
    fn into_payload(
        self,
        ctx: &ResolveContext<'_>,
        base_pipeline: u64,
        map: &mut HandleMap,
        hash: Hash,
    ) -> Option<WorkPayload>;
}

impl PipelineRecordOps for GraphicsPipelineRecord {
    const TAG: ResourceTag = ResourceTag::GraphicsPipeline;

    fn is_derivative(&self) -> bool {
        GraphicsPipelineRecord::is_derivative(self)
    }

    fn allows_derivatives(&self) -> bool {
        GraphicsPipelineRecord::allows_derivatives(self)
    }

    fn base_pipeline(&self) -> Hash {
        self.base_pipeline
    }

    fn into_payload(
        self,
        ctx: &ResolveContext<'_>,
        base_pipeline: u64,
        map: &mut HandleMap,
        hash: Hash,
    ) -> Option<WorkPayload> {
        let mut stage_modules = Vec::with_capacity(self.stages.len());
        let mut stage_hashes = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            let handle = ctx.shader_modules.get(stage.module).unwrap_or(0);
            if handle == 0 {
                return None;
            }
            stage_modules.push(handle);
            stage_hashes.push(stage.module);
        }
        let layout = ctx.pipeline_layouts.get(self.layout).unwrap_or(0);
        let render_pass = ctx.render_passes.get(self.render_pass).unwrap_or(0);
        if layout == 0 || render_pass == 0 {
            return None;
        }

        Some(WorkPayload::GraphicsPipeline(GraphicsPipelineWork {
            record: self,
            stage_modules,
            stage_hashes,
            layout,
            render_pass,
            base_pipeline,
            slot: map.slot(hash),
        }))
    }
}

impl PipelineRecordOps for ComputePipelineRecord {
    const TAG: ResourceTag = ResourceTag::ComputePipeline;

    fn is_derivative(&self) -> bool {
        ComputePipelineRecord::is_derivative(self)
    }

    fn allows_derivatives(&self) -> bool {
        ComputePipelineRecord::allows_derivatives(self)
    }

    fn base_pipeline(&self) -> Hash {
        self.base_pipeline
    }

    fn into_payload(
        self,
        ctx: &ResolveContext<'_>,
        base_pipeline: u64,
        map: &mut HandleMap,
        hash: Hash,
    ) -> Option<WorkPayload> {
        let stage_module = ctx.shader_modules.get(self.stage.module).unwrap_or(0);
        let layout = ctx.pipeline_layouts.get(self.layout).unwrap_or(0);
        if stage_module == 0 || layout == 0 {
            return None;
        }
        let stage_hash = self.stage.module;

        Some(WorkPayload::ComputePipeline(ComputePipelineWork {
            record: self,
            stage_module,
            stage_hash,
            layout,
            base_pipeline,
            slot: map.slot(hash),
        }))
    }
}

/// A pipeline waiting on its parent, or a stashed out-of-slice parent.
struct DeferredPipeline<R> {
    hash: Hash,
    record: R,
    contributes_to_index: bool,
}

/// Per-kind replay state: the handle map, the slice window and its running
/// index, and the deferred-resolution books.
struct PipelineKindState<R> {
    map: HandleMap,
    deferred: Vec<DeferredPipeline<R>>,
    potential_parents: HashMap<Hash, DeferredPipeline<R>>,
    index: u32,
    start_index: u32,
    end_index: u32,
}

impl<R> PipelineKindState<R> {
    fn new(start_index: u32, end_index: u32) -> Self {
        Self {
            map: HandleMap::new(),
            deferred: Vec::new(),
            potential_parents: HashMap::new(),
            index: 0,
            start_index,
            end_index,
        }
    }

    fn in_slice(&self) -> bool {
        self.index >= self.start_index && self.index < self.end_index
    }
}

/// Swap-to-end extraction of every element matching `pred`. Unstable but
/// deterministic for a fixed input, which keeps enqueue order reproducible.
fn unstable_extract<T>(items: &mut Vec<T>, pred: impl Fn(&T) -> bool) -> Vec<T> {
    let mut first = 0;
    let mut last = items.len();
    while first < last {
        if pred(&items[first]) {
            last -= 1;
            items.swap(first, last);
        } else {
            first += 1;
        }
    }
    items.split_off(first)
}

/// Enqueue a pipeline that arrived through the deferred machinery. Items
/// that do not contribute to the index bypass the slice check entirely; they
/// exist only to satisfy a dependency.
fn enqueue_resolved<R: PipelineRecordOps>(
    kind: &mut PipelineKindState<R>,
    ctx: &ResolveContext<'_>,
    queue: &WorkQueue,
    item: DeferredPipeline<R>,
    base_pipeline: u64,
) {
    let contributes = item.contributes_to_index;
    if !contributes || kind.in_slice() {
        let payload = item
            .record
            .into_payload(ctx, base_pipeline, &mut kind.map, item.hash);
        queue.push(WorkItem {
            hash: item.hash,
            tag: R::TAG,
            contributes_to_index: contributes,
            payload,
        });
    }
    if contributes {
        kind.index += 1;
    }
}

/// First-time enqueue from the decoder.
fn enqueue_from_sink<R: PipelineRecordOps>(
    kind: &mut PipelineKindState<R>,
    ctx: &ResolveContext<'_>,
    queue: &WorkQueue,
    hash: Hash,
    record: R,
) -> bool {
    let derived = record.is_derivative();
    if derived && record.base_pipeline() == 0 {
        tracing::warn!(
            "{} {hash:016x} is a derivative with a null parent handle",
            R::TAG.name()
        );
    }

    if derived {
        // The parent may not exist yet; park it for the resolver.
        kind.deferred.push(DeferredPipeline {
            hash,
            record,
            contributes_to_index: true,
        });
        return true;
    }

    if kind.in_slice() {
        let payload = record.into_payload(ctx, 0, &mut kind.map, hash);
        queue.push(WorkItem {
            hash,
            tag: R::TAG,
            contributes_to_index: true,
            payload,
        });
    } else if record.allows_derivatives() {
        // Out of slice, but a derivative inside the slice may still need
        // it. Stash it; injection later will not advance the index.
        kind.potential_parents.insert(
            hash,
            DeferredPipeline {
                hash,
                record,
                contributes_to_index: false,
            },
        );
    }

    // Derivatives index last; everything else indexes in archive order so
    // slices mean the same thing on every run.
    kind.index += 1;
    true
}

/// Resolve deferred derivatives in passes: enqueue whatever has a realized
/// parent, barrier, rewrite parent handles, repeat. Chains resolve in
/// O(depth) passes. A pass that resolves nothing means the archive is
/// malformed.
fn resolve_deferred<R: PipelineRecordOps>(
    kind: &mut PipelineKindState<R>,
    ctx: &ResolveContext<'_>,
    queue: &WorkQueue,
) -> Result<(), ReplayError> {
    // Inject stashed parents that some derivative actually needs.
    for i in 0..kind.deferred.len() {
        let parent_hash = kind.deferred[i].record.base_pipeline();
        if let Some(parent) = kind.potential_parents.remove(&parent_hash) {
            enqueue_resolved(kind, ctx, queue, parent, 0);
        }
    }

    while !kind.deferred.is_empty() {
        let resolvable = {
            let PipelineKindState { deferred, map, .. } = kind;
            let map = &*map;
            unstable_extract(deferred, |d| map.contains(d.record.base_pipeline()))
        };

        if resolvable.is_empty() {
            tracing::error!(
                "nothing more to do resolving derived {}s, but {} pipelines remain",
                R::TAG.name(),
                kind.deferred.len()
            );
            return Err(ReplayError::DeferredStall);
        }

        // Parents were enqueued earlier; make sure their handles landed
        // before we read them.
        queue.wait_idle();

        for item in resolvable {
            let base = kind.map.get(item.record.base_pipeline()).unwrap_or(0);
            enqueue_resolved(kind, ctx, queue, item, base);
        }
    }

    Ok(())
}

/// Drives an archive through a device. Owns the worker pool, every handle
/// map, and the driver cache lifetime.
pub struct ReplayOrchestrator {
    opts: ReplayOptions,
    device_factory: Option<DeviceFactory>,
    shared: Arc<WorkerShared>,
    workers: Vec<JoinHandle<()>>,
    samplers: HandleMap,
    descriptor_set_layouts: HandleMap,
    pipeline_layouts: HandleMap,
    shader_modules: HandleMap,
    render_passes: HandleMap,
    graphics: PipelineKindState<GraphicsPipelineRecord>,
    compute: PipelineKindState<ComputePipelineRecord>,
    disk_cache: Option<DiskPipelineCache>,
    init_error: Option<anyhow::Error>,
}

impl ReplayOrchestrator {
    /// Spawn the worker pool. The device itself is created lazily, once the
    /// archive's application info is known.
    pub fn new(opts: ReplayOptions, device_factory: DeviceFactory) -> Result<Self> {
        let shared = Arc::new(WorkerShared {
            queue: Arc::new(WorkQueue::new()),
            device: OnceLock::new(),
            pipeline_cache: AtomicU64::new(0),
            loop_count: opts.loop_count.max(1),
            robustness: opts.robustness,
            control: opts.control.clone(),
            stats: ReplayStats::new(),
            current_graphics_index: AtomicU32::new(opts.start_graphics_index),
            current_compute_index: AtomicU32::new(opts.start_compute_index),
            on_thread_start: opts.on_worker_thread_start.clone(),
        });

        let worker_count = opts.num_threads.max(1);
        let mut workers = Vec::with_capacity(worker_count as usize);
        for i in 0..worker_count {
            let shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("replay-worker-{i}"))
                .spawn(move || worker_loop(shared))
                .context("Failed to spawn worker thread")?;
            workers.push(handle);
        }

        let graphics = PipelineKindState::new(opts.start_graphics_index, opts.end_graphics_index);
        let compute = PipelineKindState::new(opts.start_compute_index, opts.end_compute_index);

        Ok(Self {
            opts,
            device_factory: Some(device_factory),
            shared,
            workers,
            samplers: HandleMap::new(),
            descriptor_set_layouts: HandleMap::new(),
            pipeline_layouts: HandleMap::new(),
            shader_modules: HandleMap::new(),
            render_passes: HandleMap::new(),
            graphics,
            compute,
            disk_cache: None,
            init_error: None,
        })
    }

    fn ensure_device(&mut self, app: Option<&ApplicationInfoRecord>) -> Result<()> {
        if self.shared.device.get().is_some() {
            return Ok(());
        }

        let factory = self
            .device_factory
            .take()
            .context("device factory already consumed")?;
        let start = Instant::now();
        let device = factory(app).context("Failed to create device")?;
        tracing::info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            "created device"
        );

        if self.opts.pipeline_cache {
            let config = PipelineCacheConfig {
                enabled: true,
                on_disk_path: self.opts.on_disk_pipeline_cache_path.clone(),
            };
            if let Some(cache) = DiskPipelineCache::open(device.as_ref(), &config) {
                self.shared
                    .pipeline_cache
                    .store(cache.handle(), Ordering::Relaxed);
                self.disk_cache = Some(cache);
            }
        }

        if self.shared.device.set(device).is_err() {
            tracing::warn!("device was initialized twice");
        }
        Ok(())
    }

    /// Full barrier against the worker pool; see [`WorkQueue::wait_idle`].
    pub fn sync_worker_threads(&self) {
        self.shared.queue.wait_idle();
    }

    /// Stop and join every worker. Idempotent; must precede device and
    /// driver-cache destruction.
    pub fn tear_down_threads(&mut self) {
        self.shared.queue.initiate_shutdown();
        for handle in self.workers.drain(..) {
            if let Err(err) = handle.join() {
                tracing::error!("worker thread panicked: {err:?}");
            }
        }
    }

    /// Persist and destroy the driver cache, if one is live.
    pub fn flush_pipeline_cache(&mut self) {
        if let Some(cache) = self.disk_cache.take() {
            self.shared.pipeline_cache.store(0, Ordering::Relaxed);
            if let Some(device) = self.shared.device.get() {
                cache.flush_and_destroy(device.as_ref());
            }
        }
    }

    /// `(queued, completed)` work counters.
    pub fn queue_counters(&self) -> (u64, u64) {
        self.shared.queue.counters()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn shader_modules(&self) -> &HandleMap {
        &self.shader_modules
    }

    pub fn graphics_pipelines(&self) -> &HandleMap {
        &self.graphics.map
    }

    pub fn compute_pipelines(&self) -> &HandleMap {
        &self.compute.map
    }

    fn build_report(&self, elapsed: Duration) -> ReplayReport {
        ReplayReport {
            samplers: self.samplers.len(),
            descriptor_set_layouts: self.descriptor_set_layouts.len(),
            pipeline_layouts: self.pipeline_layouts.len(),
            shader_modules: self.shader_modules.len(),
            render_passes: self.render_passes.len(),
            graphics_pipelines: self.graphics.map.len(),
            compute_pipelines: self.compute.map.len(),
            elapsed,
            stats: self.shared.stats.snapshot(),
        }
    }

    /// Play back the whole archive: decode each tag in playback order, apply
    /// or enqueue every record, resolve derivatives, drain the workers and
    /// flush the driver cache. The returned report carries final counts.
    pub fn replay_archive(&mut self, reader: &ArchiveReader) -> Result<ReplayReport> {
        let start = Instant::now();
        let decoder = RecordDecoder::new();

        for tag in PLAYBACK_ORDER {
            let tag_start = Instant::now();
            let mut raw_bytes = 0usize;
            let mut stored_bytes = 0usize;

            let hash_count = reader.hash_list(tag).len();
            match tag {
                ResourceTag::GraphicsPipeline => {
                    self.graphics.deferred.reserve(hash_count);
                    self.graphics.potential_parents.reserve(hash_count);
                }
                ResourceTag::ComputePipeline => {
                    self.compute.deferred.reserve(hash_count);
                    self.compute.potential_parents.reserve(hash_count);
                }
                _ => {}
            }

            for index in 0..hash_count {
                let hash = reader.hash_list(tag)[index];
                let blob = reader
                    .read_entry(tag, hash)
                    .with_context(|| format!("Failed to load {} {hash:016x}", tag.name()))?;
                raw_bytes += blob.len();
                if let Some(sizes) = reader.entry_sizes(tag, hash) {
                    stored_bytes += sizes.stored;
                }

                match decoder.parse(self, tag, hash, &blob) {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!("{} record {hash:016x} was not replayed", tag.name())
                    }
                    Err(err) => {
                        tracing::error!(
                            "failed to decode {} record {hash:016x}: {err}",
                            tag.name()
                        );
                    }
                }
            }

            if let Some(err) = self.init_error.take() {
                return Err(err);
            }

            tracing::info!(
                tag = tag.name(),
                records = hash_count,
                raw_bytes,
                stored_bytes,
                decode_ms = tag_start.elapsed().as_millis() as u64,
                "decoded tag"
            );

            match tag {
                // An archive without application info still needs a device.
                ResourceTag::ApplicationInfo => self.ensure_device(None)?,
                // Pipelines reference module handles at enqueue time; make
                // sure every module landed first.
                ResourceTag::RenderPass => self.sync_worker_threads(),
                ResourceTag::GraphicsPipeline => {
                    if !self.graphics.deferred.is_empty() {
                        let ctx = ResolveContext {
                            shader_modules: &self.shader_modules,
                            pipeline_layouts: &self.pipeline_layouts,
                            render_passes: &self.render_passes,
                        };
                        resolve_deferred(&mut self.graphics, &ctx, &self.shared.queue)?;
                    }
                }
                ResourceTag::ComputePipeline => {
                    if !self.compute.deferred.is_empty() {
                        let ctx = ResolveContext {
                            shader_modules: &self.shader_modules,
                            pipeline_layouts: &self.pipeline_layouts,
                            render_passes: &self.render_passes,
                        };
                        resolve_deferred(&mut self.compute, &ctx, &self.shared.queue)?;
                    }
                }
                _ => {}
            }
        }

        // Drain all outstanding compiles before touching the device from
        // this thread again.
        self.sync_worker_threads();
        self.tear_down_threads();
        self.flush_pipeline_cache();

        Ok(self.build_report(start.elapsed()))
    }

    fn destroy_handles(&mut self) {
        let Some(device) = self.shared.device.get().cloned() else {
            return;
        };
        for handle in self.samplers.drain_handles() {
            device.destroy_sampler(handle);
        }
        for handle in self.descriptor_set_layouts.drain_handles() {
            device.destroy_descriptor_set_layout(handle);
        }
        for handle in self.pipeline_layouts.drain_handles() {
            device.destroy_pipeline_layout(handle);
        }
        for handle in self.shader_modules.drain_handles() {
            device.destroy_shader_module(handle);
        }
        for handle in self.render_passes.drain_handles() {
            device.destroy_render_pass(handle);
        }
        for handle in self.compute.map.drain_handles() {
            device.destroy_pipeline(handle);
        }
        for handle in self.graphics.map.drain_handles() {
            device.destroy_pipeline(handle);
        }
    }
}

impl Drop for ReplayOrchestrator {
    fn drop(&mut self) {
        self.tear_down_threads();
        self.flush_pipeline_cache();
        self.destroy_handles();
    }
}

impl RecordSink for ReplayOrchestrator {
    fn set_application_info(&mut self, _hash: Hash, record: ApplicationInfoRecord) -> bool {
        tracing::info!(
            api_version = record.api_version,
            application = record.application_name.as_deref().unwrap_or(""),
            application_version = record.application_version,
            engine = record.engine_name.as_deref().unwrap_or(""),
            engine_version = record.engine_version,
            "replaying for application"
        );

        if let Err(err) = self.ensure_device(Some(&record)) {
            tracing::error!("failed to initialize device: {err:#}");
            self.init_error = Some(err);
            return false;
        }
        true
    }

    fn create_sampler(&mut self, hash: Hash, record: SamplerRecord) -> bool {
        let Some(device) = self.shared.device.get() else {
            tracing::error!("sampler {hash:016x} decoded before device init");
            return false;
        };
        match device.create_sampler(&record) {
            Ok(handle) => {
                self.samplers.slot(hash).set(handle);
                true
            }
            Err(err) => {
                tracing::error!("creating sampler {hash:016x} failed: {err}");
                false
            }
        }
    }

    fn create_descriptor_set_layout(
        &mut self,
        hash: Hash,
        record: DescriptorSetLayoutRecord,
    ) -> bool {
        let Some(device) = self.shared.device.get() else {
            tracing::error!("descriptor set layout {hash:016x} decoded before device init");
            return false;
        };

        let mut immutable_samplers = Vec::with_capacity(record.bindings.len());
        for binding in &record.bindings {
            let mut handles = Vec::with_capacity(binding.immutable_samplers.len());
            for &sampler_hash in &binding.immutable_samplers {
                match self.samplers.get(sampler_hash) {
                    Some(handle) if handle != 0 => handles.push(handle),
                    _ => {
                        tracing::error!(
                            "descriptor set layout {hash:016x} references missing sampler {sampler_hash:016x}"
                        );
                        return false;
                    }
                }
            }
            immutable_samplers.push(handles);
        }

        match device.create_descriptor_set_layout(&record, &immutable_samplers) {
            Ok(handle) => {
                self.descriptor_set_layouts.slot(hash).set(handle);
                true
            }
            Err(err) => {
                tracing::error!("creating descriptor set layout {hash:016x} failed: {err}");
                false
            }
        }
    }

    fn create_pipeline_layout(&mut self, hash: Hash, record: PipelineLayoutRecord) -> bool {
        let Some(device) = self.shared.device.get() else {
            tracing::error!("pipeline layout {hash:016x} decoded before device init");
            return false;
        };

        let mut set_layouts = Vec::with_capacity(record.set_layouts.len());
        for &layout_hash in &record.set_layouts {
            match self.descriptor_set_layouts.get(layout_hash) {
                Some(handle) if handle != 0 => set_layouts.push(handle),
                _ => {
                    tracing::error!(
                        "pipeline layout {hash:016x} references missing set layout {layout_hash:016x}"
                    );
                    return false;
                }
            }
        }

        match device.create_pipeline_layout(&record, &set_layouts) {
            Ok(handle) => {
                self.pipeline_layouts.slot(hash).set(handle);
                true
            }
            Err(err) => {
                tracing::error!("creating pipeline layout {hash:016x} failed: {err}");
                false
            }
        }
    }

    fn create_render_pass(&mut self, hash: Hash, record: RenderPassRecord) -> bool {
        let Some(device) = self.shared.device.get() else {
            tracing::error!("render pass {hash:016x} decoded before device init");
            return false;
        };
        match device.create_render_pass(&record) {
            Ok(handle) => {
                self.render_passes.slot(hash).set(handle);
                true
            }
            Err(err) => {
                tracing::error!("creating render pass {hash:016x} failed: {err}");
                false
            }
        }
    }

    fn enqueue_create_shader_module(&mut self, hash: Hash, record: ShaderModuleRecord) -> bool {
        if self.opts.masked_modules.contains(&hash) {
            tracing::info!("skipping banned shader module {hash:016x}");
            return true;
        }
        if !record.is_valid_spirv() {
            tracing::error!("shader module {hash:016x} carries invalid SPIR-V");
            return false;
        }

        let slot = self.shader_modules.slot(hash);
        self.shared.queue.push(WorkItem {
            hash,
            tag: ResourceTag::ShaderModule,
            contributes_to_index: false,
            payload: Some(WorkPayload::ShaderModule(ShaderModuleWork {
                code: record.code,
                slot,
            })),
        });
        true
    }

    fn enqueue_create_graphics_pipeline(
        &mut self,
        hash: Hash,
        record: GraphicsPipelineRecord,
    ) -> bool {
        let ctx = ResolveContext {
            shader_modules: &self.shader_modules,
            pipeline_layouts: &self.pipeline_layouts,
            render_passes: &self.render_passes,
        };
        enqueue_from_sink(&mut self.graphics, &ctx, &self.shared.queue, hash, record)
    }

    fn enqueue_create_compute_pipeline(
        &mut self,
        hash: Hash,
        record: ComputePipelineRecord,
    ) -> bool {
        let ctx = ResolveContext {
            shader_modules: &self.shader_modules,
            pipeline_layouts: &self.pipeline_layouts,
            render_passes: &self.render_passes,
        };
        enqueue_from_sink(&mut self.compute, &ctx, &self.shared.queue, hash, record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    use replay_archive::records::{
        StageRecord, SubpassRecord, PIPELINE_CREATE_ALLOW_DERIVATIVES, PIPELINE_CREATE_DERIVATIVE,
        SPIRV_MAGIC,
    };
    use replay_archive::ArchiveWriter;

    use crate::device::testing::MockDevice;

    fn spirv_module() -> ShaderModuleRecord {
        ShaderModuleRecord {
            code: vec![SPIRV_MAGIC, 0x0001_0000, 0, 8, 0],
        }
    }

    fn render_pass_record() -> RenderPassRecord {
        RenderPassRecord {
            subpasses: vec![SubpassRecord::default()],
            ..Default::default()
        }
    }

    fn graphics_record(
        module: Hash,
        layout: Hash,
        render_pass: Hash,
        flags: u32,
        base: Hash,
    ) -> GraphicsPipelineRecord {
        GraphicsPipelineRecord {
            flags,
            stages: vec![StageRecord {
                stage: 1,
                module,
                entry_point: "main".to_string(),
            }],
            viewport_count: 1,
            scissor_count: 1,
            layout,
            render_pass,
            subpass: 0,
            base_pipeline: base,
            ..Default::default()
        }
    }

    fn compute_record(module: Hash, layout: Hash, flags: u32, base: Hash) -> ComputePipelineRecord {
        ComputePipelineRecord {
            flags,
            stage: StageRecord {
                stage: 0x20,
                module,
                entry_point: "main".to_string(),
            },
            layout,
            base_pipeline: base,
        }
    }

    fn build_archive(
        build: impl FnOnce(&mut ArchiveWriter),
    ) -> (tempfile::TempDir, ArchiveReader) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.vkr");
        let mut writer = ArchiveWriter::create(&path).unwrap();
        build(&mut writer);
        writer.finish().unwrap();

        let mut reader = ArchiveReader::open(&path).unwrap();
        reader.prepare().unwrap();
        (dir, reader)
    }

    fn mock_factory(device: Arc<MockDevice>, created: Arc<AtomicBool>) -> DeviceFactory {
        Box::new(move |_| {
            created.store(true, Ordering::Relaxed);
            Ok(device as Arc<dyn ReplayDevice>)
        })
    }

    fn options_with_control() -> (ReplayOptions, Arc<ControlRegion>) {
        let control = Arc::new(ControlRegion::new_local());
        let opts = ReplayOptions {
            num_threads: 2,
            control: Some(control.clone()),
            ..Default::default()
        };
        (opts, control)
    }

    #[test]
    fn test_empty_archive_creates_device_and_replays_nothing() {
        let (_dir, reader) = build_archive(|_| {});
        let device = Arc::new(MockDevice::new());
        let created = Arc::new(AtomicBool::new(false));
        let (opts, control) = options_with_control();

        let mut orchestrator =
            ReplayOrchestrator::new(opts, mock_factory(device.clone(), created.clone())).unwrap();
        let report = orchestrator.replay_archive(&reader).unwrap();

        assert!(created.load(Ordering::Relaxed));
        assert_eq!(report.total_objects(), 0);

        let (queued, completed) = orchestrator.queue_counters();
        assert_eq!(queued, completed);
        assert_eq!(control.block().snapshot().graphics.completed, 0);
    }

    #[test]
    fn test_single_compute_pipeline_full_slice() {
        let mut module_hash = 0;
        let mut layout_hash = 0;
        let mut pipeline_hash = 0;
        let (_dir, reader) = build_archive(|writer| {
            module_hash = writer
                .write_record(ResourceTag::ShaderModule, &spirv_module())
                .unwrap();
            layout_hash = writer
                .write_record(ResourceTag::PipelineLayout, &PipelineLayoutRecord::default())
                .unwrap();
            pipeline_hash = writer
                .write_record(
                    ResourceTag::ComputePipeline,
                    &compute_record(module_hash, layout_hash, 0, 0),
                )
                .unwrap();
        });

        let device = Arc::new(MockDevice::new());
        let created = Arc::new(AtomicBool::new(false));
        let (mut opts, control) = options_with_control();
        opts.start_compute_index = 0;
        opts.end_compute_index = 1;

        let mut orchestrator =
            ReplayOrchestrator::new(opts, mock_factory(device.clone(), created)).unwrap();
        let report = orchestrator.replay_archive(&reader).unwrap();

        assert_eq!(report.compute_pipelines, 1);
        assert_ne!(orchestrator.compute_pipelines().get(pipeline_hash), Some(0));
        assert_eq!(device.created_compute.load(Ordering::Relaxed), 1);

        let progress = control.block().snapshot();
        assert_eq!(progress.compute.completed, 1);
        assert_eq!(progress.compute.skipped, 0);
    }

    #[test]
    fn test_missing_module_reference_becomes_counted_skip() {
        let (_dir, reader) = build_archive(|writer| {
            let layout_hash = writer
                .write_record(ResourceTag::PipelineLayout, &PipelineLayoutRecord::default())
                .unwrap();
            let render_pass_hash = writer
                .write_record(ResourceTag::RenderPass, &render_pass_record())
                .unwrap();
            // References a module the archive does not contain.
            writer
                .write_record(
                    ResourceTag::GraphicsPipeline,
                    &graphics_record(0xdead, layout_hash, render_pass_hash, 0, 0),
                )
                .unwrap();
        });

        let device = Arc::new(MockDevice::new());
        let created = Arc::new(AtomicBool::new(false));
        let (opts, control) = options_with_control();

        let mut orchestrator =
            ReplayOrchestrator::new(opts, mock_factory(device.clone(), created)).unwrap();
        let report = orchestrator.replay_archive(&reader).unwrap();

        // The slice index advanced, the skip was counted, and no handle-map
        // entry exists for the pipeline.
        let progress = control.block().snapshot();
        assert_eq!(progress.graphics.skipped, 1);
        assert_eq!(progress.graphics.completed, 0);
        assert_eq!(
            control
                .block()
                .current_graphics_index
                .load(Ordering::Relaxed),
            1
        );
        assert_eq!(report.graphics_pipelines, 0);
        assert_eq!(device.created_graphics.load(Ordering::Relaxed), 0);

        let (queued, completed) = orchestrator.queue_counters();
        assert_eq!(queued, completed);
    }

    #[test]
    fn test_out_of_slice_parent_is_injected_for_derivative() {
        let mut parent_hash = 0;
        let mut derivative_hash = 0;
        let (_dir, reader) = build_archive(|writer| {
            let module_hash = writer
                .write_record(ResourceTag::ShaderModule, &spirv_module())
                .unwrap();
            let layout_hash = writer
                .write_record(ResourceTag::PipelineLayout, &PipelineLayoutRecord::default())
                .unwrap();
            let render_pass_hash = writer
                .write_record(ResourceTag::RenderPass, &render_pass_record())
                .unwrap();
            parent_hash = writer
                .write_record(
                    ResourceTag::GraphicsPipeline,
                    &graphics_record(
                        module_hash,
                        layout_hash,
                        render_pass_hash,
                        PIPELINE_CREATE_ALLOW_DERIVATIVES,
                        0,
                    ),
                )
                .unwrap();
            derivative_hash = writer
                .write_record(
                    ResourceTag::GraphicsPipeline,
                    &graphics_record(
                        module_hash,
                        layout_hash,
                        render_pass_hash,
                        PIPELINE_CREATE_DERIVATIVE,
                        parent_hash,
                    ),
                )
                .unwrap();
        });

        let device = Arc::new(MockDevice::new());
        let created = Arc::new(AtomicBool::new(false));
        let (mut opts, control) = options_with_control();
        // Slice [1, 2): the parent at index 0 is outside, the derivative
        // (indexed after all non-derivatives) is inside.
        opts.start_graphics_index = 1;
        opts.end_graphics_index = 2;

        let mut orchestrator =
            ReplayOrchestrator::new(opts, mock_factory(device.clone(), created)).unwrap();
        let report = orchestrator.replay_archive(&reader).unwrap();

        assert_eq!(report.graphics_pipelines, 2);
        assert_ne!(orchestrator.graphics_pipelines().get(parent_hash), Some(0));
        assert_ne!(
            orchestrator.graphics_pipelines().get(derivative_hash),
            Some(0)
        );
        assert_eq!(device.created_graphics.load(Ordering::Relaxed), 2);

        // Only the derivative contributes to the slice.
        assert_eq!(control.block().snapshot().graphics.completed, 1);
    }

    #[test]
    fn test_loop_count_scales_creation_not_final_handles() {
        let mut pipeline_hash = 0;
        let (_dir, reader) = build_archive(|writer| {
            let module_hash = writer
                .write_record(ResourceTag::ShaderModule, &spirv_module())
                .unwrap();
            let layout_hash = writer
                .write_record(ResourceTag::PipelineLayout, &PipelineLayoutRecord::default())
                .unwrap();
            let render_pass_hash = writer
                .write_record(ResourceTag::RenderPass, &render_pass_record())
                .unwrap();
            pipeline_hash = writer
                .write_record(
                    ResourceTag::GraphicsPipeline,
                    &graphics_record(module_hash, layout_hash, render_pass_hash, 0, 0),
                )
                .unwrap();
        });

        let device = Arc::new(MockDevice::new());
        let created = Arc::new(AtomicBool::new(false));
        let (mut opts, control) = options_with_control();
        opts.loop_count = 3;

        let mut orchestrator =
            ReplayOrchestrator::new(opts, mock_factory(device.clone(), created)).unwrap();
        let report = orchestrator.replay_archive(&reader).unwrap();

        // Created three times, shader module included, but each repeat
        // destroyed its predecessor and the success counter bumped once.
        assert_eq!(device.created_graphics.load(Ordering::Relaxed), 3);
        assert_eq!(device.created_modules.load(Ordering::Relaxed), 3);
        assert_eq!(report.stats.graphics_pipeline_count, 3);
        assert_eq!(control.block().snapshot().graphics.completed, 1);
        assert_eq!(report.graphics_pipelines, 1);
        assert_ne!(orchestrator.graphics_pipelines().get(pipeline_hash), Some(0));

        // Teardown destroys every surviving object.
        drop(orchestrator);
        assert_eq!(device.live_count(), 0);
    }

    #[test]
    fn test_unresolvable_derivative_is_fatal() {
        let (_dir, reader) = build_archive(|writer| {
            let module_hash = writer
                .write_record(ResourceTag::ShaderModule, &spirv_module())
                .unwrap();
            let layout_hash = writer
                .write_record(ResourceTag::PipelineLayout, &PipelineLayoutRecord::default())
                .unwrap();
            let render_pass_hash = writer
                .write_record(ResourceTag::RenderPass, &render_pass_record())
                .unwrap();
            writer
                .write_record(
                    ResourceTag::GraphicsPipeline,
                    &graphics_record(
                        module_hash,
                        layout_hash,
                        render_pass_hash,
                        PIPELINE_CREATE_DERIVATIVE,
                        0xbeef_dead,
                    ),
                )
                .unwrap();
        });

        let device = Arc::new(MockDevice::new());
        let created = Arc::new(AtomicBool::new(false));
        let (opts, _control) = options_with_control();

        let mut orchestrator =
            ReplayOrchestrator::new(opts, mock_factory(device, created)).unwrap();
        let err = orchestrator.replay_archive(&reader).unwrap_err();
        assert!(format!("{err:#}").contains("no derived pipeline"));
    }

    #[test]
    fn test_masked_module_skips_module_and_dependent_pipeline() {
        let mut module_hash = 0;
        let (_dir, reader) = build_archive(|writer| {
            module_hash = writer
                .write_record(ResourceTag::ShaderModule, &spirv_module())
                .unwrap();
            let layout_hash = writer
                .write_record(ResourceTag::PipelineLayout, &PipelineLayoutRecord::default())
                .unwrap();
            writer
                .write_record(
                    ResourceTag::ComputePipeline,
                    &compute_record(module_hash, layout_hash, 0, 0),
                )
                .unwrap();
        });

        let device = Arc::new(MockDevice::new());
        let created = Arc::new(AtomicBool::new(false));
        let (mut opts, control) = options_with_control();
        opts.masked_modules.insert(module_hash);

        let mut orchestrator =
            ReplayOrchestrator::new(opts, mock_factory(device.clone(), created)).unwrap();
        let report = orchestrator.replay_archive(&reader).unwrap();

        assert_eq!(device.created_modules.load(Ordering::Relaxed), 0);
        assert_eq!(report.shader_modules, 0);
        assert_eq!(report.compute_pipelines, 0);
        assert_eq!(control.block().snapshot().compute.skipped, 1);
    }
}
