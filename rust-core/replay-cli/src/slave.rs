//! Slave process mode
//!
//! A slave replays one slice of the pipeline index space with exactly one
//! worker thread, so that a driver crash can be attributed to a single
//! in-flight pipeline. Before any work starts it attaches to the master's
//! control block, masks every module already known to be faulty, and
//! installs the fatal-signal handlers that publish crash reports.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};

use replay_archive::{ArchiveReader, Hash};
use replay_control::ControlRegion;
use vulkan_replay::crash;
use vulkan_replay::{ReplayOptions, ReplayOrchestrator};

use crate::{device_factory, Cli};

pub fn run(cli: &Cli) -> Result<i32> {
    if cli.num_threads.is_some_and(|n| n > 1) {
        tracing::warn!("slave processes run a single worker thread; forcing 1");
    }

    let control = match cli.shm_fd {
        Some(fd) => Arc::new(
            ControlRegion::from_inherited_fd(fd).context("Failed to attach control block")?,
        ),
        None => {
            tracing::warn!("slave running without a control block; progress will not be reported");
            Arc::new(ControlRegion::new_local())
        }
    };

    // Modules implicated in earlier crashes are skipped outright.
    let masked_modules: HashSet<Hash> = control.block().faulty_modules().into_iter().collect();
    if !masked_modules.is_empty() {
        tracing::info!(count = masked_modules.len(), "masking known-faulty shader modules");
    }

    // The region lives in `control`, which outlives the orchestrator and is
    // only dropped when the process exits.
    unsafe { crash::arm_crash_reporting(control.block()) };
    crash::install_crash_handlers().context("Failed to install crash handlers")?;

    let mut reader = ArchiveReader::open(&cli.database)
        .with_context(|| format!("Failed to open archive {}", cli.database.display()))?;
    reader.prepare().context("Failed to prepare archive")?;

    let (start_graphics, end_graphics) = cli.graphics_range();
    let (start_compute, end_compute) = cli.compute_range();
    let opts = ReplayOptions {
        pipeline_cache: cli.wants_pipeline_cache(),
        on_disk_pipeline_cache_path: cli.on_disk_pipeline_cache.clone(),
        num_threads: 1,
        loop_count: cli.loop_count.max(1),
        start_graphics_index: start_graphics,
        end_graphics_index: end_graphics,
        start_compute_index: start_compute,
        end_compute_index: end_compute,
        robustness: true,
        control: Some(control.clone()),
        masked_modules,
        ..Default::default()
    };

    let mut orchestrator = ReplayOrchestrator::new(opts, device_factory(cli))?;
    let report = orchestrator.replay_archive(&reader)?;
    report.log_summary();
    Ok(0)
}
