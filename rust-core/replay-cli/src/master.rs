//! Master process mode
//!
//! The master never touches the device. It counts pipelines, publishes
//! totals into the control block, then walks the pipeline index space slice
//! by slice, one slave process at a time. When a slave dies mid-slice the
//! master reads the in-flight index mirrors from the control block, narrows
//! the slice to start just past the crashing pipeline, and respawns. A slave
//! that fails without crashing (device init, archive errors) abandons its
//! slice and taints the exit code.

use std::process::Command;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};

use replay_archive::{ArchiveReader, ResourceTag};
use replay_control::ControlRegion;
use vulkan_replay::crash::CLEAN_CRASH_EXIT_CODE;

use crate::Cli;

/// Split `[0, total)` into at most `count` contiguous chunks.
fn plan_slices(total: u32, count: u32) -> Vec<(u32, u32)> {
    if total == 0 || count == 0 {
        return Vec::new();
    }
    let chunk = total.div_ceil(count);
    let mut slices = Vec::new();
    let mut start = 0;
    while start < total {
        let end = (start + chunk).min(total);
        slices.push((start, end));
        start = end;
    }
    slices
}

/// New slice start after a crash. `current` is one past the in-flight
/// pipeline; if the crash happened before any pipeline started, force
/// progress by skipping one.
fn narrowed_start(previous_start: u32, current: u32) -> u32 {
    if current <= previous_start {
        previous_start + 1
    } else {
        current
    }
}

pub fn run(cli: &Cli) -> Result<i32> {
    let mut reader = ArchiveReader::open(&cli.database)
        .with_context(|| format!("Failed to open archive {}", cli.database.display()))?;
    reader.prepare().context("Failed to prepare archive")?;
    let total_graphics = reader.hash_list(ResourceTag::GraphicsPipeline).len() as u32;
    let total_compute = reader.hash_list(ResourceTag::ComputePipeline).len() as u32;
    let total_modules = reader.hash_list(ResourceTag::ShaderModule).len() as u32;
    drop(reader);

    let control = match cli.shm_fd {
        Some(fd) => {
            ControlRegion::from_inherited_fd(fd).context("Failed to attach control block")?
        }
        None => ControlRegion::create_shared().context("Failed to create control block")?,
    };
    let shm_fd = control
        .shm_fd()
        .context("master control block must live in shared memory")?;

    let block = control.block();
    block.total_graphics.store(total_graphics, Ordering::Relaxed);
    block.total_compute.store(total_compute, Ordering::Relaxed);
    block.total_modules.store(total_modules, Ordering::Relaxed);
    block.mark_started();

    let slice_count = cli.worker_threads();
    let graphics_slices = plan_slices(total_graphics, slice_count);
    let compute_slices = plan_slices(total_compute, slice_count);
    tracing::info!(
        total_graphics,
        total_compute,
        slices = graphics_slices.len().max(compute_slices.len()),
        "starting sliced replay"
    );

    let mut abandoned = 0u32;
    for i in 0..slice_count as usize {
        let graphics = graphics_slices.get(i).copied().unwrap_or((0, 0));
        let compute = compute_slices.get(i).copied().unwrap_or((0, 0));
        if graphics.0 == graphics.1 && compute.0 == compute.1 {
            continue;
        }
        abandoned += run_slice(cli, &control, shm_fd, graphics, compute)?;
    }

    block.mark_complete();

    let progress = block.snapshot();
    tracing::info!(
        graphics_completed = progress.graphics.completed,
        compute_completed = progress.compute.completed,
        clean_crashes = progress.clean_crashes,
        dirty_crashes = progress.dirty_crashes,
        banned_modules = progress.banned_modules,
        "sliced replay finished"
    );

    Ok(if abandoned > 0 { 1 } else { 0 })
}

/// Drive one slice to completion, respawning past crashes. Returns the
/// number of abandoned slices (0 or 1).
fn run_slice(
    cli: &Cli,
    control: &ControlRegion,
    shm_fd: i32,
    mut graphics: (u32, u32),
    mut compute: (u32, u32),
) -> Result<u32> {
    let block = control.block();

    loop {
        if graphics.0 >= graphics.1 && compute.0 >= compute.1 {
            return Ok(0);
        }

        // Seed the mirrors so a crash before the first pipeline still
        // reports a meaningful position.
        block
            .current_graphics_index
            .store(graphics.0, Ordering::Relaxed);
        block
            .current_compute_index
            .store(compute.0, Ordering::Relaxed);

        let mut child = spawn_slave(cli, shm_fd, graphics, compute)?;
        let status = child.wait().context("Failed to wait for slave process")?;

        if status.success() {
            return Ok(0);
        }

        match status.code() {
            Some(CLEAN_CRASH_EXIT_CODE) => {
                // The slave's handler already published faulty modules and
                // the clean-crash counter.
                tracing::warn!("slave crashed cleanly, narrowing slice");
            }
            Some(code) => {
                // Failed without crashing: retrying the same slice would
                // fail the same way.
                tracing::error!(code, "slave failed; abandoning slice");
                return Ok(1);
            }
            None => {
                tracing::warn!("slave terminated abnormally, narrowing slice");
                block.dirty_crashes.fetch_add(1, Ordering::Relaxed);
            }
        }

        let current_graphics = block.current_graphics_index.load(Ordering::Relaxed);
        let current_compute = block.current_compute_index.load(Ordering::Relaxed);
        if current_graphics < graphics.1 {
            graphics.0 = narrowed_start(graphics.0, current_graphics);
        } else {
            graphics.0 = graphics.1;
            compute.0 = narrowed_start(compute.0, current_compute);
        }
    }
}

fn spawn_slave(
    cli: &Cli,
    shm_fd: i32,
    graphics: (u32, u32),
    compute: (u32, u32),
) -> Result<std::process::Child> {
    let program = std::env::current_exe().context("Failed to locate replayer binary")?;
    let mut command = Command::new(program);
    command
        .arg("--slave-process")
        .arg("--num-threads")
        .arg("1")
        .arg("--shm-fd")
        .arg(shm_fd.to_string())
        .arg("--graphics-pipeline-range")
        .arg(graphics.0.to_string())
        .arg(graphics.1.to_string())
        .arg("--compute-pipeline-range")
        .arg(compute.0.to_string())
        .arg(compute.1.to_string())
        .arg("--loop")
        .arg(cli.loop_count.max(1).to_string());
    if cli.quiet_slave {
        command.arg("--quiet-slave");
    }
    if cli.pipeline_cache {
        command.arg("--pipeline-cache");
    }
    if let Some(path) = &cli.on_disk_pipeline_cache {
        command.arg("--on-disk-pipeline-cache").arg(path);
    }
    if let Some(index) = cli.device_index {
        command.arg("--device-index").arg(index.to_string());
    }
    if cli.enable_validation {
        command.arg("--enable-validation");
    }
    command.arg(&cli.database);

    command.spawn().context("Failed to spawn slave process")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_slices_covers_the_whole_range() {
        assert_eq!(plan_slices(0, 4), vec![]);
        assert_eq!(plan_slices(10, 1), vec![(0, 10)]);
        assert_eq!(plan_slices(10, 4), vec![(0, 3), (3, 6), (6, 9), (9, 10)]);

        // Contiguous, half-open, exhaustive.
        let slices = plan_slices(100, 7);
        assert_eq!(slices.first().unwrap().0, 0);
        assert_eq!(slices.last().unwrap().1, 100);
        for pair in slices.windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
        }
    }

    #[test]
    fn test_narrowed_start_skips_the_crashing_pipeline() {
        // Crash at pipeline 42: the mirror reads 43, the new slice starts
        // there.
        assert_eq!(narrowed_start(0, 43), 43);

        // Crash before any pipeline started: force progress.
        assert_eq!(narrowed_start(0, 0), 1);
        assert_eq!(narrowed_start(7, 7), 8);
        assert_eq!(narrowed_start(7, 3), 8);
    }
}
