//! Replay CLI entrypoint.
//!
//! ```bash
//! vk-replay capture.vkr
//! vk-replay --pipeline-cache --on-disk-pipeline-cache cache.bin capture.vkr
//! vk-replay --progress --timeout 600 capture.vkr
//! vk-replay --graphics-pipeline-range 100 200 --num-threads 8 capture.vkr
//! ```

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use replay_archive::ArchiveReader;
use vulkan_replay::{
    DeviceFactory, ReplayDevice, ReplayOptions, ReplayOrchestrator, VulkanDevice,
    VulkanDeviceOptions,
};

mod master;
mod progress;
mod slave;

#[derive(Parser, Debug)]
#[command(
    name = "vk-replay",
    version,
    about = "Replay recorded Vulkan pipeline state to warm driver caches",
    arg_required_else_help = true
)]
pub struct Cli {
    /// Archive of recorded pipeline state.
    pub database: PathBuf,

    /// Index into the enumerated physical devices.
    #[arg(long = "device-index")]
    pub device_index: Option<usize>,

    /// Enable the Khronos validation layer.
    #[arg(long = "enable-validation")]
    pub enable_validation: bool,

    /// Compile through a driver pipeline cache.
    #[arg(long = "pipeline-cache")]
    pub pipeline_cache: bool,

    /// Prime the pipeline cache from this file and persist it on exit.
    /// Implies --pipeline-cache.
    #[arg(long = "on-disk-pipeline-cache")]
    pub on_disk_pipeline_cache: Option<PathBuf>,

    /// Worker thread count; in master mode, the slice count.
    #[arg(long = "num-threads")]
    pub num_threads: Option<u32>,

    /// Create every module and pipeline this many times.
    #[arg(long = "loop", default_value_t = 1)]
    pub loop_count: u32,

    /// Half-open graphics pipeline index range to replay.
    #[arg(long = "graphics-pipeline-range", num_args = 2, value_names = ["START", "END"])]
    pub graphics_pipeline_range: Option<Vec<u32>>,

    /// Half-open compute pipeline index range to replay.
    #[arg(long = "compute-pipeline-range", num_args = 2, value_names = ["START", "END"])]
    pub compute_pipeline_range: Option<Vec<u32>>,

    /// Supervise crash-resilient slave processes over pipeline slices.
    #[arg(long = "master-process")]
    pub master_process: bool,

    /// Run as a single-threaded slave over the given slices (spawned by a
    /// master; not meant to be used directly).
    #[arg(long = "slave-process")]
    pub slave_process: bool,

    /// Kill the replay after this many seconds (progress mode).
    #[arg(long = "timeout")]
    pub timeout: Option<u64>,

    /// Start a master process and print periodic progress reports.
    #[arg(long = "progress")]
    pub progress: bool,

    /// Silence slave process logging.
    #[arg(long = "quiet-slave")]
    pub quiet_slave: bool,

    /// Inherited control-block file descriptor (set by the spawner).
    #[arg(long = "shm-fd")]
    pub shm_fd: Option<i32>,
}

impl Cli {
    pub fn worker_threads(&self) -> u32 {
        self.num_threads.unwrap_or(num_cpus::get() as u32).max(1)
    }

    pub fn graphics_range(&self) -> (u32, u32) {
        match self.graphics_pipeline_range.as_deref() {
            Some([start, end]) => (*start, *end),
            _ => (0, u32::MAX),
        }
    }

    pub fn compute_range(&self) -> (u32, u32) {
        match self.compute_pipeline_range.as_deref() {
            Some([start, end]) => (*start, *end),
            _ => (0, u32::MAX),
        }
    }

    pub fn wants_pipeline_cache(&self) -> bool {
        self.pipeline_cache || self.on_disk_pipeline_cache.is_some()
    }
}

fn init_logging(cli: &Cli) {
    let default_level = if cli.slave_process && cli.quiet_slave {
        "error"
    } else {
        "info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Build the device factory for modes that talk to a real GPU.
fn device_factory(cli: &Cli) -> DeviceFactory {
    let device_opts = VulkanDeviceOptions {
        device_index: cli.device_index,
        enable_validation: cli.enable_validation,
    };
    Box::new(move |app| {
        let device = VulkanDevice::new(&device_opts, app)?;
        Ok(Arc::new(device) as Arc<dyn ReplayDevice>)
    })
}

/// Single-process replay over the whole (or sliced) archive.
fn run_normal(cli: &Cli) -> Result<i32> {
    let mut reader = ArchiveReader::open(&cli.database)
        .with_context(|| format!("Failed to open archive {}", cli.database.display()))?;
    reader.prepare().context("Failed to prepare archive")?;

    let (start_graphics, end_graphics) = cli.graphics_range();
    let (start_compute, end_compute) = cli.compute_range();
    let opts = ReplayOptions {
        pipeline_cache: cli.wants_pipeline_cache(),
        on_disk_pipeline_cache_path: cli.on_disk_pipeline_cache.clone(),
        num_threads: cli.worker_threads(),
        loop_count: cli.loop_count.max(1),
        start_graphics_index: start_graphics,
        end_graphics_index: end_graphics,
        start_compute_index: start_compute,
        end_compute_index: end_compute,
        masked_modules: HashSet::new(),
        ..Default::default()
    };

    let mut orchestrator = ReplayOrchestrator::new(opts, device_factory(cli))?;
    let report = orchestrator.replay_archive(&reader)?;
    report.log_summary();
    Ok(0)
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let result = if cli.progress {
        progress::run(&cli)
    } else if cli.master_process {
        master::run(&cli)
    } else if cli.slave_process {
        slave::run(&cli)
    } else {
        run_normal(&cli)
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            tracing::error!("{err:#}");
            std::process::exit(1);
        }
    }
}
