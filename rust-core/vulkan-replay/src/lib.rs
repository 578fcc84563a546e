//! Multi-threaded replay of archived Vulkan pipeline state
//!
//! This crate drives a recorded archive back through a live device to warm
//! on-disk driver caches: the main thread decodes records and replays the
//! trivial kinds inline while a pool of workers compiles shader modules and
//! pipelines pulled from a shared work queue. Derivative pipelines are
//! deferred until their parents exist, replay can be restricted to a slice of
//! the pipeline index space, and progress is mirrored into a shared control
//! block so crashed slices can be skipped by a supervising process.

pub mod crash;
pub mod device;
pub mod disk_cache;
pub mod handles;
pub mod orchestrator;
pub mod stats;
pub mod work;

mod worker;

// Re-export main types
pub use device::{ReplayDevice, VulkanDevice, VulkanDeviceOptions};
pub use disk_cache::{validate_cache_header, DiskPipelineCache, PipelineCacheConfig};
pub use handles::{HandleMap, HandleSlot};
pub use orchestrator::{DeviceFactory, ReplayOptions, ReplayOrchestrator, ReplayReport};
pub use stats::{ReplayStats, StatsSnapshot};
pub use work::{WorkItem, WorkPayload, WorkQueue};

/// Error types for the replay core
#[derive(thiserror::Error, Debug)]
pub enum ReplayError {
    #[error("Vulkan API error: {0}")]
    Vulkan(#[from] ash::vk::Result),

    #[error("device has not been initialized")]
    DeviceNotReady,

    #[error("no derived pipeline could be resolved; archive appears malformed")]
    DeferredStall,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
