//! Shared-memory progress control block and external replayer control API
//!
//! A replay job that spans multiple processes reports progress through a
//! fixed-layout block of atomics living in shared memory. This crate owns
//! that layout, the memfd-backed mapping it lives in, and the programmatic
//! facade (`ExternalReplayer`) that supervisors use to drive a master
//! process and poll its progress.

pub mod control_block;
pub mod external;
pub mod shm;

// Re-export main types
pub use control_block::{
    ControlBlock, PipelineProgress, Progress, ShmMutex, CONTROL_BLOCK_VERSION,
    FAULTY_RING_CAPACITY,
};
pub use external::{ExternalReplayer, ExternalReplayerOptions, PollResult};
pub use shm::{ControlRegion, SharedMemory};

/// Error types for control-block plumbing
#[derive(thiserror::Error, Debug)]
pub enum ControlError {
    #[error("shared memory region is too small: {size} bytes")]
    RegionTooSmall { size: usize },

    #[error("control block cookie mismatch")]
    BadCookie,

    #[error("memfd creation failed: {0}")]
    MemfdFailed(std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
