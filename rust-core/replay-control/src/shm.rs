//! Memory-mapped backing for the control block
//!
//! The master creates an anonymous memfd sized for one [`ControlBlock`] and
//! passes the file descriptor to slaves by inheritance; each process maps the
//! same pages. A process-local variant backs single-process runs and tests.

use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

use anyhow::{Context, Result};
use memmap2::{MmapMut, MmapOptions};

use crate::control_block::ControlBlock;
use crate::ControlError;

/// A shared mapping holding exactly one control block.
pub struct SharedMemory {
    map: MmapMut,
    file: File,
}

impl SharedMemory {
    /// Create an anonymous memfd-backed region. The fd has no close-on-exec
    /// flag so spawned children inherit it.
    pub fn create_anonymous() -> Result<Self> {
        let size = ControlBlock::byte_size();
        let fd = unsafe { libc::memfd_create(c"replay-control".as_ptr(), 0) };
        if fd < 0 {
            return Err(ControlError::MemfdFailed(std::io::Error::last_os_error()).into());
        }
        let file = unsafe { File::from_raw_fd(fd) };
        file.set_len(size as u64).context("Failed to size control block memfd")?;
        Self::map_file(file, size)
    }

    /// Map a region inherited from a parent process. Takes ownership of the
    /// descriptor.
    pub fn from_inherited_fd(fd: RawFd) -> Result<Self> {
        let size = ControlBlock::byte_size();
        let file = unsafe { File::from_raw_fd(fd) };
        let len = file
            .metadata()
            .context("Failed to stat inherited control block fd")?
            .len() as usize;
        if len < size {
            return Err(ControlError::RegionTooSmall { size: len }.into());
        }
        Self::map_file(file, size)
    }

    fn map_file(file: File, size: usize) -> Result<Self> {
        let map = unsafe {
            MmapOptions::new()
                .len(size)
                .map_mut(&file)
                .context("Failed to create control block memory mapping")?
        };
        Ok(Self { map, file })
    }

    /// The descriptor a child must be handed via `--shm-fd`.
    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// View the mapping as a control block. The mapping is page-aligned and
    /// at least `ControlBlock::byte_size()` long, and every field is atomic,
    /// so shared access through `&self` is sound.
    pub fn control_block(&self) -> &ControlBlock {
        unsafe { &*(self.map.as_ptr() as *const ControlBlock) }
    }
}

/// Where a replay run's control block lives.
pub enum ControlRegion {
    /// Cross-process region mapped from a memfd.
    Shared(SharedMemory),
    /// Process-local block for single-process runs and tests.
    Local(Box<ControlBlock>),
}

impl ControlRegion {
    /// Fresh anonymous shared region with an initialized block.
    pub fn create_shared() -> Result<Self> {
        let shm = SharedMemory::create_anonymous()?;
        shm.control_block().initialize();
        Ok(Self::Shared(shm))
    }

    /// Attach to an inherited region. The creator already initialized it.
    pub fn from_inherited_fd(fd: RawFd) -> Result<Self> {
        let shm = SharedMemory::from_inherited_fd(fd)?;
        if !shm.control_block().is_initialized() {
            return Err(ControlError::BadCookie.into());
        }
        Ok(Self::Shared(shm))
    }

    /// Process-local block.
    pub fn new_local() -> Self {
        let block = Box::new(ControlBlock::default());
        block.initialize();
        Self::Local(block)
    }

    pub fn block(&self) -> &ControlBlock {
        match self {
            ControlRegion::Shared(shm) => shm.control_block(),
            ControlRegion::Local(block) => block,
        }
    }

    /// Inheritable fd, when the region is shared.
    pub fn shm_fd(&self) -> Option<RawFd> {
        match self {
            ControlRegion::Shared(shm) => Some(shm.raw_fd()),
            ControlRegion::Local(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_anonymous_region_maps_an_initialized_block() {
        let region = ControlRegion::create_shared().unwrap();
        let block = region.block();
        assert!(block.is_initialized());

        block.successful_graphics.fetch_add(7, Ordering::Relaxed);
        assert_eq!(region.block().snapshot().graphics.completed, 7);
        assert!(region.shm_fd().is_some());
    }

    #[test]
    fn test_inherited_fd_sees_the_same_pages() {
        let region = ControlRegion::create_shared().unwrap();
        region.block().total_graphics.store(42, Ordering::Relaxed);

        // Duplicate the fd the way a child would inherit it.
        let fd = region.shm_fd().unwrap();
        let dup = unsafe { libc::dup(fd) };
        assert!(dup >= 0);

        let attached = ControlRegion::from_inherited_fd(dup).unwrap();
        assert_eq!(attached.block().snapshot().graphics.total, 42);

        attached.block().push_faulty_module(0xdead);
        assert_eq!(region.block().faulty_modules(), vec![0xdead]);
    }

    #[test]
    fn test_local_region_works_without_shared_memory() {
        let region = ControlRegion::new_local();
        assert!(region.block().is_initialized());
        assert!(region.shm_fd().is_none());
    }
}
