//! On-disk driver pipeline cache
//!
//! A prior run's cache blob is only fed back to the driver when its header
//! matches the live device: same vendor, same device, same cache UUID. Any
//! mismatch discards the file and starts from an empty cache. On shutdown
//! the cache contents are written back; I/O failure is tolerated because the
//! cache is purely an accelerator.

use std::path::{Path, PathBuf};

use crate::device::ReplayDevice;

/// Size of the pipeline cache UUID, `VK_UUID_SIZE`.
pub const CACHE_UUID_SIZE: usize = 16;
/// Size of the standard pipeline cache header: four u32 fields plus UUID.
pub const CACHE_HEADER_SIZE: usize = 16 + CACHE_UUID_SIZE;

const CACHE_HEADER_VERSION_ONE: u32 = 1;

/// Driver cache configuration.
#[derive(Debug, Clone, Default)]
pub struct PipelineCacheConfig {
    pub enabled: bool,
    pub on_disk_path: Option<PathBuf>,
}

/// Validate a cache blob's header against the live device. All fields are
/// little-endian per the Vulkan spec.
pub fn validate_cache_header(
    blob: &[u8],
    vendor_id: u32,
    device_id: u32,
    uuid: &[u8; CACHE_UUID_SIZE],
) -> bool {
    if blob.len() < CACHE_HEADER_SIZE {
        tracing::info!("pipeline cache header is too small");
        return false;
    }

    let read_le = |offset: usize| -> u32 {
        u32::from_le_bytes([
            blob[offset],
            blob[offset + 1],
            blob[offset + 2],
            blob[offset + 3],
        ])
    };

    if read_le(0) != CACHE_HEADER_SIZE as u32 {
        tracing::info!("pipeline cache header length is not as expected");
        return false;
    }
    if read_le(4) != CACHE_HEADER_VERSION_ONE {
        tracing::info!("pipeline cache header version is not 1");
        return false;
    }
    if read_le(8) != vendor_id {
        tracing::info!("pipeline cache vendor id does not match device");
        return false;
    }
    if read_le(12) != device_id {
        tracing::info!("pipeline cache device id does not match device");
        return false;
    }
    if &blob[16..CACHE_HEADER_SIZE] != uuid {
        tracing::info!("pipeline cache UUID does not match device");
        return false;
    }

    true
}

/// A live driver cache object, optionally synchronized to a file.
pub struct DiskPipelineCache {
    handle: u64,
    path: Option<PathBuf>,
}

impl DiskPipelineCache {
    /// Create the driver cache, primed from the on-disk file when it exists
    /// and validates. Returns `None` when caching is disabled or the driver
    /// refuses even an empty cache.
    pub fn open(device: &dyn ReplayDevice, config: &PipelineCacheConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }

        let mut initial_data = Vec::new();
        if let Some(path) = &config.on_disk_path {
            match std::fs::read(path) {
                Ok(blob) if blob.is_empty() => {}
                Ok(blob) => {
                    if validate_cache_header(
                        &blob,
                        device.vendor_id(),
                        device.device_id(),
                        &device.pipeline_cache_uuid(),
                    ) {
                        tracing::info!(
                            path = %path.display(),
                            bytes = blob.len(),
                            "primed pipeline cache from disk"
                        );
                        initial_data = blob;
                    } else {
                        tracing::info!("failed to validate pipeline cache, creating a blank one");
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::warn!(path = %path.display(), "could not read pipeline cache: {err}");
                }
            }
        }

        let handle = match device.create_pipeline_cache(&initial_data) {
            Ok(handle) => handle,
            Err(err) => {
                tracing::error!("failed to create pipeline cache, trying a blank one: {err}");
                match device.create_pipeline_cache(&[]) {
                    Ok(handle) => handle,
                    Err(err) => {
                        tracing::error!("failed to create pipeline cache: {err}");
                        return None;
                    }
                }
            }
        };

        Some(Self {
            handle,
            path: config.on_disk_path.clone(),
        })
    }

    /// Raw cache handle workers pass to pipeline create calls.
    pub fn handle(&self) -> u64 {
        self.handle
    }

    /// Read the cache contents back, persist them, and destroy the cache
    /// object. Write failures are logged and swallowed.
    pub fn flush_and_destroy(self, device: &dyn ReplayDevice) {
        if let Some(path) = &self.path {
            match device.pipeline_cache_data(self.handle) {
                Ok(data) => {
                    if let Err(err) = write_replacing(path, &data) {
                        tracing::error!(
                            path = %path.display(),
                            "failed to write pipeline cache data to disk: {err}"
                        );
                    } else {
                        tracing::info!(
                            path = %path.display(),
                            bytes = data.len(),
                            "flushed pipeline cache to disk"
                        );
                    }
                }
                Err(err) => tracing::error!("failed to read pipeline cache data: {err}"),
            }
        }
        device.destroy_pipeline_cache(self.handle);
    }
}

/// Write through a sibling temp file and rename over the target, so readers
/// never observe a half-written cache.
fn write_replacing(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::{MockDevice, MOCK_CACHE_UUID, MOCK_DEVICE_ID, MOCK_VENDOR_ID};

    fn valid_header() -> Vec<u8> {
        let mut blob = Vec::new();
        blob.extend_from_slice(&(CACHE_HEADER_SIZE as u32).to_le_bytes());
        blob.extend_from_slice(&1u32.to_le_bytes());
        blob.extend_from_slice(&MOCK_VENDOR_ID.to_le_bytes());
        blob.extend_from_slice(&MOCK_DEVICE_ID.to_le_bytes());
        blob.extend_from_slice(&MOCK_CACHE_UUID);
        blob.extend_from_slice(b"opaque payload");
        blob
    }

    #[test]
    fn test_valid_header_is_accepted() {
        let blob = valid_header();
        assert!(validate_cache_header(
            &blob,
            MOCK_VENDOR_ID,
            MOCK_DEVICE_ID,
            &MOCK_CACHE_UUID
        ));
    }

    #[test]
    fn test_header_rejections() {
        let blob = valid_header();

        // Too small.
        assert!(!validate_cache_header(
            &blob[..CACHE_HEADER_SIZE - 1],
            MOCK_VENDOR_ID,
            MOCK_DEVICE_ID,
            &MOCK_CACHE_UUID
        ));

        // Perturbed vendor id.
        assert!(!validate_cache_header(
            &blob,
            MOCK_VENDOR_ID + 1,
            MOCK_DEVICE_ID,
            &MOCK_CACHE_UUID
        ));

        // Perturbed device id.
        assert!(!validate_cache_header(
            &blob,
            MOCK_VENDOR_ID,
            MOCK_DEVICE_ID + 1,
            &MOCK_CACHE_UUID
        ));

        // Wrong version.
        let mut wrong_version = blob.clone();
        wrong_version[4] = 2;
        assert!(!validate_cache_header(
            &wrong_version,
            MOCK_VENDOR_ID,
            MOCK_DEVICE_ID,
            &MOCK_CACHE_UUID
        ));

        // Wrong length field.
        let mut wrong_length = blob.clone();
        wrong_length[0] = CACHE_HEADER_SIZE as u8 + 4;
        assert!(!validate_cache_header(
            &wrong_length,
            MOCK_VENDOR_ID,
            MOCK_DEVICE_ID,
            &MOCK_CACHE_UUID
        ));

        // Wrong UUID.
        let mut wrong_uuid = blob;
        wrong_uuid[16] ^= 0xff;
        assert!(!validate_cache_header(
            &wrong_uuid,
            MOCK_VENDOR_ID,
            MOCK_DEVICE_ID,
            &MOCK_CACHE_UUID
        ));
    }

    #[test]
    fn test_cache_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("driver.cache");
        let device = MockDevice::new();

        // Run 1: no file yet, cache is created empty and flushed.
        let config = PipelineCacheConfig {
            enabled: true,
            on_disk_path: Some(path.clone()),
        };
        let cache = DiskPipelineCache::open(&device, &config).unwrap();
        cache.flush_and_destroy(&device);
        let written = std::fs::read(&path).unwrap();
        assert!(written.len() >= CACHE_HEADER_SIZE);

        // Run 2: the written blob validates against the same device.
        assert!(validate_cache_header(
            &written,
            device.vendor_id(),
            device.device_id(),
            &device.pipeline_cache_uuid()
        ));
        let cache = DiskPipelineCache::open(&device, &config).unwrap();
        cache.flush_and_destroy(&device);

        // Run 3: perturb the stored vendor id; validation must reject it.
        let mut corrupted = std::fs::read(&path).unwrap();
        corrupted[8] ^= 0x01;
        assert!(!validate_cache_header(
            &corrupted,
            device.vendor_id(),
            device.device_id(),
            &device.pipeline_cache_uuid()
        ));
    }

    #[test]
    fn test_disabled_cache_yields_none() {
        let device = MockDevice::new();
        let config = PipelineCacheConfig::default();
        assert!(DiskPipelineCache::open(&device, &config).is_none());
    }
}
