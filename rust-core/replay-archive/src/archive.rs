//! Single-file content-addressed archive storage
//!
//! Layout is a 16-byte header followed by a flat sequence of entries:
//!
//! ```text
//! header:  magic [u8; 8], version u32 le, reserved u32 le
//! entry:   tag u8, hash u64 le, raw_len u32 le, stored_len u32 le, payload
//! ```
//!
//! Payloads are zstd-compressed JSON records. The replay core only ever
//! reads; the writer exists for capture tooling and tests.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use serde::Serialize;

use crate::types::{content_hash, Hash, ResourceTag, RESOURCE_COUNT};
use crate::ArchiveError;

/// Archive magic bytes.
pub const ARCHIVE_MAGIC: [u8; 8] = *b"VKREPLAY";
/// Current archive format version.
pub const ARCHIVE_VERSION: u32 = 1;

const HEADER_SIZE: usize = 16;
const ENTRY_HEADER_SIZE: usize = 1 + 8 + 4 + 4;

/// Compression level for stored payloads.
const COMPRESSION_LEVEL: i32 = 3;

/// Raw and stored (compressed) byte sizes of one entry.
#[derive(Debug, Clone, Copy)]
pub struct EntrySizes {
    pub raw: usize,
    pub stored: usize,
}

#[derive(Debug, Clone, Copy)]
struct EntryLocation {
    offset: usize,
    raw_len: usize,
    stored_len: usize,
}

/// Read-only view of an archive file.
pub struct ArchiveReader {
    data: Vec<u8>,
    hash_lists: [Vec<Hash>; RESOURCE_COUNT],
    index: HashMap<(ResourceTag, Hash), EntryLocation>,
    prepared: bool,
}

impl ArchiveReader {
    /// Open an archive file. Call [`ArchiveReader::prepare`] before reading.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ArchiveError> {
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;
        Ok(Self::from_bytes(data))
    }

    /// Wrap an in-memory archive image.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data,
            hash_lists: Default::default(),
            index: HashMap::new(),
            prepared: false,
        }
    }

    /// Validate the header and build the per-tag index. Hash lists preserve
    /// the order entries were appended in; replay depends on that order for
    /// stable pipeline indexing.
    pub fn prepare(&mut self) -> Result<(), ArchiveError> {
        if self.prepared {
            return Ok(());
        }

        if self.data.len() < HEADER_SIZE {
            return Err(ArchiveError::Truncated(self.data.len()));
        }
        if self.data[0..8] != ARCHIVE_MAGIC {
            return Err(ArchiveError::BadMagic);
        }
        let version = read_u32_le(&self.data, 8);
        if version != ARCHIVE_VERSION {
            return Err(ArchiveError::UnsupportedVersion(version));
        }

        let mut offset = HEADER_SIZE;
        while offset < self.data.len() {
            if offset + ENTRY_HEADER_SIZE > self.data.len() {
                return Err(ArchiveError::Truncated(offset));
            }

            let raw_tag = self.data[offset];
            let tag = ResourceTag::from_u8(raw_tag).ok_or(ArchiveError::UnknownTag(raw_tag))?;
            let hash = read_u64_le(&self.data, offset + 1);
            let raw_len = read_u32_le(&self.data, offset + 9) as usize;
            let stored_len = read_u32_le(&self.data, offset + 13) as usize;
            let payload = offset + ENTRY_HEADER_SIZE;

            if payload + stored_len > self.data.len() {
                return Err(ArchiveError::Truncated(offset));
            }

            let location = EntryLocation {
                offset: payload,
                raw_len,
                stored_len,
            };
            if self.index.insert((tag, hash), location).is_none() {
                self.hash_lists[tag as usize].push(hash);
            }

            offset = payload + stored_len;
        }

        tracing::debug!(
            entries = self.index.len(),
            bytes = self.data.len(),
            "archive prepared"
        );
        self.prepared = true;
        Ok(())
    }

    /// Hashes recorded for a tag, in archive order.
    pub fn hash_list(&self, tag: ResourceTag) -> &[Hash] {
        &self.hash_lists[tag as usize]
    }

    /// Raw/stored sizes of one entry, if present.
    pub fn entry_sizes(&self, tag: ResourceTag, hash: Hash) -> Option<EntrySizes> {
        self.index.get(&(tag, hash)).map(|loc| EntrySizes {
            raw: loc.raw_len,
            stored: loc.stored_len,
        })
    }

    /// Read and decompress one entry's payload.
    pub fn read_entry(&self, tag: ResourceTag, hash: Hash) -> Result<Vec<u8>, ArchiveError> {
        let location = self
            .index
            .get(&(tag, hash))
            .ok_or(ArchiveError::MissingEntry { tag, hash })?;

        let stored = &self.data[location.offset..location.offset + location.stored_len];
        let raw = zstd::decode_all(stored)?;
        Ok(raw)
    }
}

/// Append-only archive writer used by capture tooling and tests.
pub struct ArchiveWriter {
    out: BufWriter<File>,
    written: HashMap<(ResourceTag, Hash), ()>,
}

impl ArchiveWriter {
    /// Create (truncate) an archive file and write the header.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, ArchiveError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let mut out = BufWriter::new(file);

        out.write_all(&ARCHIVE_MAGIC)?;
        out.write_all(&ARCHIVE_VERSION.to_le_bytes())?;
        out.write_all(&0u32.to_le_bytes())?;

        Ok(Self {
            out,
            written: HashMap::new(),
        })
    }

    /// Serialize, hash and append one record. Duplicate content for the same
    /// tag is dropped. Returns the record's content hash.
    pub fn write_record<T: Serialize>(
        &mut self,
        tag: ResourceTag,
        record: &T,
    ) -> Result<Hash, ArchiveError> {
        let raw = serde_json::to_vec(record)?;
        let hash = content_hash(&raw);
        self.write_raw_entry(tag, hash, &raw)?;
        Ok(hash)
    }

    /// Append a pre-serialized record under an explicit hash.
    pub fn write_raw_entry(
        &mut self,
        tag: ResourceTag,
        hash: Hash,
        raw: &[u8],
    ) -> Result<(), ArchiveError> {
        if self.written.insert((tag, hash), ()).is_some() {
            return Ok(());
        }

        let stored = zstd::encode_all(raw, COMPRESSION_LEVEL)?;

        self.out.write_all(&[tag as u8])?;
        self.out.write_all(&hash.to_le_bytes())?;
        self.out.write_all(&(raw.len() as u32).to_le_bytes())?;
        self.out.write_all(&(stored.len() as u32).to_le_bytes())?;
        self.out.write_all(&stored)?;
        Ok(())
    }

    /// Flush and close the archive.
    pub fn finish(mut self) -> Result<(), ArchiveError> {
        self.out.flush()?;
        Ok(())
    }
}

fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{SamplerRecord, ShaderModuleRecord};

    fn archive_with_entries() -> (tempfile::TempDir, std::path::PathBuf, Vec<Hash>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.vkr");

        let mut writer = ArchiveWriter::create(&path).unwrap();
        let mut hashes = Vec::new();
        hashes.push(
            writer
                .write_record(ResourceTag::Sampler, &SamplerRecord::default())
                .unwrap(),
        );
        hashes.push(
            writer
                .write_record(
                    ResourceTag::ShaderModule,
                    &ShaderModuleRecord {
                        code: vec![crate::records::SPIRV_MAGIC, 0x0001_0000, 0, 1, 0],
                    },
                )
                .unwrap(),
        );
        writer.finish().unwrap();

        (dir, path, hashes)
    }

    #[test]
    fn test_archive_round_trip() {
        let (_dir, path, hashes) = archive_with_entries();

        let mut reader = ArchiveReader::open(&path).unwrap();
        reader.prepare().unwrap();

        assert_eq!(reader.hash_list(ResourceTag::Sampler), &hashes[..1]);
        assert_eq!(reader.hash_list(ResourceTag::ShaderModule), &hashes[1..]);
        assert!(reader.hash_list(ResourceTag::GraphicsPipeline).is_empty());

        let raw = reader
            .read_entry(ResourceTag::ShaderModule, hashes[1])
            .unwrap();
        let record: ShaderModuleRecord = serde_json::from_slice(&raw).unwrap();
        assert!(record.is_valid_spirv());

        let sizes = reader
            .entry_sizes(ResourceTag::ShaderModule, hashes[1])
            .unwrap();
        assert_eq!(sizes.raw, raw.len());
    }

    #[test]
    fn test_duplicate_entries_are_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dup.vkr");

        let mut writer = ArchiveWriter::create(&path).unwrap();
        let a = writer
            .write_record(ResourceTag::Sampler, &SamplerRecord::default())
            .unwrap();
        let b = writer
            .write_record(ResourceTag::Sampler, &SamplerRecord::default())
            .unwrap();
        writer.finish().unwrap();
        assert_eq!(a, b);

        let mut reader = ArchiveReader::open(&path).unwrap();
        reader.prepare().unwrap();
        assert_eq!(reader.hash_list(ResourceTag::Sampler).len(), 1);
    }

    #[test]
    fn test_bad_magic_and_truncation_are_rejected() {
        let mut reader = ArchiveReader::from_bytes(b"NOTANARC\x01\x00\x00\x00\x00\x00\x00\x00".to_vec());
        assert!(matches!(reader.prepare(), Err(ArchiveError::BadMagic)));

        let mut short = ArchiveReader::from_bytes(b"VKREPLAY".to_vec());
        assert!(matches!(short.prepare(), Err(ArchiveError::Truncated(_))));

        // Valid header, then an entry header promising more payload than
        // the file holds.
        let mut data = Vec::new();
        data.extend_from_slice(&ARCHIVE_MAGIC);
        data.extend_from_slice(&ARCHIVE_VERSION.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.push(ResourceTag::Sampler as u8);
        data.extend_from_slice(&0x1234u64.to_le_bytes());
        data.extend_from_slice(&100u32.to_le_bytes());
        data.extend_from_slice(&100u32.to_le_bytes());
        let mut truncated = ArchiveReader::from_bytes(data);
        assert!(matches!(truncated.prepare(), Err(ArchiveError::Truncated(_))));
    }

    #[test]
    fn test_unsupported_version_is_rejected() {
        let mut data = Vec::new();
        data.extend_from_slice(&ARCHIVE_MAGIC);
        data.extend_from_slice(&99u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());

        let mut reader = ArchiveReader::from_bytes(data);
        assert!(matches!(
            reader.prepare(),
            Err(ArchiveError::UnsupportedVersion(99))
        ));
    }
}
