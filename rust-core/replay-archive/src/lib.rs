//! Content-addressed archive of recorded Vulkan pipeline state
//!
//! This crate owns the serialized side of the replayer: the resource tags and
//! 64-bit content hashes that key every record, the on-disk archive format,
//! the creation-descriptor record types, and the decoder that turns an
//! archived blob back into a typed record and hands it to a replay sink.

pub mod archive;
pub mod decoder;
pub mod records;
pub mod types;

// Re-export main types
pub use archive::{ArchiveReader, ArchiveWriter, EntrySizes};
pub use decoder::{RecordDecoder, RecordSink};
pub use types::{content_hash, Hash, ResourceTag, PLAYBACK_ORDER, RESOURCE_COUNT};

/// Error types for the archive system
#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    #[error("archive magic bytes do not match")]
    BadMagic,

    #[error("unsupported archive version {0}")]
    UnsupportedVersion(u32),

    #[error("archive is truncated at offset {0}")]
    Truncated(usize),

    #[error("unknown resource tag {0}")]
    UnknownTag(u8),

    #[error("no entry for tag {tag:?} hash {hash:016x}")]
    MissingEntry { tag: ResourceTag, hash: Hash },

    #[error("record decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
