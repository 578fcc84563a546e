//! Resource tags and content hashing

use serde::{Deserialize, Serialize};

/// Stable content-addressed identifier for every archived resource.
///
/// Inside serialized pipeline records the same value doubles as a sentinel
/// "handle": a derivative pipeline stores its parent's hash where a runtime
/// handle would otherwise go, so records can refer to parents that have not
/// been created yet. Zero is the null hash/handle.
pub type Hash = u64;

/// Resource kinds an archive can hold, in tag-numbering order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResourceTag {
    ApplicationInfo = 0,
    Sampler = 1,
    DescriptorSetLayout = 2,
    PipelineLayout = 3,
    ShaderModule = 4,
    RenderPass = 5,
    GraphicsPipeline = 6,
    ComputePipeline = 7,
}

/// Number of resource tags.
pub const RESOURCE_COUNT: usize = 8;

/// Replay order for the tags. Shader modules go right after the application
/// info so workers can chew on them while the main thread replays the
/// trivial kinds inline; pipelines come last, after every dependency kind.
pub const PLAYBACK_ORDER: [ResourceTag; RESOURCE_COUNT] = [
    ResourceTag::ApplicationInfo,
    ResourceTag::ShaderModule,
    ResourceTag::Sampler,
    ResourceTag::DescriptorSetLayout,
    ResourceTag::PipelineLayout,
    ResourceTag::RenderPass,
    ResourceTag::GraphicsPipeline,
    ResourceTag::ComputePipeline,
];

impl ResourceTag {
    /// All tags in numbering order.
    pub const ALL: [ResourceTag; RESOURCE_COUNT] = [
        ResourceTag::ApplicationInfo,
        ResourceTag::Sampler,
        ResourceTag::DescriptorSetLayout,
        ResourceTag::PipelineLayout,
        ResourceTag::ShaderModule,
        ResourceTag::RenderPass,
        ResourceTag::GraphicsPipeline,
        ResourceTag::ComputePipeline,
    ];

    /// Decode a tag byte from an archive entry header.
    pub fn from_u8(raw: u8) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    /// Human-readable tag name for reports.
    pub fn name(&self) -> &'static str {
        match self {
            ResourceTag::ApplicationInfo => "application info",
            ResourceTag::Sampler => "sampler",
            ResourceTag::DescriptorSetLayout => "descriptor set layout",
            ResourceTag::PipelineLayout => "pipeline layout",
            ResourceTag::ShaderModule => "shader module",
            ResourceTag::RenderPass => "render pass",
            ResourceTag::GraphicsPipeline => "graphics pipeline",
            ResourceTag::ComputePipeline => "compute pipeline",
        }
    }
}

/// Compute the content hash of a serialized record.
pub fn content_hash(bytes: &[u8]) -> Hash {
    let digest = blake3::hash(bytes);

    // Use first 8 bytes of the Blake3 hash as u64
    let b = digest.as_bytes();
    u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_round_trip() {
        for tag in ResourceTag::ALL {
            assert_eq!(ResourceTag::from_u8(tag as u8), Some(tag));
        }
        assert_eq!(ResourceTag::from_u8(RESOURCE_COUNT as u8), None);
    }

    #[test]
    fn test_playback_order_covers_every_tag() {
        let mut seen = [false; RESOURCE_COUNT];
        for tag in PLAYBACK_ORDER {
            seen[tag as usize] = true;
        }
        assert!(seen.iter().all(|s| *s));

        // Pipelines replay last, after all of their dependency kinds.
        assert_eq!(PLAYBACK_ORDER[RESOURCE_COUNT - 2], ResourceTag::GraphicsPipeline);
        assert_eq!(PLAYBACK_ORDER[RESOURCE_COUNT - 1], ResourceTag::ComputePipeline);
    }

    #[test]
    fn test_content_hash_is_stable_and_discriminating() {
        let a = content_hash(b"some serialized record");
        let b = content_hash(b"some serialized record");
        let c = content_hash(b"a different record");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, 0);
    }
}
