//! Record decoding into a replay sink
//!
//! The decoder turns an archived blob back into its typed record and invokes
//! the matching sink method. Pipeline parent references are deliberately left
//! as raw hashes: the replay side defers derivative pipelines until their
//! parents exist, so resolving them here would be wrong.

use crate::records::{
    ApplicationInfoRecord, ComputePipelineRecord, DescriptorSetLayoutRecord,
    GraphicsPipelineRecord, PipelineLayoutRecord, RenderPassRecord, SamplerRecord,
    ShaderModuleRecord,
};
use crate::types::{Hash, ResourceTag};
use crate::ArchiveError;

/// Receiver for decoded records.
///
/// The trivial kinds (`create_*`) are expected to be applied immediately on
/// the calling thread; the `enqueue_create_*` kinds may be handed to worker
/// threads. Every method returns `true` on success; a `false` return marks
/// the record as failed but does not stop playback.
pub trait RecordSink {
    fn set_application_info(&mut self, hash: Hash, record: ApplicationInfoRecord) -> bool;

    fn create_sampler(&mut self, hash: Hash, record: SamplerRecord) -> bool;
    fn create_descriptor_set_layout(&mut self, hash: Hash, record: DescriptorSetLayoutRecord)
        -> bool;
    fn create_pipeline_layout(&mut self, hash: Hash, record: PipelineLayoutRecord) -> bool;
    fn create_render_pass(&mut self, hash: Hash, record: RenderPassRecord) -> bool;

    fn enqueue_create_shader_module(&mut self, hash: Hash, record: ShaderModuleRecord) -> bool;
    fn enqueue_create_graphics_pipeline(
        &mut self,
        hash: Hash,
        record: GraphicsPipelineRecord,
    ) -> bool;
    fn enqueue_create_compute_pipeline(
        &mut self,
        hash: Hash,
        record: ComputePipelineRecord,
    ) -> bool;
}

/// Stateless JSON record decoder.
#[derive(Debug, Default)]
pub struct RecordDecoder;

impl RecordDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Decode one blob and feed it to the sink. The `Ok` value is the sink's
    /// success flag; `Err` means the blob itself could not be decoded.
    pub fn parse(
        &self,
        sink: &mut dyn RecordSink,
        tag: ResourceTag,
        hash: Hash,
        bytes: &[u8],
    ) -> Result<bool, ArchiveError> {
        let accepted = match tag {
            ResourceTag::ApplicationInfo => {
                sink.set_application_info(hash, serde_json::from_slice(bytes)?)
            }
            ResourceTag::Sampler => sink.create_sampler(hash, serde_json::from_slice(bytes)?),
            ResourceTag::DescriptorSetLayout => {
                sink.create_descriptor_set_layout(hash, serde_json::from_slice(bytes)?)
            }
            ResourceTag::PipelineLayout => {
                sink.create_pipeline_layout(hash, serde_json::from_slice(bytes)?)
            }
            ResourceTag::RenderPass => {
                sink.create_render_pass(hash, serde_json::from_slice(bytes)?)
            }
            ResourceTag::ShaderModule => {
                sink.enqueue_create_shader_module(hash, serde_json::from_slice(bytes)?)
            }
            ResourceTag::GraphicsPipeline => {
                sink.enqueue_create_graphics_pipeline(hash, serde_json::from_slice(bytes)?)
            }
            ResourceTag::ComputePipeline => {
                sink.enqueue_create_compute_pipeline(hash, serde_json::from_slice(bytes)?)
            }
        };
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::PIPELINE_CREATE_DERIVATIVE;

    #[derive(Default)]
    struct RecordingSink {
        samplers: Vec<Hash>,
        graphics: Vec<(Hash, GraphicsPipelineRecord)>,
        app_info: Option<ApplicationInfoRecord>,
    }

    impl RecordSink for RecordingSink {
        fn set_application_info(&mut self, _hash: Hash, record: ApplicationInfoRecord) -> bool {
            self.app_info = Some(record);
            true
        }

        fn create_sampler(&mut self, hash: Hash, _record: SamplerRecord) -> bool {
            self.samplers.push(hash);
            true
        }

        fn create_descriptor_set_layout(
            &mut self,
            _hash: Hash,
            _record: DescriptorSetLayoutRecord,
        ) -> bool {
            true
        }

        fn create_pipeline_layout(&mut self, _hash: Hash, _record: PipelineLayoutRecord) -> bool {
            true
        }

        fn create_render_pass(&mut self, _hash: Hash, _record: RenderPassRecord) -> bool {
            true
        }

        fn enqueue_create_shader_module(
            &mut self,
            _hash: Hash,
            _record: ShaderModuleRecord,
        ) -> bool {
            true
        }

        fn enqueue_create_graphics_pipeline(
            &mut self,
            hash: Hash,
            record: GraphicsPipelineRecord,
        ) -> bool {
            self.graphics.push((hash, record));
            true
        }

        fn enqueue_create_compute_pipeline(
            &mut self,
            _hash: Hash,
            _record: ComputePipelineRecord,
        ) -> bool {
            true
        }
    }

    #[test]
    fn test_decode_dispatches_by_tag() {
        let decoder = RecordDecoder::new();
        let mut sink = RecordingSink::default();

        let sampler = serde_json::to_vec(&SamplerRecord::default()).unwrap();
        let ok = decoder
            .parse(&mut sink, ResourceTag::Sampler, 0x11, &sampler)
            .unwrap();
        assert!(ok);
        assert_eq!(sink.samplers, vec![0x11]);

        let app = serde_json::to_vec(&ApplicationInfoRecord {
            application_name: Some("demo".into()),
            api_version: 4198400,
            ..Default::default()
        })
        .unwrap();
        decoder
            .parse(&mut sink, ResourceTag::ApplicationInfo, 0x1, &app)
            .unwrap();
        assert_eq!(
            sink.app_info.as_ref().unwrap().application_name.as_deref(),
            Some("demo")
        );
    }

    #[test]
    fn test_derivative_parent_hash_stays_raw() {
        let decoder = RecordDecoder::new();
        let mut sink = RecordingSink::default();

        let record = GraphicsPipelineRecord {
            flags: PIPELINE_CREATE_DERIVATIVE,
            base_pipeline: 0xfeed_f00d,
            ..Default::default()
        };
        let bytes = serde_json::to_vec(&record).unwrap();
        decoder
            .parse(&mut sink, ResourceTag::GraphicsPipeline, 0x77, &bytes)
            .unwrap();

        let (hash, decoded) = &sink.graphics[0];
        assert_eq!(*hash, 0x77);
        assert_eq!(decoded.base_pipeline, 0xfeed_f00d);
    }

    #[test]
    fn test_malformed_blob_is_a_decode_error() {
        let decoder = RecordDecoder::new();
        let mut sink = RecordingSink::default();

        let result = decoder.parse(&mut sink, ResourceTag::Sampler, 0x1, b"not json");
        assert!(matches!(result, Err(ArchiveError::Decode(_))));
        assert!(sink.samplers.is_empty());
    }
}
