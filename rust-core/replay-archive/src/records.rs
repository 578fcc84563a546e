//! Creation-descriptor records for every archived resource kind
//!
//! Records are plain owned data: Vulkan enums are stored as their raw `i32`
//! values and bitmasks as raw `u32`, so this crate stays independent of any
//! particular Vulkan binding. The replay side rebuilds real create-info
//! structures from these at creation time.

use serde::{Deserialize, Serialize};

use crate::types::Hash;

/// Pipeline was created with optimization disabled.
pub const PIPELINE_CREATE_DISABLE_OPTIMIZATION: u32 = 1 << 0;
/// Pipeline allows derivative pipelines to be created from it.
pub const PIPELINE_CREATE_ALLOW_DERIVATIVES: u32 = 1 << 1;
/// Pipeline is a derivative: its `base_pipeline` hash names the parent.
pub const PIPELINE_CREATE_DERIVATIVE: u32 = 1 << 2;

/// SPIR-V magic number, first word of every valid module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Application metadata recorded at capture time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplicationInfoRecord {
    pub application_name: Option<String>,
    pub engine_name: Option<String>,
    pub application_version: u32,
    pub engine_version: u32,
    pub api_version: u32,
}

/// Recorded `VkSamplerCreateInfo` state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SamplerRecord {
    pub flags: u32,
    pub mag_filter: i32,
    pub min_filter: i32,
    pub mipmap_mode: i32,
    pub address_mode_u: i32,
    pub address_mode_v: i32,
    pub address_mode_w: i32,
    pub mip_lod_bias: f32,
    pub anisotropy_enable: bool,
    pub max_anisotropy: f32,
    pub compare_enable: bool,
    pub compare_op: i32,
    pub min_lod: f32,
    pub max_lod: f32,
    pub border_color: i32,
    pub unnormalized_coordinates: bool,
}

/// One binding of a descriptor set layout. Immutable samplers are referenced
/// by content hash and resolved against the sampler handle map at replay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DescriptorBindingRecord {
    pub binding: u32,
    pub descriptor_type: i32,
    pub descriptor_count: u32,
    pub stage_flags: u32,
    #[serde(default)]
    pub immutable_samplers: Vec<Hash>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DescriptorSetLayoutRecord {
    pub flags: u32,
    pub bindings: Vec<DescriptorBindingRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushConstantRangeRecord {
    pub stage_flags: u32,
    pub offset: u32,
    pub size: u32,
}

/// Recorded `VkPipelineLayoutCreateInfo` state; set layouts by hash.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineLayoutRecord {
    pub flags: u32,
    pub set_layouts: Vec<Hash>,
    pub push_constant_ranges: Vec<PushConstantRangeRecord>,
}

/// Recorded shader module: raw SPIR-V words.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShaderModuleRecord {
    pub code: Vec<u32>,
}

impl ShaderModuleRecord {
    /// Check the SPIR-V header before handing the words to a driver.
    pub fn is_valid_spirv(&self) -> bool {
        // Header is 5 words: magic, version, generator, bound, schema.
        if self.code.len() < 5 {
            return false;
        }
        self.code[0] == SPIRV_MAGIC
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub flags: u32,
    pub format: i32,
    pub samples: u32,
    pub load_op: i32,
    pub store_op: i32,
    pub stencil_load_op: i32,
    pub stencil_store_op: i32,
    pub initial_layout: i32,
    pub final_layout: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttachmentReferenceRecord {
    pub attachment: u32,
    pub layout: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubpassRecord {
    pub pipeline_bind_point: i32,
    #[serde(default)]
    pub input_attachments: Vec<AttachmentReferenceRecord>,
    #[serde(default)]
    pub color_attachments: Vec<AttachmentReferenceRecord>,
    #[serde(default)]
    pub resolve_attachments: Vec<AttachmentReferenceRecord>,
    #[serde(default)]
    pub depth_stencil_attachment: Option<AttachmentReferenceRecord>,
    #[serde(default)]
    pub preserve_attachments: Vec<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubpassDependencyRecord {
    pub src_subpass: u32,
    pub dst_subpass: u32,
    pub src_stage_mask: u32,
    pub dst_stage_mask: u32,
    pub src_access_mask: u32,
    pub dst_access_mask: u32,
    pub dependency_flags: u32,
}

/// Recorded `VkRenderPassCreateInfo` state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenderPassRecord {
    pub flags: u32,
    pub attachments: Vec<AttachmentRecord>,
    pub subpasses: Vec<SubpassRecord>,
    pub dependencies: Vec<SubpassDependencyRecord>,
}

/// One shader stage of a pipeline; the module is referenced by hash.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: u32,
    pub module: Hash,
    pub entry_point: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VertexBindingRecord {
    pub binding: u32,
    pub stride: u32,
    pub input_rate: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VertexAttributeRecord {
    pub location: u32,
    pub binding: u32,
    pub format: i32,
    pub offset: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VertexInputRecord {
    #[serde(default)]
    pub bindings: Vec<VertexBindingRecord>,
    #[serde(default)]
    pub attributes: Vec<VertexAttributeRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputAssemblyRecord {
    pub topology: i32,
    pub primitive_restart_enable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RasterizationRecord {
    pub depth_clamp_enable: bool,
    pub rasterizer_discard_enable: bool,
    pub polygon_mode: i32,
    pub cull_mode: u32,
    pub front_face: i32,
    pub depth_bias_enable: bool,
    pub depth_bias_constant_factor: f32,
    pub depth_bias_clamp: f32,
    pub depth_bias_slope_factor: f32,
    pub line_width: f32,
}

impl Default for RasterizationRecord {
    fn default() -> Self {
        Self {
            depth_clamp_enable: false,
            rasterizer_discard_enable: false,
            polygon_mode: 0,
            cull_mode: 0,
            front_face: 0,
            depth_bias_enable: false,
            depth_bias_constant_factor: 0.0,
            depth_bias_clamp: 0.0,
            depth_bias_slope_factor: 0.0,
            line_width: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultisampleRecord {
    pub rasterization_samples: u32,
    pub sample_shading_enable: bool,
    pub min_sample_shading: f32,
    pub alpha_to_coverage_enable: bool,
    pub alpha_to_one_enable: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StencilOpStateRecord {
    pub fail_op: i32,
    pub pass_op: i32,
    pub depth_fail_op: i32,
    pub compare_op: i32,
    pub compare_mask: u32,
    pub write_mask: u32,
    pub reference: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DepthStencilRecord {
    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
    pub depth_compare_op: i32,
    pub depth_bounds_test_enable: bool,
    pub stencil_test_enable: bool,
    pub front: StencilOpStateRecord,
    pub back: StencilOpStateRecord,
    pub min_depth_bounds: f32,
    pub max_depth_bounds: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColorBlendAttachmentRecord {
    pub blend_enable: bool,
    pub src_color_blend_factor: i32,
    pub dst_color_blend_factor: i32,
    pub color_blend_op: i32,
    pub src_alpha_blend_factor: i32,
    pub dst_alpha_blend_factor: i32,
    pub alpha_blend_op: i32,
    pub color_write_mask: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColorBlendRecord {
    pub logic_op_enable: bool,
    pub logic_op: i32,
    pub attachments: Vec<ColorBlendAttachmentRecord>,
    pub blend_constants: [f32; 4],
}

/// Recorded `VkGraphicsPipelineCreateInfo` state. Layout, render pass and
/// shader modules are referenced by hash; `base_pipeline` carries the raw
/// parent hash when the DERIVATIVE flag is set and is never resolved by the
/// decoder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphicsPipelineRecord {
    pub flags: u32,
    pub stages: Vec<StageRecord>,
    #[serde(default)]
    pub vertex_input: VertexInputRecord,
    #[serde(default)]
    pub input_assembly: InputAssemblyRecord,
    #[serde(default)]
    pub tessellation_patch_control_points: Option<u32>,
    pub viewport_count: u32,
    pub scissor_count: u32,
    #[serde(default)]
    pub rasterization: RasterizationRecord,
    #[serde(default)]
    pub multisample: MultisampleRecord,
    #[serde(default)]
    pub depth_stencil: Option<DepthStencilRecord>,
    #[serde(default)]
    pub color_blend: ColorBlendRecord,
    #[serde(default)]
    pub dynamic_states: Vec<i32>,
    pub layout: Hash,
    pub render_pass: Hash,
    pub subpass: u32,
    #[serde(default)]
    pub base_pipeline: Hash,
}

/// Recorded `VkComputePipelineCreateInfo` state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComputePipelineRecord {
    pub flags: u32,
    pub stage: StageRecord,
    pub layout: Hash,
    #[serde(default)]
    pub base_pipeline: Hash,
}

impl GraphicsPipelineRecord {
    pub fn is_derivative(&self) -> bool {
        self.flags & PIPELINE_CREATE_DERIVATIVE != 0
    }

    pub fn allows_derivatives(&self) -> bool {
        self.flags & PIPELINE_CREATE_ALLOW_DERIVATIVES != 0
    }
}

impl ComputePipelineRecord {
    pub fn is_derivative(&self) -> bool {
        self.flags & PIPELINE_CREATE_DERIVATIVE != 0
    }

    pub fn allows_derivatives(&self) -> bool {
        self.flags & PIPELINE_CREATE_ALLOW_DERIVATIVES != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spirv_validation() {
        // Too short to even hold a header.
        let short = ShaderModuleRecord { code: vec![SPIRV_MAGIC, 0x0001_0000] };
        assert!(!short.is_valid_spirv());

        // Valid header: magic, version, generator, bound, schema.
        let valid = ShaderModuleRecord {
            code: vec![SPIRV_MAGIC, 0x0001_0000, 0, 1, 0],
        };
        assert!(valid.is_valid_spirv());

        // Wrong magic.
        let bogus = ShaderModuleRecord { code: vec![0xdead_beef, 0, 0, 0, 0] };
        assert!(!bogus.is_valid_spirv());
    }

    #[test]
    fn test_pipeline_flag_queries() {
        let record = GraphicsPipelineRecord {
            flags: PIPELINE_CREATE_DERIVATIVE,
            base_pipeline: 0x1234,
            ..Default::default()
        };
        assert!(record.is_derivative());
        assert!(!record.allows_derivatives());

        let parent = ComputePipelineRecord {
            flags: PIPELINE_CREATE_ALLOW_DERIVATIVES,
            ..Default::default()
        };
        assert!(parent.allows_derivatives());
        assert!(!parent.is_derivative());
    }

    #[test]
    fn test_graphics_record_json_round_trip() {
        let record = GraphicsPipelineRecord {
            flags: PIPELINE_CREATE_ALLOW_DERIVATIVES,
            stages: vec![StageRecord {
                stage: 1, // vertex
                module: 0xabcd,
                entry_point: "main".to_string(),
            }],
            viewport_count: 1,
            scissor_count: 1,
            layout: 0x10,
            render_pass: 0x20,
            subpass: 0,
            ..Default::default()
        };

        let json = serde_json::to_vec(&record).unwrap();
        let back: GraphicsPipelineRecord = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.stages.len(), 1);
        assert_eq!(back.stages[0].module, 0xabcd);
        assert_eq!(back.layout, 0x10);
        assert_eq!(back.base_pipeline, 0);
    }
}
