//! Device seam: the create/destroy surface replay drives
//!
//! Everything the replayer needs from a graphics device fits behind one
//! trait with raw `u64` handles, which keeps the orchestration logic
//! testable without a GPU. `VulkanDevice` is the real implementation over
//! `ash`; replay never submits work, it only creates and destroys objects.

use std::ffi::{CStr, CString};

use anyhow::{Context, Result};
use ash::vk;
use ash::vk::Handle;

use replay_archive::records::{
    ApplicationInfoRecord, DescriptorSetLayoutRecord, PipelineLayoutRecord, RenderPassRecord,
    SamplerRecord,
};

use crate::work::{ComputePipelineWork, GraphicsPipelineWork};
use crate::ReplayError;

/// The device operations replay consumes. Handles are raw `u64` values;
/// zero is null. Create calls may be issued concurrently from worker
/// threads; Vulkan guarantees that for these entry points.
pub trait ReplayDevice: Send + Sync {
    fn vendor_id(&self) -> u32;
    fn device_id(&self) -> u32;
    fn pipeline_cache_uuid(&self) -> [u8; 16];

    fn create_pipeline_cache(&self, initial_data: &[u8]) -> Result<u64, ReplayError>;
    fn pipeline_cache_data(&self, cache: u64) -> Result<Vec<u8>, ReplayError>;
    fn destroy_pipeline_cache(&self, cache: u64);

    fn create_sampler(&self, record: &SamplerRecord) -> Result<u64, ReplayError>;
    /// `immutable_samplers` carries the resolved sampler handles, one vector
    /// per record binding.
    fn create_descriptor_set_layout(
        &self,
        record: &DescriptorSetLayoutRecord,
        immutable_samplers: &[Vec<u64>],
    ) -> Result<u64, ReplayError>;
    fn create_pipeline_layout(
        &self,
        record: &PipelineLayoutRecord,
        set_layouts: &[u64],
    ) -> Result<u64, ReplayError>;
    fn create_render_pass(&self, record: &RenderPassRecord) -> Result<u64, ReplayError>;
    fn create_shader_module(&self, code: &[u32]) -> Result<u64, ReplayError>;
    fn create_graphics_pipeline(
        &self,
        cache: u64,
        work: &GraphicsPipelineWork,
    ) -> Result<u64, ReplayError>;
    fn create_compute_pipeline(
        &self,
        cache: u64,
        work: &ComputePipelineWork,
    ) -> Result<u64, ReplayError>;

    fn destroy_sampler(&self, handle: u64);
    fn destroy_descriptor_set_layout(&self, handle: u64);
    fn destroy_pipeline_layout(&self, handle: u64);
    fn destroy_render_pass(&self, handle: u64);
    fn destroy_shader_module(&self, handle: u64);
    fn destroy_pipeline(&self, handle: u64);
}

/// Options for bringing up the real device.
#[derive(Debug, Clone, Default)]
pub struct VulkanDeviceOptions {
    /// Index into the enumerated physical devices; first device by default.
    pub device_index: Option<usize>,
    pub enable_validation: bool,
}

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// `ash`-backed device. Owns the instance and logical device for the whole
/// replay; destroyed on drop, after the worker pool has been joined.
pub struct VulkanDevice {
    // Field order doubles as drop order documentation: the device and
    // instance are destroyed explicitly in Drop, entry last.
    device: ash::Device,
    instance: ash::Instance,
    _entry: ash::Entry,
    properties: vk::PhysicalDeviceProperties,
}

impl VulkanDevice {
    /// Create instance, pick a physical device and create the logical
    /// device. `app` carries the recorded application info when the archive
    /// has one.
    pub fn new(opts: &VulkanDeviceOptions, app: Option<&ApplicationInfoRecord>) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }.context("Failed to load Vulkan loader")?;

        let app_name = app
            .and_then(|a| a.application_name.as_deref())
            .map(CString::new)
            .transpose()
            .context("Invalid application name")?;
        let engine_name = app
            .and_then(|a| a.engine_name.as_deref())
            .map(CString::new)
            .transpose()
            .context("Invalid engine name")?;

        let mut app_info = vk::ApplicationInfo::default()
            .application_version(app.map(|a| a.application_version).unwrap_or(0))
            .engine_version(app.map(|a| a.engine_version).unwrap_or(0))
            .api_version(
                app.map(|a| a.api_version)
                    .filter(|v| *v != 0)
                    .unwrap_or(vk::API_VERSION_1_1),
            );
        if let Some(name) = &app_name {
            app_info = app_info.application_name(name);
        }
        if let Some(name) = &engine_name {
            app_info = app_info.engine_name(name);
        }

        let mut layers = Vec::new();
        if opts.enable_validation {
            layers.push(VALIDATION_LAYER.as_ptr());
        }
        let instance_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layers);
        let instance = unsafe { entry.create_instance(&instance_info, None) }
            .context("Failed to create Vulkan instance")?;

        let physical_devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;
        let index = opts.device_index.unwrap_or(0);
        let physical_device = physical_devices.get(index).copied().with_context(|| {
            format!(
                "Device index {index} out of range ({} devices present)",
                physical_devices.len()
            )
        })?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };
        tracing::info!(
            device = %device_name.to_string_lossy(),
            vendor_id = format_args!("{:#06x}", properties.vendor_id),
            device_id = format_args!("{:#06x}", properties.device_id),
            "selected physical device"
        );

        // Replay only creates objects; any one queue family satisfies the
        // requirement that a device owns at least one queue.
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        if queue_families.is_empty() {
            anyhow::bail!("Physical device exposes no queue families");
        }
        let queue_priorities = [1.0f32];
        let queue_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(0)
            .queue_priorities(&queue_priorities);

        let queue_infos = [queue_info];
        let device_info = vk::DeviceCreateInfo::default().queue_create_infos(&queue_infos);
        let device = unsafe { instance.create_device(physical_device, &device_info, None) }
            .context("Failed to create Vulkan device")?;

        Ok(Self {
            device,
            instance,
            _entry: entry,
            properties,
        })
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

impl ReplayDevice for VulkanDevice {
    fn vendor_id(&self) -> u32 {
        self.properties.vendor_id
    }

    fn device_id(&self) -> u32 {
        self.properties.device_id
    }

    fn pipeline_cache_uuid(&self) -> [u8; 16] {
        self.properties.pipeline_cache_uuid
    }

    fn create_pipeline_cache(&self, initial_data: &[u8]) -> Result<u64, ReplayError> {
        let info = vk::PipelineCacheCreateInfo::default().initial_data(initial_data);
        let cache = unsafe { self.device.create_pipeline_cache(&info, None) }?;
        Ok(vk::Handle::as_raw(cache))
    }

    fn pipeline_cache_data(&self, cache: u64) -> Result<Vec<u8>, ReplayError> {
        let data = unsafe {
            self.device
                .get_pipeline_cache_data(vk::PipelineCache::from_raw(cache))
        }?;
        Ok(data)
    }

    fn destroy_pipeline_cache(&self, cache: u64) {
        if cache != 0 {
            unsafe {
                self.device
                    .destroy_pipeline_cache(vk::PipelineCache::from_raw(cache), None);
            }
        }
    }

    fn create_sampler(&self, record: &SamplerRecord) -> Result<u64, ReplayError> {
        let info = vk::SamplerCreateInfo::default()
            .flags(vk::SamplerCreateFlags::from_raw(record.flags))
            .mag_filter(vk::Filter::from_raw(record.mag_filter))
            .min_filter(vk::Filter::from_raw(record.min_filter))
            .mipmap_mode(vk::SamplerMipmapMode::from_raw(record.mipmap_mode))
            .address_mode_u(vk::SamplerAddressMode::from_raw(record.address_mode_u))
            .address_mode_v(vk::SamplerAddressMode::from_raw(record.address_mode_v))
            .address_mode_w(vk::SamplerAddressMode::from_raw(record.address_mode_w))
            .mip_lod_bias(record.mip_lod_bias)
            .anisotropy_enable(record.anisotropy_enable)
            .max_anisotropy(record.max_anisotropy)
            .compare_enable(record.compare_enable)
            .compare_op(vk::CompareOp::from_raw(record.compare_op))
            .min_lod(record.min_lod)
            .max_lod(record.max_lod)
            .border_color(vk::BorderColor::from_raw(record.border_color))
            .unnormalized_coordinates(record.unnormalized_coordinates);

        let sampler = unsafe { self.device.create_sampler(&info, None) }?;
        Ok(vk::Handle::as_raw(sampler))
    }

    fn create_descriptor_set_layout(
        &self,
        record: &DescriptorSetLayoutRecord,
        immutable_samplers: &[Vec<u64>],
    ) -> Result<u64, ReplayError> {
        let sampler_handles: Vec<Vec<vk::Sampler>> = immutable_samplers
            .iter()
            .map(|binding| binding.iter().map(|&raw| vk::Sampler::from_raw(raw)).collect())
            .collect();

        let mut bindings = Vec::with_capacity(record.bindings.len());
        for (binding, samplers) in record.bindings.iter().zip(&sampler_handles) {
            let mut out = vk::DescriptorSetLayoutBinding::default()
                .binding(binding.binding)
                .descriptor_type(vk::DescriptorType::from_raw(binding.descriptor_type))
                .descriptor_count(binding.descriptor_count)
                .stage_flags(vk::ShaderStageFlags::from_raw(binding.stage_flags));
            if !samplers.is_empty() {
                out = out.immutable_samplers(samplers);
            }
            bindings.push(out);
        }

        let info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::from_raw(record.flags))
            .bindings(&bindings);

        let layout = unsafe { self.device.create_descriptor_set_layout(&info, None) }?;
        Ok(vk::Handle::as_raw(layout))
    }

    fn create_pipeline_layout(
        &self,
        record: &PipelineLayoutRecord,
        set_layouts: &[u64],
    ) -> Result<u64, ReplayError> {
        let layouts: Vec<vk::DescriptorSetLayout> = set_layouts
            .iter()
            .map(|&raw| vk::DescriptorSetLayout::from_raw(raw))
            .collect();
        let ranges: Vec<vk::PushConstantRange> = record
            .push_constant_ranges
            .iter()
            .map(|range| vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::from_raw(range.stage_flags),
                offset: range.offset,
                size: range.size,
            })
            .collect();

        let info = vk::PipelineLayoutCreateInfo::default()
            .flags(vk::PipelineLayoutCreateFlags::from_raw(record.flags))
            .set_layouts(&layouts)
            .push_constant_ranges(&ranges);

        let layout = unsafe { self.device.create_pipeline_layout(&info, None) }?;
        Ok(vk::Handle::as_raw(layout))
    }

    fn create_render_pass(&self, record: &RenderPassRecord) -> Result<u64, ReplayError> {
        let attachments: Vec<vk::AttachmentDescription> = record
            .attachments
            .iter()
            .map(|a| vk::AttachmentDescription {
                flags: vk::AttachmentDescriptionFlags::from_raw(a.flags),
                format: vk::Format::from_raw(a.format),
                samples: sample_count(a.samples),
                load_op: vk::AttachmentLoadOp::from_raw(a.load_op),
                store_op: vk::AttachmentStoreOp::from_raw(a.store_op),
                stencil_load_op: vk::AttachmentLoadOp::from_raw(a.stencil_load_op),
                stencil_store_op: vk::AttachmentStoreOp::from_raw(a.stencil_store_op),
                initial_layout: vk::ImageLayout::from_raw(a.initial_layout),
                final_layout: vk::ImageLayout::from_raw(a.final_layout),
            })
            .collect();

        // Reference arrays must outlive the subpass descriptions built from
        // them, so materialize all of them first.
        struct SubpassArrays {
            input: Vec<vk::AttachmentReference>,
            color: Vec<vk::AttachmentReference>,
            resolve: Vec<vk::AttachmentReference>,
            depth_stencil: Option<vk::AttachmentReference>,
            preserve: Vec<u32>,
        }
        let reference = |r: &replay_archive::records::AttachmentReferenceRecord| {
            vk::AttachmentReference {
                attachment: r.attachment,
                layout: vk::ImageLayout::from_raw(r.layout),
            }
        };
        let arrays: Vec<SubpassArrays> = record
            .subpasses
            .iter()
            .map(|subpass| SubpassArrays {
                input: subpass.input_attachments.iter().map(reference).collect(),
                color: subpass.color_attachments.iter().map(reference).collect(),
                resolve: subpass.resolve_attachments.iter().map(reference).collect(),
                depth_stencil: subpass.depth_stencil_attachment.as_ref().map(reference),
                preserve: subpass.preserve_attachments.clone(),
            })
            .collect();

        let mut subpasses = Vec::with_capacity(record.subpasses.len());
        for (subpass, arrays) in record.subpasses.iter().zip(&arrays) {
            let mut out = vk::SubpassDescription::default()
                .pipeline_bind_point(vk::PipelineBindPoint::from_raw(subpass.pipeline_bind_point))
                .input_attachments(&arrays.input)
                .color_attachments(&arrays.color)
                .preserve_attachments(&arrays.preserve);
            if !arrays.resolve.is_empty() {
                out = out.resolve_attachments(&arrays.resolve);
            }
            if let Some(depth) = &arrays.depth_stencil {
                out = out.depth_stencil_attachment(depth);
            }
            subpasses.push(out);
        }

        let dependencies: Vec<vk::SubpassDependency> = record
            .dependencies
            .iter()
            .map(|d| vk::SubpassDependency {
                src_subpass: d.src_subpass,
                dst_subpass: d.dst_subpass,
                src_stage_mask: vk::PipelineStageFlags::from_raw(d.src_stage_mask),
                dst_stage_mask: vk::PipelineStageFlags::from_raw(d.dst_stage_mask),
                src_access_mask: vk::AccessFlags::from_raw(d.src_access_mask),
                dst_access_mask: vk::AccessFlags::from_raw(d.dst_access_mask),
                dependency_flags: vk::DependencyFlags::from_raw(d.dependency_flags),
            })
            .collect();

        let info = vk::RenderPassCreateInfo::default()
            .flags(vk::RenderPassCreateFlags::from_raw(record.flags))
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let render_pass = unsafe { self.device.create_render_pass(&info, None) }?;
        Ok(vk::Handle::as_raw(render_pass))
    }

    fn create_shader_module(&self, code: &[u32]) -> Result<u64, ReplayError> {
        let info = vk::ShaderModuleCreateInfo::default().code(code);
        let module = unsafe { self.device.create_shader_module(&info, None) }?;
        Ok(vk::Handle::as_raw(module))
    }

    fn create_graphics_pipeline(
        &self,
        cache: u64,
        work: &GraphicsPipelineWork,
    ) -> Result<u64, ReplayError> {
        let record = &work.record;

        let entry_points: Vec<CString> = record
            .stages
            .iter()
            .map(|stage| CString::new(stage.entry_point.as_str()).unwrap_or_default())
            .collect();
        let stages: Vec<vk::PipelineShaderStageCreateInfo> = record
            .stages
            .iter()
            .zip(&work.stage_modules)
            .zip(&entry_points)
            .map(|((stage, &module), entry)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(vk::ShaderStageFlags::from_raw(stage.stage))
                    .module(vk::ShaderModule::from_raw(module))
                    .name(entry)
            })
            .collect();

        let vertex_bindings: Vec<vk::VertexInputBindingDescription> = record
            .vertex_input
            .bindings
            .iter()
            .map(|b| vk::VertexInputBindingDescription {
                binding: b.binding,
                stride: b.stride,
                input_rate: vk::VertexInputRate::from_raw(b.input_rate),
            })
            .collect();
        let vertex_attributes: Vec<vk::VertexInputAttributeDescription> = record
            .vertex_input
            .attributes
            .iter()
            .map(|a| vk::VertexInputAttributeDescription {
                location: a.location,
                binding: a.binding,
                format: vk::Format::from_raw(a.format),
                offset: a.offset,
            })
            .collect();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::from_raw(record.input_assembly.topology))
            .primitive_restart_enable(record.input_assembly.primitive_restart_enable);

        let tessellation = vk::PipelineTessellationStateCreateInfo::default()
            .patch_control_points(record.tessellation_patch_control_points.unwrap_or(0));

        // Recorded pipelines either use dynamic viewports or do not care
        // about the static values at compile time; only the counts matter.
        let viewports =
            vec![vk::Viewport::default(); record.viewport_count as usize];
        let scissors = vec![vk::Rect2D::default(); record.scissor_count as usize];
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewports(&viewports)
            .scissors(&scissors);

        let raster = &record.rasterization;
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(raster.depth_clamp_enable)
            .rasterizer_discard_enable(raster.rasterizer_discard_enable)
            .polygon_mode(vk::PolygonMode::from_raw(raster.polygon_mode))
            .cull_mode(vk::CullModeFlags::from_raw(raster.cull_mode))
            .front_face(vk::FrontFace::from_raw(raster.front_face))
            .depth_bias_enable(raster.depth_bias_enable)
            .depth_bias_constant_factor(raster.depth_bias_constant_factor)
            .depth_bias_clamp(raster.depth_bias_clamp)
            .depth_bias_slope_factor(raster.depth_bias_slope_factor)
            .line_width(raster.line_width);

        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(sample_count(record.multisample.rasterization_samples))
            .sample_shading_enable(record.multisample.sample_shading_enable)
            .min_sample_shading(record.multisample.min_sample_shading)
            .alpha_to_coverage_enable(record.multisample.alpha_to_coverage_enable)
            .alpha_to_one_enable(record.multisample.alpha_to_one_enable);

        let stencil_op = |s: &replay_archive::records::StencilOpStateRecord| vk::StencilOpState {
            fail_op: vk::StencilOp::from_raw(s.fail_op),
            pass_op: vk::StencilOp::from_raw(s.pass_op),
            depth_fail_op: vk::StencilOp::from_raw(s.depth_fail_op),
            compare_op: vk::CompareOp::from_raw(s.compare_op),
            compare_mask: s.compare_mask,
            write_mask: s.write_mask,
            reference: s.reference,
        };
        let depth_stencil = match &record.depth_stencil {
            Some(ds) => vk::PipelineDepthStencilStateCreateInfo::default()
                .depth_test_enable(ds.depth_test_enable)
                .depth_write_enable(ds.depth_write_enable)
                .depth_compare_op(vk::CompareOp::from_raw(ds.depth_compare_op))
                .depth_bounds_test_enable(ds.depth_bounds_test_enable)
                .stencil_test_enable(ds.stencil_test_enable)
                .front(stencil_op(&ds.front))
                .back(stencil_op(&ds.back))
                .min_depth_bounds(ds.min_depth_bounds)
                .max_depth_bounds(ds.max_depth_bounds),
            None => vk::PipelineDepthStencilStateCreateInfo::default(),
        };

        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = record
            .color_blend
            .attachments
            .iter()
            .map(|a| vk::PipelineColorBlendAttachmentState {
                blend_enable: a.blend_enable.into(),
                src_color_blend_factor: vk::BlendFactor::from_raw(a.src_color_blend_factor),
                dst_color_blend_factor: vk::BlendFactor::from_raw(a.dst_color_blend_factor),
                color_blend_op: vk::BlendOp::from_raw(a.color_blend_op),
                src_alpha_blend_factor: vk::BlendFactor::from_raw(a.src_alpha_blend_factor),
                dst_alpha_blend_factor: vk::BlendFactor::from_raw(a.dst_alpha_blend_factor),
                alpha_blend_op: vk::BlendOp::from_raw(a.alpha_blend_op),
                color_write_mask: vk::ColorComponentFlags::from_raw(a.color_write_mask),
            })
            .collect();
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(record.color_blend.logic_op_enable)
            .logic_op(vk::LogicOp::from_raw(record.color_blend.logic_op))
            .attachments(&blend_attachments)
            .blend_constants(record.color_blend.blend_constants);

        let dynamic_states: Vec<vk::DynamicState> = record
            .dynamic_states
            .iter()
            .map(|&raw| vk::DynamicState::from_raw(raw))
            .collect();
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let mut info = vk::GraphicsPipelineCreateInfo::default()
            .flags(vk::PipelineCreateFlags::from_raw(record.flags))
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(vk::PipelineLayout::from_raw(work.layout))
            .render_pass(vk::RenderPass::from_raw(work.render_pass))
            .subpass(record.subpass)
            .base_pipeline_handle(vk::Pipeline::from_raw(work.base_pipeline))
            .base_pipeline_index(-1);
        if record.tessellation_patch_control_points.is_some() {
            info = info.tessellation_state(&tessellation);
        }

        let pipelines = unsafe {
            self.device.create_graphics_pipelines(
                vk::PipelineCache::from_raw(cache),
                &[info],
                None,
            )
        }
        .map_err(|(_, result)| ReplayError::Vulkan(result))?;
        Ok(vk::Handle::as_raw(pipelines[0]))
    }

    fn create_compute_pipeline(
        &self,
        cache: u64,
        work: &ComputePipelineWork,
    ) -> Result<u64, ReplayError> {
        let record = &work.record;
        let entry_point = CString::new(record.stage.entry_point.as_str()).unwrap_or_default();

        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::from_raw(record.stage.stage))
            .module(vk::ShaderModule::from_raw(work.stage_module))
            .name(&entry_point);

        let info = vk::ComputePipelineCreateInfo::default()
            .flags(vk::PipelineCreateFlags::from_raw(record.flags))
            .stage(stage)
            .layout(vk::PipelineLayout::from_raw(work.layout))
            .base_pipeline_handle(vk::Pipeline::from_raw(work.base_pipeline))
            .base_pipeline_index(-1);

        let pipelines = unsafe {
            self.device.create_compute_pipelines(
                vk::PipelineCache::from_raw(cache),
                &[info],
                None,
            )
        }
        .map_err(|(_, result)| ReplayError::Vulkan(result))?;
        Ok(vk::Handle::as_raw(pipelines[0]))
    }

    fn destroy_sampler(&self, handle: u64) {
        if handle != 0 {
            unsafe { self.device.destroy_sampler(vk::Sampler::from_raw(handle), None) }
        }
    }

    fn destroy_descriptor_set_layout(&self, handle: u64) {
        if handle != 0 {
            unsafe {
                self.device
                    .destroy_descriptor_set_layout(vk::DescriptorSetLayout::from_raw(handle), None)
            }
        }
    }

    fn destroy_pipeline_layout(&self, handle: u64) {
        if handle != 0 {
            unsafe {
                self.device
                    .destroy_pipeline_layout(vk::PipelineLayout::from_raw(handle), None)
            }
        }
    }

    fn destroy_render_pass(&self, handle: u64) {
        if handle != 0 {
            unsafe {
                self.device
                    .destroy_render_pass(vk::RenderPass::from_raw(handle), None)
            }
        }
    }

    fn destroy_shader_module(&self, handle: u64) {
        if handle != 0 {
            unsafe {
                self.device
                    .destroy_shader_module(vk::ShaderModule::from_raw(handle), None)
            }
        }
    }

    fn destroy_pipeline(&self, handle: u64) {
        if handle != 0 {
            unsafe { self.device.destroy_pipeline(vk::Pipeline::from_raw(handle), None) }
        }
    }
}

fn sample_count(raw: u32) -> vk::SampleCountFlags {
    if raw == 0 {
        vk::SampleCountFlags::TYPE_1
    } else {
        vk::SampleCountFlags::from_raw(raw)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! GPU-free device double for orchestration tests.

    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

    use parking_lot::Mutex;

    use super::*;

    pub const MOCK_VENDOR_ID: u32 = 0x1002;
    pub const MOCK_DEVICE_ID: u32 = 0x73bf;
    pub const MOCK_CACHE_UUID: [u8; 16] = [0x42; 16];

    /// Counts creates, tracks live handles, and can be poisoned to fail any
    /// pipeline whose stages reference a chosen module handle.
    #[derive(Default)]
    pub struct MockDevice {
        next_handle: AtomicU64,
        pub live_handles: Mutex<HashSet<u64>>,
        pub created_samplers: AtomicU32,
        pub created_set_layouts: AtomicU32,
        pub created_pipeline_layouts: AtomicU32,
        pub created_render_passes: AtomicU32,
        pub created_modules: AtomicU32,
        pub created_graphics: AtomicU32,
        pub created_compute: AtomicU32,
        pub poison_module: AtomicU64,
        cache_blob: Mutex<Vec<u8>>,
    }

    impl MockDevice {
        pub fn new() -> Self {
            Self {
                next_handle: AtomicU64::new(1),
                ..Default::default()
            }
        }

        fn fresh_handle(&self) -> u64 {
            let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
            self.live_handles.lock().insert(handle);
            handle
        }

        fn release(&self, handle: u64) {
            if handle != 0 {
                self.live_handles.lock().remove(&handle);
            }
        }

        pub fn live_count(&self) -> usize {
            self.live_handles.lock().len()
        }
    }

    impl ReplayDevice for MockDevice {
        fn vendor_id(&self) -> u32 {
            MOCK_VENDOR_ID
        }

        fn device_id(&self) -> u32 {
            MOCK_DEVICE_ID
        }

        fn pipeline_cache_uuid(&self) -> [u8; 16] {
            MOCK_CACHE_UUID
        }

        fn create_pipeline_cache(&self, initial_data: &[u8]) -> Result<u64, ReplayError> {
            *self.cache_blob.lock() = initial_data.to_vec();
            Ok(self.fresh_handle())
        }

        fn pipeline_cache_data(&self, _cache: u64) -> Result<Vec<u8>, ReplayError> {
            // Shape matches what a real driver returns: the standard header
            // followed by opaque payload.
            let mut data = Vec::new();
            data.extend_from_slice(&32u32.to_le_bytes());
            data.extend_from_slice(&1u32.to_le_bytes());
            data.extend_from_slice(&MOCK_VENDOR_ID.to_le_bytes());
            data.extend_from_slice(&MOCK_DEVICE_ID.to_le_bytes());
            data.extend_from_slice(&MOCK_CACHE_UUID);
            data.extend_from_slice(b"mock-cache-payload");
            Ok(data)
        }

        fn destroy_pipeline_cache(&self, cache: u64) {
            self.release(cache);
        }

        fn create_sampler(&self, _record: &SamplerRecord) -> Result<u64, ReplayError> {
            self.created_samplers.fetch_add(1, Ordering::Relaxed);
            Ok(self.fresh_handle())
        }

        fn create_descriptor_set_layout(
            &self,
            _record: &DescriptorSetLayoutRecord,
            _immutable_samplers: &[Vec<u64>],
        ) -> Result<u64, ReplayError> {
            self.created_set_layouts.fetch_add(1, Ordering::Relaxed);
            Ok(self.fresh_handle())
        }

        fn create_pipeline_layout(
            &self,
            _record: &PipelineLayoutRecord,
            _set_layouts: &[u64],
        ) -> Result<u64, ReplayError> {
            self.created_pipeline_layouts.fetch_add(1, Ordering::Relaxed);
            Ok(self.fresh_handle())
        }

        fn create_render_pass(&self, _record: &RenderPassRecord) -> Result<u64, ReplayError> {
            self.created_render_passes.fetch_add(1, Ordering::Relaxed);
            Ok(self.fresh_handle())
        }

        fn create_shader_module(&self, _code: &[u32]) -> Result<u64, ReplayError> {
            self.created_modules.fetch_add(1, Ordering::Relaxed);
            Ok(self.fresh_handle())
        }

        fn create_graphics_pipeline(
            &self,
            _cache: u64,
            work: &GraphicsPipelineWork,
        ) -> Result<u64, ReplayError> {
            let poison = self.poison_module.load(Ordering::Relaxed);
            if poison != 0 && work.stage_modules.contains(&poison) {
                return Err(ReplayError::Vulkan(ash::vk::Result::ERROR_UNKNOWN));
            }
            self.created_graphics.fetch_add(1, Ordering::Relaxed);
            Ok(self.fresh_handle())
        }

        fn create_compute_pipeline(
            &self,
            _cache: u64,
            work: &ComputePipelineWork,
        ) -> Result<u64, ReplayError> {
            let poison = self.poison_module.load(Ordering::Relaxed);
            if poison != 0 && work.stage_module == poison {
                return Err(ReplayError::Vulkan(ash::vk::Result::ERROR_UNKNOWN));
            }
            self.created_compute.fetch_add(1, Ordering::Relaxed);
            Ok(self.fresh_handle())
        }

        fn destroy_sampler(&self, handle: u64) {
            self.release(handle);
        }

        fn destroy_descriptor_set_layout(&self, handle: u64) {
            self.release(handle);
        }

        fn destroy_pipeline_layout(&self, handle: u64) {
            self.release(handle);
        }

        fn destroy_render_pass(&self, handle: u64) {
            self.release(handle);
        }

        fn destroy_shader_module(&self, handle: u64) {
            self.release(handle);
        }

        fn destroy_pipeline(&self, handle: u64) {
            self.release(handle);
        }
    }
}
