use std::sync::Arc;
use ash::vk;
use kestrel_core::collections::SmallVec;
use kestrel_rhi_derive::DeviceObject;

use crate::backend::{downcast_native, NativePipeline};
use crate::error::{RhiError, RhiResult};
use crate::pipeline::{ComputePipelineDescriptor, RenderPipelineDescriptor};
use crate::shader::{ShaderModule, ShaderReflection};
use crate::vulkan::conv;
use crate::vulkan::device::{DebuggableObject, RawDevice};
use crate::vulkan::resource::{create_set_layout, VulkanShaderModule};

const DYNAMIC_STATES: [vk::DynamicState; 2] = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];

/// Pipeline with the layout and set layouts it was created against.
#[DeviceObject(handle = pipeline, object_type = PIPELINE)]
pub(crate) struct VulkanPipeline {
    label: String,
    pub(crate) pipeline: vk::Pipeline,
    pub(crate) layout: vk::PipelineLayout,
    set_layouts: SmallVec<[vk::DescriptorSetLayout; 4]>,
    pub(crate) bind_point: vk::PipelineBindPoint,
    pub(crate) push_constant_stages: vk::ShaderStageFlags,
}

/// Layout objects shared by both pipeline kinds. Destroys what it created if dropped early.
struct LayoutParts<'a> {
    device: &'a RawDevice,
    set_layouts: SmallVec<[vk::DescriptorSetLayout; 4]>,
    layout: vk::PipelineLayout,
}

impl<'a> LayoutParts<'a> {
    fn new(device: &'a RawDevice, reflection: &ShaderReflection, push_constant_size: u32, stages: vk::ShaderStageFlags) -> RhiResult<Self> {
        let mut parts = Self {
            device,
            set_layouts: SmallVec::new(),
            layout: vk::PipelineLayout::null(),
        };
        for set in 0..reflection.set_count() {
            let set_layout = create_set_layout(device, &reflection.binding_set_layout(set))?;
            parts.set_layouts.push(set_layout);
        }
        let ranges = [vk::PushConstantRange::default().stage_flags(stages).offset(0).size(push_constant_size)];
        let ranges: &[vk::PushConstantRange] = if push_constant_size > 0 { &ranges } else { &[] };
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&parts.set_layouts)
            .push_constant_ranges(ranges);
        parts.layout = unsafe { device.handle().create_pipeline_layout(&layout_info, None)? };
        Ok(parts)
    }

    fn into_inner(mut self) -> (SmallVec<[vk::DescriptorSetLayout; 4]>, vk::PipelineLayout) {
        let set_layouts = std::mem::take(&mut self.set_layouts);
        let layout = std::mem::replace(&mut self.layout, vk::PipelineLayout::null());
        (set_layouts, layout)
    }
}

impl Drop for LayoutParts<'_> {
    fn drop(&mut self) {
        unsafe {
            if self.layout != vk::PipelineLayout::null() {
                self.device.handle().destroy_pipeline_layout(self.layout, None);
            }
            for &set_layout in &self.set_layouts {
                self.device.handle().destroy_descriptor_set_layout(set_layout, None);
            }
        }
    }
}

fn native_module(module: &ShaderModule) -> RhiResult<&VulkanShaderModule> {
    downcast_native::<VulkanShaderModule>(module.native().as_any(), "shader module")
}

impl VulkanPipeline {
    pub(crate) fn render(device: &Arc<RawDevice>, cache: vk::PipelineCache, desc: &RenderPipelineDescriptor, push_constant_size: u32) -> RhiResult<Self> {
        let push_stages = vk::ShaderStageFlags::ALL_GRAPHICS;
        let parts = LayoutParts::new(device, &desc.reflection(), push_constant_size, push_stages)?;

        let vertex = native_module(&desc.vertex)?;
        let mut stages: SmallVec<[vk::PipelineShaderStageCreateInfo; 2]> = SmallVec::new();
        stages.push(
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex.module)
                .name(&vertex.entry_point),
        );
        if let Some(fragment) = &desc.fragment {
            let fragment = native_module(fragment)?;
            stages.push(
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(vk::ShaderStageFlags::FRAGMENT)
                    .module(fragment.module)
                    .name(&fragment.entry_point),
            );
        }

        let bindings: SmallVec<[vk::VertexInputBindingDescription; 4]> = desc
            .vertex_buffers
            .iter()
            .map(|b| {
                vk::VertexInputBindingDescription::default()
                    .binding(b.binding)
                    .stride(b.stride)
                    .input_rate(conv::input_rate(b.step_mode))
            })
            .collect();
        let attributes: SmallVec<[vk::VertexInputAttributeDescription; 8]> = desc
            .vertex_attributes
            .iter()
            .map(|a| {
                vk::VertexInputAttributeDescription::default()
                    .location(a.location)
                    .binding(a.binding)
                    .format(conv::vertex_format(a.format))
                    .offset(a.offset)
            })
            .collect();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default().topology(conv::topology(desc.topology));
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(desc.rasterization.depth_clamp)
            .polygon_mode(conv::polygon_mode(desc.rasterization.polygon_mode))
            .cull_mode(conv::cull_mode(desc.rasterization.cull_mode))
            .front_face(conv::front_face(desc.rasterization.front_face))
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(conv::sample_count(desc.sample_count));

        let blend_attachments: SmallVec<[vk::PipelineColorBlendAttachmentState; 4]> = desc
            .color_targets
            .iter()
            .map(|target| {
                let state = vk::PipelineColorBlendAttachmentState::default().color_write_mask(conv::color_write_mask(target.write_mask));
                match target.blend {
                    Some(blend) => state
                        .blend_enable(true)
                        .src_color_blend_factor(conv::blend_factor(blend.src_color))
                        .dst_color_blend_factor(conv::blend_factor(blend.dst_color))
                        .color_blend_op(conv::blend_op(blend.color_op))
                        .src_alpha_blend_factor(conv::blend_factor(blend.src_alpha))
                        .dst_alpha_blend_factor(conv::blend_factor(blend.dst_alpha))
                        .alpha_blend_op(conv::blend_op(blend.alpha_op)),
                    None => state,
                }
            })
            .collect();
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&DYNAMIC_STATES);

        let color_formats: SmallVec<[vk::Format; 4]> = desc.color_targets.iter().map(|t| conv::format(t.format)).collect();
        let mut rendering_info = vk::PipelineRenderingCreateInfo::default().color_attachment_formats(&color_formats);
        let depth_stencil = desc.depth_stencil.map(|ds| {
            rendering_info = rendering_info.depth_attachment_format(conv::format(ds.format));
            if ds.format.has_stencil() {
                rendering_info = rendering_info.stencil_attachment_format(conv::format(ds.format));
            }
            vk::PipelineDepthStencilStateCreateInfo::default()
                .depth_test_enable(true)
                .depth_write_enable(ds.depth_write)
                .depth_compare_op(conv::compare_op(ds.depth_compare))
        });

        let mut pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(parts.layout)
            .push_next(&mut rendering_info);
        if let Some(depth_stencil) = &depth_stencil {
            pipeline_info = pipeline_info.depth_stencil_state(depth_stencil);
        }

        let pipeline = unsafe {
            device
                .handle()
                .create_graphics_pipelines(cache, &[pipeline_info], None)
                .map_err(|e| e.1)?[0]
        };
        Self::finish(device, desc.label.clone(), pipeline, parts, vk::PipelineBindPoint::GRAPHICS, push_stages)
    }

    pub(crate) fn compute(device: &Arc<RawDevice>, cache: vk::PipelineCache, desc: &ComputePipelineDescriptor, push_constant_size: u32) -> RhiResult<Self> {
        let push_stages = vk::ShaderStageFlags::COMPUTE;
        let parts = LayoutParts::new(device, desc.shader.reflection(), push_constant_size, push_stages)?;
        let shader = native_module(&desc.shader)?;
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader.module)
            .name(&shader.entry_point);
        let pipeline_info = vk::ComputePipelineCreateInfo::default().stage(stage).layout(parts.layout);
        let pipeline = unsafe {
            device
                .handle()
                .create_compute_pipelines(cache, &[pipeline_info], None)
                .map_err(|e| e.1)?[0]
        };
        Self::finish(device, desc.label.clone(), pipeline, parts, vk::PipelineBindPoint::COMPUTE, push_stages)
    }

    fn finish(
        device: &Arc<RawDevice>,
        label: String,
        pipeline: vk::Pipeline,
        parts: LayoutParts<'_>,
        bind_point: vk::PipelineBindPoint,
        push_constant_stages: vk::ShaderStageFlags,
    ) -> RhiResult<Self> {
        if pipeline == vk::Pipeline::null() {
            return Err(RhiError::Backend(format!("pipeline '{label}': driver returned a null pipeline")));
        }
        let (set_layouts, layout) = parts.into_inner();
        let pipeline = Self {
            label,
            pipeline,
            layout,
            set_layouts,
            bind_point,
            push_constant_stages,
            device: device.clone(),
        };
        pipeline.set_debug_name();
        log::debug!("vulkan pipeline '{}' created.", pipeline.label);
        Ok(pipeline)
    }
}

impl VulkanPipeline {
    #[inline]
    pub(crate) fn set_count(&self) -> usize {
        self.set_layouts.len()
    }
}

impl NativePipeline for VulkanPipeline {}

impl Drop for VulkanPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_pipeline(self.pipeline, None);
            self.device.handle().destroy_pipeline_layout(self.layout, None);
            for &set_layout in &self.set_layouts {
                self.device.handle().destroy_descriptor_set_layout(set_layout, None);
            }
        }
    }
}
