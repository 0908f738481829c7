//! Command pools and translation of encoded passes into Vulkan command buffers.

use std::sync::Arc;
use ash::vk;
use parking_lot::Mutex;
use kestrel_core::collections::SmallVec;
use kestrel_rhi_derive::DeviceObject;

use crate::backend::{downcast_native, NativeCommandBuffer, NativeCommandPool};
use crate::buffer::Buffer;
use crate::encoder::{BlitCommand, ComputeCommand, EncodedPass, PassCommands, RenderCommand, RenderPassDescriptor};
use crate::error::RhiResult;
use crate::pipeline::{ComputePipeline, RenderPipeline};
use crate::shader::ShaderBindingSet;
use crate::texture::{Texture, TextureFormat, TextureRegion};
use crate::vulkan::conv;
use crate::vulkan::device::{DebuggableObject, RawDevice};
use crate::vulkan::pipeline::VulkanPipeline;
use crate::vulkan::resource::{VulkanBindingSet, VulkanBuffer, VulkanTexture};

/// `VkCommandPool` shared by the pool and every command buffer allocated from it.
#[DeviceObject(handle = pool, object_type = COMMAND_POOL)]
pub(crate) struct CommandPoolHandle {
    label: String,
    pool: vk::CommandPool,
    /// Vulkan requires external synchronization of the pool while its buffers record or free.
    guard: Mutex<()>,
}

impl Drop for CommandPoolHandle {
    fn drop(&mut self) {
        unsafe { self.device.handle().destroy_command_pool(self.pool, None) };
    }
}

pub(crate) struct VulkanCommandPool {
    handle: Arc<CommandPoolHandle>,
    allocated: usize,
}

impl VulkanCommandPool {
    pub(crate) fn new(device: &Arc<RawDevice>, queue_family: u32, label: String) -> RhiResult<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe { device.handle().create_command_pool(&create_info, None)? };
        let handle = CommandPoolHandle {
            label,
            pool,
            guard: Mutex::new(()),
            device: device.clone(),
        };
        handle.set_debug_name();
        Ok(Self {
            handle: Arc::new(handle),
            allocated: 0,
        })
    }
}

impl NativeCommandPool for VulkanCommandPool {
    fn allocate(&mut self) -> RhiResult<Box<dyn NativeCommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.handle.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = {
            let _guard = self.handle.guard.lock();
            unsafe { self.handle.device.handle().allocate_command_buffers(&alloc_info)?[0] }
        };
        self.allocated += 1;
        Ok(Box::new(VulkanCommandBuffer {
            pool: self.handle.clone(),
            cmd,
        }))
    }

    fn allocated_count(&self) -> usize {
        self.allocated
    }
}

pub(crate) struct VulkanCommandBuffer {
    pool: Arc<CommandPoolHandle>,
    pub(crate) cmd: vk::CommandBuffer,
}

impl NativeCommandBuffer for VulkanCommandBuffer {
    fn encode(&mut self, pass: &EncodedPass) -> RhiResult<()> {
        let _guard = self.pool.guard.lock();
        let device = self.pool.device.handle();
        unsafe {
            device.reset_command_buffer(self.cmd, vk::CommandBufferResetFlags::empty())?;
            let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.begin_command_buffer(self.cmd, &begin_info)?;
        }

        let recorder = Recorder { device, cmd: self.cmd };
        // Passes of one submission execute in order and see each other's writes.
        recorder.full_barrier();
        let recorded = match &pass.commands {
            PassCommands::Render { descriptor, commands } => recorder.render(descriptor, commands),
            PassCommands::Compute(commands) => recorder.compute(commands),
            PassCommands::Blit(commands) => recorder.blit(commands),
        };
        let ended = unsafe { device.end_command_buffer(self.cmd) };
        recorded?;
        ended?;
        log::trace!("pass '{}' recorded.", pass.label);
        Ok(())
    }
}

impl Drop for VulkanCommandBuffer {
    fn drop(&mut self) {
        let _guard = self.pool.guard.lock();
        unsafe { self.pool.device.handle().free_command_buffers(self.pool.pool, &[self.cmd]) };
    }
}

fn native_buffer(buffer: &Buffer) -> RhiResult<&VulkanBuffer> {
    downcast_native::<VulkanBuffer>(buffer.native().as_any(), "buffer")
}

fn native_texture(texture: &Texture) -> RhiResult<&VulkanTexture> {
    downcast_native::<VulkanTexture>(texture.native().as_any(), "texture")
}

fn clear_color(format: TextureFormat, color: [f32; 4]) -> vk::ClearValue {
    let color = match format {
        TextureFormat::R32Uint => vk::ClearColorValue { uint32: color.map(|c| c.max(0.0) as u32) },
        _ => vk::ClearColorValue { float32: color },
    };
    vk::ClearValue { color }
}

/// Binding sets and push constants recorded before a pipeline is bound, replayed onto it.
#[derive(Default)]
struct BindState<'p> {
    pipeline: Option<&'p VulkanPipeline>,
    sets: SmallVec<[Option<vk::DescriptorSet>; 4]>,
    push_constants: SmallVec<[(u32, &'p [u8]); 2]>,
}

impl<'p> BindState<'p> {
    fn set_pipeline(&mut self, recorder: &Recorder<'_>, pipeline: &'p VulkanPipeline) {
        unsafe { recorder.device.cmd_bind_pipeline(recorder.cmd, pipeline.bind_point, pipeline.pipeline) };
        self.pipeline = Some(pipeline);
        for index in 0..self.sets.len() {
            self.bind_set(recorder, index as u32);
        }
        for (offset, data) in std::mem::take(&mut self.push_constants) {
            self.push(recorder, offset, data);
        }
    }

    fn set_binding_set(&mut self, recorder: &Recorder<'_>, index: u32, set: &ShaderBindingSet) -> RhiResult<()> {
        let set = downcast_native::<VulkanBindingSet>(set.native().as_any(), "binding set")?;
        let slot = index as usize;
        if self.sets.len() <= slot {
            self.sets.resize(slot + 1, None);
        }
        self.sets[slot] = Some(set.set);
        self.bind_set(recorder, index);
        Ok(())
    }

    fn bind_set(&self, recorder: &Recorder<'_>, index: u32) {
        let (Some(pipeline), Some(Some(set))) = (self.pipeline, self.sets.get(index as usize)) else {
            return;
        };
        if index as usize >= pipeline.set_count() {
            log::warn!("binding set {index} is not used by the bound pipeline; skipped");
            return;
        }
        unsafe {
            recorder
                .device
                .cmd_bind_descriptor_sets(recorder.cmd, pipeline.bind_point, pipeline.layout, index, &[*set], &[]);
        }
    }

    fn push(&mut self, recorder: &Recorder<'_>, offset: u32, data: &'p [u8]) {
        match self.pipeline {
            Some(pipeline) => unsafe {
                recorder
                    .device
                    .cmd_push_constants(recorder.cmd, pipeline.layout, pipeline.push_constant_stages, offset, data);
            },
            None => self.push_constants.push((offset, data)),
        }
    }
}

struct Recorder<'a> {
    device: &'a ash::Device,
    cmd: vk::CommandBuffer,
}

impl Recorder<'_> {
    fn full_barrier(&self) {
        let barrier = vk::MemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .dst_access_mask(vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE);
        let barriers = [barrier];
        let dependency = vk::DependencyInfo::default().memory_barriers(&barriers);
        unsafe { self.device.cmd_pipeline_barrier2(self.cmd, &dependency) };
    }

    fn render(&self, descriptor: &RenderPassDescriptor, commands: &[RenderCommand]) -> RhiResult<()> {
        let [width, height] = descriptor.extent();
        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D { width, height },
        };

        let mut color_attachments: SmallVec<[vk::RenderingAttachmentInfo; 4]> = SmallVec::new();
        for attachment in &descriptor.color_attachments {
            let texture = native_texture(&attachment.texture)?;
            color_attachments.push(
                vk::RenderingAttachmentInfo::default()
                    .image_view(texture.view(attachment.mip_level, attachment.array_layer)?)
                    .image_layout(vk::ImageLayout::GENERAL)
                    .load_op(conv::load_op(attachment.load_action))
                    .store_op(conv::store_op(attachment.store_action))
                    .clear_value(clear_color(texture.format(), attachment.clear_color)),
            );
        }

        let depth = match &descriptor.depth_attachment {
            Some(attachment) => {
                let texture = native_texture(&attachment.texture)?;
                let info = vk::RenderingAttachmentInfo::default()
                    .image_view(texture.view(0, 0)?)
                    .image_layout(vk::ImageLayout::GENERAL)
                    .load_op(conv::load_op(attachment.load_action))
                    .store_op(conv::store_op(attachment.store_action))
                    .clear_value(vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue {
                            depth: attachment.clear_depth,
                            stencil: attachment.clear_stencil,
                        },
                    });
                Some((info, texture.format().has_stencil()))
            }
            None => None,
        };

        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(render_area)
            .layer_count(1)
            .color_attachments(&color_attachments);
        if let Some((info, has_stencil)) = &depth {
            rendering_info = rendering_info.depth_attachment(info);
            if *has_stencil {
                rendering_info = rendering_info.stencil_attachment(info);
            }
        }

        unsafe {
            self.device.cmd_begin_rendering(self.cmd, &rendering_info);
            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: width as f32,
                height: height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            self.device.cmd_set_viewport(self.cmd, 0, &[viewport]);
            self.device.cmd_set_scissor(self.cmd, 0, &[render_area]);
        }

        let result = self.render_commands(commands);
        unsafe { self.device.cmd_end_rendering(self.cmd) };
        result
    }

    fn render_commands(&self, commands: &[RenderCommand]) -> RhiResult<()> {
        let mut state = BindState::default();
        for command in commands {
            match command {
                RenderCommand::SetPipeline(pipeline) => state.set_pipeline(self, render_pipeline(pipeline)?),
                RenderCommand::SetViewport(v) => {
                    let viewport = vk::Viewport {
                        x: v.x,
                        y: v.y,
                        width: v.width,
                        height: v.height,
                        min_depth: v.min_depth,
                        max_depth: v.max_depth,
                    };
                    unsafe { self.device.cmd_set_viewport(self.cmd, 0, &[viewport]) };
                }
                RenderCommand::SetScissor(rect) => {
                    let scissor = vk::Rect2D {
                        offset: vk::Offset2D { x: rect.x, y: rect.y },
                        extent: vk::Extent2D { width: rect.width, height: rect.height },
                    };
                    unsafe { self.device.cmd_set_scissor(self.cmd, 0, &[scissor]) };
                }
                RenderCommand::SetVertexBuffer { slot, buffer, offset } => {
                    let buffer = native_buffer(buffer)?;
                    unsafe { self.device.cmd_bind_vertex_buffers(self.cmd, *slot, &[buffer.buffer], &[*offset]) };
                }
                RenderCommand::SetIndexBuffer { buffer, offset, format } => {
                    let buffer = native_buffer(buffer)?;
                    unsafe { self.device.cmd_bind_index_buffer(self.cmd, buffer.buffer, *offset, conv::index_type(*format)) };
                }
                RenderCommand::SetBindingSet { index, set } => state.set_binding_set(self, *index, set)?,
                RenderCommand::PushConstants { offset, data } => state.push(self, *offset, data),
                RenderCommand::Draw { vertex_count, instance_count, first_vertex, first_instance } => unsafe {
                    self.device.cmd_draw(self.cmd, *vertex_count, *instance_count, *first_vertex, *first_instance);
                },
                RenderCommand::DrawIndexed { index_count, instance_count, first_index, vertex_offset, first_instance } => unsafe {
                    self.device
                        .cmd_draw_indexed(self.cmd, *index_count, *instance_count, *first_index, *vertex_offset, *first_instance);
                },
            }
        }
        Ok(())
    }

    fn compute(&self, commands: &[ComputeCommand]) -> RhiResult<()> {
        let mut state = BindState::default();
        for command in commands {
            match command {
                ComputeCommand::SetPipeline(pipeline) => state.set_pipeline(self, compute_pipeline(pipeline)?),
                ComputeCommand::SetBindingSet { index, set } => state.set_binding_set(self, *index, set)?,
                ComputeCommand::PushConstants { offset, data } => state.push(self, *offset, data),
                ComputeCommand::Dispatch { groups: [x, y, z] } => unsafe {
                    self.device.cmd_dispatch(self.cmd, *x, *y, *z);
                },
            }
        }
        Ok(())
    }

    fn blit(&self, commands: &[BlitCommand]) -> RhiResult<()> {
        for (i, command) in commands.iter().enumerate() {
            if i > 0 {
                self.full_barrier();
            }
            match command {
                BlitCommand::CopyBufferToBuffer { src, src_offset, dst, dst_offset, size } => {
                    let region = vk::BufferCopy { src_offset: *src_offset, dst_offset: *dst_offset, size: *size };
                    unsafe {
                        self.device
                            .cmd_copy_buffer(self.cmd, native_buffer(src)?.buffer, native_buffer(dst)?.buffer, &[region]);
                    }
                }
                BlitCommand::CopyBufferToTexture { src, src_offset, bytes_per_row, dst, region } => {
                    let copy = buffer_image_copy(dst.format(), region, *src_offset, *bytes_per_row);
                    unsafe {
                        self.device.cmd_copy_buffer_to_image(
                            self.cmd,
                            native_buffer(src)?.buffer,
                            native_texture(dst)?.image,
                            vk::ImageLayout::GENERAL,
                            &[copy],
                        );
                    }
                }
                BlitCommand::CopyTextureToBuffer { src, region, dst, dst_offset, bytes_per_row } => {
                    let copy = buffer_image_copy(src.format(), region, *dst_offset, *bytes_per_row);
                    unsafe {
                        self.device.cmd_copy_image_to_buffer(
                            self.cmd,
                            native_texture(src)?.image,
                            vk::ImageLayout::GENERAL,
                            native_buffer(dst)?.buffer,
                            &[copy],
                        );
                    }
                }
                BlitCommand::CopyTextureToTexture { src, src_region, dst, dst_mip_level, dst_array_layer, dst_origin } => {
                    let copy = vk::ImageCopy {
                        src_subresource: subresource_layers(src.format(), src_region.mip_level, src_region.array_layer),
                        src_offset: offset3d(src_region.origin),
                        dst_subresource: subresource_layers(dst.format(), *dst_mip_level, *dst_array_layer),
                        dst_offset: offset3d(*dst_origin),
                        extent: extent3d(src_region.extent),
                    };
                    unsafe {
                        self.device.cmd_copy_image(
                            self.cmd,
                            native_texture(src)?.image,
                            vk::ImageLayout::GENERAL,
                            native_texture(dst)?.image,
                            vk::ImageLayout::GENERAL,
                            &[copy],
                        );
                    }
                }
                BlitCommand::FillBuffer { buffer, offset, size, value } => {
                    let word = u32::from_ne_bytes([*value; 4]);
                    unsafe { self.device.cmd_fill_buffer(self.cmd, native_buffer(buffer)?.buffer, *offset, *size, word) };
                }
            }
        }
        Ok(())
    }
}

fn render_pipeline(pipeline: &RenderPipeline) -> RhiResult<&VulkanPipeline> {
    downcast_native::<VulkanPipeline>(pipeline.native().as_any(), "render pipeline")
}

fn compute_pipeline(pipeline: &ComputePipeline) -> RhiResult<&VulkanPipeline> {
    downcast_native::<VulkanPipeline>(pipeline.native().as_any(), "compute pipeline")
}

fn subresource_layers(format: TextureFormat, mip_level: u32, array_layer: u32) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: conv::copy_aspect(format),
        mip_level,
        base_array_layer: array_layer,
        layer_count: 1,
    }
}

fn offset3d([x, y, z]: [u32; 3]) -> vk::Offset3D {
    vk::Offset3D { x: x as i32, y: y as i32, z: z as i32 }
}

fn extent3d([width, height, depth]: [u32; 3]) -> vk::Extent3D {
    vk::Extent3D { width, height, depth }
}

/// Vulkan measures buffer rows in texels, the layer in bytes.
fn buffer_image_copy(format: TextureFormat, region: &TextureRegion, buffer_offset: u64, bytes_per_row: u32) -> vk::BufferImageCopy {
    vk::BufferImageCopy {
        buffer_offset,
        buffer_row_length: bytes_per_row / format.bytes_per_pixel(),
        buffer_image_height: region.extent[1],
        image_subresource: subresource_layers(format, region.mip_level, region.array_layer),
        image_offset: offset3d(region.origin),
        image_extent: extent3d(region.extent),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_rows_are_measured_in_texels() {
        let region = TextureRegion {
            mip_level: 1,
            array_layer: 2,
            origin: [4, 0, 0],
            extent: [8, 3, 1],
        };
        let copy = buffer_image_copy(TextureFormat::Rgba8Unorm, &region, 256, 64);
        assert_eq!(copy.buffer_row_length, 16);
        assert_eq!(copy.buffer_image_height, 3);
        assert_eq!(copy.image_subresource.mip_level, 1);
        assert_eq!(copy.image_subresource.base_array_layer, 2);
        assert_eq!(copy.image_offset.x, 4);
    }

    #[test]
    fn integer_targets_clear_with_integer_values() {
        let value = clear_color(TextureFormat::R32Uint, [7.0, -1.0, 0.0, 1.0]);
        assert_eq!(unsafe { value.color.uint32 }, [7, 0, 0, 1]);
    }
}
