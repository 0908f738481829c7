//! Render, compute and blit command encoders.
//!
//! An encoder mutably borrows its command buffer, so encoders of one buffer are sequential by
//! construction and none can outlive the buffer's recording state. Each encoder owns one
//! native command buffer; `end_encoding` translates the recorded commands into it and appends
//! it to the buffer's finished list.

use std::fmt;
use std::sync::Arc;
use kestrel_core::collections::SmallVec;

use crate::backend::{DeviceLimits, NativeCommandBuffer};
use crate::buffer::{Buffer, BufferUsage, StorageMode};
use crate::command::CommandBuffer;
use crate::error::{RhiError, RhiResult};
use crate::pipeline::{ComputePipeline, RenderPipeline};
use crate::shader::ShaderBindingSet;
use crate::synchronization::{Event, Semaphore, SyncPoint};
use crate::texture::{Texture, TextureRegion, TextureUsage};
use crate::tracker::ResourceTracker;
use crate::utility::check_span;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum LoadAction {
    Load,
    #[default]
    Clear,
    DontCare,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum StoreAction {
    #[default]
    Store,
    DontCare,
}

#[derive(Debug, Clone)]
pub struct ColorAttachment {
    pub texture: Texture,
    pub mip_level: u32,
    pub array_layer: u32,
    pub load_action: LoadAction,
    pub store_action: StoreAction,
    pub clear_color: [f32; 4],
}

impl ColorAttachment {
    pub fn new(texture: &Texture) -> Self {
        Self {
            texture: texture.clone(),
            mip_level: 0,
            array_layer: 0,
            load_action: LoadAction::Clear,
            store_action: StoreAction::Store,
            clear_color: [0.0, 0.0, 0.0, 0.0],
        }
    }

    pub fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.load_action = LoadAction::Clear;
        self.clear_color = color;
        self
    }

    pub fn with_load_action(mut self, action: LoadAction) -> Self {
        self.load_action = action;
        self
    }

    pub fn with_store_action(mut self, action: StoreAction) -> Self {
        self.store_action = action;
        self
    }

    pub fn with_subresource(mut self, mip_level: u32, array_layer: u32) -> Self {
        self.mip_level = mip_level;
        self.array_layer = array_layer;
        self
    }
}

#[derive(Debug, Clone)]
pub struct DepthAttachment {
    pub texture: Texture,
    pub load_action: LoadAction,
    pub store_action: StoreAction,
    pub clear_depth: f32,
    pub clear_stencil: u32,
}

impl DepthAttachment {
    pub fn new(texture: &Texture) -> Self {
        Self {
            texture: texture.clone(),
            load_action: LoadAction::Clear,
            store_action: StoreAction::DontCare,
            clear_depth: 1.0,
            clear_stencil: 0,
        }
    }

    pub fn with_clear_depth(mut self, depth: f32) -> Self {
        self.load_action = LoadAction::Clear;
        self.clear_depth = depth;
        self
    }

    pub fn with_store_action(mut self, action: StoreAction) -> Self {
        self.store_action = action;
        self
    }
}

/// Attachments and actions of one render pass.
#[derive(Debug, Clone, Default)]
pub struct RenderPassDescriptor {
    pub label: String,
    pub color_attachments: SmallVec<[ColorAttachment; 4]>,
    pub depth_attachment: Option<DepthAttachment>,
    /// Render area for passes without attachments.
    pub render_area: Option<[u32; 2]>,
}

impl RenderPassDescriptor {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_owned(),
            ..Default::default()
        }
    }

    pub fn with_color_attachment(mut self, attachment: ColorAttachment) -> Self {
        self.color_attachments.push(attachment);
        self
    }

    pub fn with_depth_attachment(mut self, attachment: DepthAttachment) -> Self {
        self.depth_attachment = Some(attachment);
        self
    }

    pub fn with_render_area(mut self, width: u32, height: u32) -> Self {
        self.render_area = Some([width, height]);
        self
    }

    /// Width and height every attachment shares.
    pub fn extent(&self) -> [u32; 2] {
        if let Some(color) = self.color_attachments.first() {
            let [w, h, _] = color.texture.descriptor().mip_size(color.mip_level);
            return [w, h];
        }
        if let Some(depth) = &self.depth_attachment {
            let desc = depth.texture.descriptor();
            return [desc.width, desc.height];
        }
        self.render_area.unwrap_or([1, 1])
    }

    pub(crate) fn validate(&self, limits: &DeviceLimits, tracker: &Arc<ResourceTracker>) -> RhiResult<()> {
        let invalid = |msg: String| Err(RhiError::invalid_descriptor(format!("render pass '{}': {msg}", self.label)));

        if self.color_attachments.len() as u32 > limits.max_color_attachments {
            return invalid(format!(
                "{} color attachments exceed the device limit of {}",
                self.color_attachments.len(),
                limits.max_color_attachments
            ));
        }

        let extent = self.extent();
        let mut samples = None;
        let mut check_texture = |texture: &Texture, mip_level: u32, array_layer: u32, load: LoadAction, store: StoreAction| {
            let desc = texture.descriptor();
            if !texture.tracking().belongs_to(tracker) {
                return invalid(format!("attachment '{}' belongs to another device", desc.label));
            }
            if !desc.usage.contains(TextureUsage::RenderTarget) {
                return invalid(format!("'{}' was not created with RenderTarget usage", desc.label));
            }
            if mip_level >= desc.mip_levels || array_layer >= desc.array_layers {
                return invalid(format!("'{}' has no mip {mip_level} layer {array_layer}", desc.label));
            }
            let [w, h, _] = desc.mip_size(mip_level);
            if [w, h] != extent {
                return invalid(format!("attachment '{}' is {w}x{h}, expected {}x{}", desc.label, extent[0], extent[1]));
            }
            if *samples.get_or_insert(desc.sample_count) != desc.sample_count {
                return invalid("attachments disagree on sample count".to_owned());
            }
            if desc.storage_mode == StorageMode::Memoryless && (load == LoadAction::Load || store == StoreAction::Store) {
                return invalid(format!("memoryless attachment '{}' can neither load nor store", desc.label));
            }
            Ok(())
        };

        for color in &self.color_attachments {
            if color.texture.format().is_depth() {
                return invalid(format!("depth texture '{}' used as a color attachment", color.texture.label()));
            }
            check_texture(&color.texture, color.mip_level, color.array_layer, color.load_action, color.store_action)?;
        }
        if let Some(depth) = &self.depth_attachment {
            if !depth.texture.format().is_depth() {
                return invalid(format!("'{}' is not a depth texture", depth.texture.label()));
            }
            check_texture(&depth.texture, 0, 0, depth.load_action, depth.store_action)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn new(width: f32, height: f32) -> Self {
        Self { x: 0.0, y: 0.0, width, height, min_depth: 0.0, max_depth: 1.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScissorRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

#[derive(Debug, Clone)]
pub enum RenderCommand {
    SetPipeline(RenderPipeline),
    SetViewport(Viewport),
    SetScissor(ScissorRect),
    SetVertexBuffer { slot: u32, buffer: Buffer, offset: u64 },
    SetIndexBuffer { buffer: Buffer, offset: u64, format: IndexFormat },
    SetBindingSet { index: u32, set: ShaderBindingSet },
    PushConstants { offset: u32, data: Vec<u8> },
    Draw { vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32 },
    DrawIndexed { index_count: u32, instance_count: u32, first_index: u32, vertex_offset: i32, first_instance: u32 },
}

#[derive(Debug, Clone)]
pub enum ComputeCommand {
    SetPipeline(ComputePipeline),
    SetBindingSet { index: u32, set: ShaderBindingSet },
    PushConstants { offset: u32, data: Vec<u8> },
    Dispatch { groups: [u32; 3] },
}

#[derive(Debug, Clone)]
pub enum BlitCommand {
    CopyBufferToBuffer { src: Buffer, src_offset: u64, dst: Buffer, dst_offset: u64, size: u64 },
    CopyBufferToTexture { src: Buffer, src_offset: u64, bytes_per_row: u32, dst: Texture, region: TextureRegion },
    CopyTextureToBuffer { src: Texture, region: TextureRegion, dst: Buffer, dst_offset: u64, bytes_per_row: u32 },
    CopyTextureToTexture { src: Texture, src_region: TextureRegion, dst: Texture, dst_mip_level: u32, dst_array_layer: u32, dst_origin: [u32; 3] },
    FillBuffer { buffer: Buffer, offset: u64, size: u64, value: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassKind {
    Render,
    Compute,
    Blit,
}

#[derive(Debug, Clone)]
pub enum PassCommands {
    Render { descriptor: RenderPassDescriptor, commands: Vec<RenderCommand> },
    Compute(Vec<ComputeCommand>),
    Blit(Vec<BlitCommand>),
}

impl PassCommands {
    pub fn kind(&self) -> PassKind {
        match self {
            PassCommands::Render { .. } => PassKind::Render,
            PassCommands::Compute(_) => PassKind::Compute,
            PassCommands::Blit(_) => PassKind::Blit,
        }
    }
}

/// Everything one encoder recorded, handed to the backend at `end_encoding`.
///
/// The command buffer keeps it until the terminal notification, which keeps every referenced
/// resource alive while the GPU may still use it.
#[derive(Debug, Clone)]
pub struct EncodedPass {
    /// Creation order of the encoder within its command buffer.
    pub index: u32,
    pub label: String,
    pub commands: PassCommands,
}

/// Operations shared by every encoder kind.
pub trait CommandEncoder {
    fn label(&self) -> &str;

    /// Whether the encoder still accepts commands.
    fn is_open(&self) -> bool;

    /// Close the encoder and append its native command buffer to the finished list.
    /// A second call is a no-op.
    fn end_encoding(&mut self) -> RhiResult<()>;

    /// Make the whole submission wait for `event` on the GPU before executing.
    fn wait_event(&mut self, event: &Event);

    /// Signal `event` once the whole submission finished executing.
    fn signal_event(&mut self, event: &Event);

    fn wait_semaphore(&mut self, semaphore: &Semaphore, value: u64);

    fn signal_semaphore(&mut self, semaphore: &Semaphore, value: u64);
}

/// State shared by the three encoder kinds.
struct EncoderCore<'a> {
    command_buffer: &'a mut CommandBuffer,
    native: Option<Box<dyn NativeCommandBuffer>>,
    index: u32,
    label: String,
}

impl<'a> EncoderCore<'a> {
    fn new(command_buffer: &'a mut CommandBuffer, native: Box<dyn NativeCommandBuffer>, index: u32, label: String) -> Self {
        Self {
            command_buffer,
            native: Some(native),
            index,
            label,
        }
    }

    #[inline]
    fn is_open(&self) -> bool {
        self.native.is_some()
    }

    /// Fail fast in debug builds on use after close; drop the call in release builds.
    fn guard(&self, operation: &str) -> bool {
        debug_assert!(self.is_open(), "{operation} recorded on closed encoder '{}'", self.label);
        if !self.is_open() {
            log::error!("{operation} recorded on closed encoder '{}'; ignored", self.label);
        }
        self.is_open()
    }

    fn check(&self, condition: bool, message: impl FnOnce() -> String) -> bool {
        if !condition {
            let message = message();
            debug_assert!(condition, "encoder '{}': {message}", self.label);
            log::error!("encoder '{}': {message}; command ignored", self.label);
        }
        condition
    }

    fn belongs(&self, tracking: &crate::tracker::TrackedAllocation) -> bool {
        tracking.belongs_to(self.command_buffer.tracker())
    }

    fn sync(&mut self, operation: &str, wait: bool, point: SyncPoint) {
        if !self.guard(operation) {
            return;
        }
        if wait {
            self.command_buffer.waits.push(point);
        } else {
            self.command_buffer.signals.push(point);
        }
    }

    #[profiling::function]
    fn finish(&mut self, commands: PassCommands) -> RhiResult<()> {
        let Some(mut native) = self.native.take() else {
            log::debug!("end_encoding called twice on '{}'", self.label);
            return Ok(());
        };
        let pass = EncodedPass {
            index: self.index,
            label: self.label.clone(),
            commands,
        };

        if let Err(err) = native.encode(&pass) {
            self.command_buffer.recycle_native(native);
            return Err(err);
        }
        self.command_buffer.finish_pass(native, pass);
        Ok(())
    }
}

impl Drop for EncoderCore<'_> {
    fn drop(&mut self) {
        if let Some(native) = self.native.take() {
            log::warn!("encoder '{}' dropped without end_encoding; its commands are discarded", self.label);
            self.command_buffer.recycle_native(native);
        }
    }
}

macro_rules! impl_command_encoder {
    ($encoder:ident, $finish:expr) => {
        impl CommandEncoder for $encoder<'_> {
            #[inline]
            fn label(&self) -> &str {
                &self.core.label
            }

            #[inline]
            fn is_open(&self) -> bool {
                self.core.is_open()
            }

            fn end_encoding(&mut self) -> RhiResult<()> {
                if !self.core.is_open() {
                    log::debug!("end_encoding called twice on '{}'", self.core.label);
                    return Ok(());
                }
                let finish: fn(&mut Self) -> PassCommands = $finish;
                let commands = finish(self);
                self.core.finish(commands)
            }

            fn wait_event(&mut self, event: &Event) {
                self.core.sync("wait_event", true, SyncPoint::Event(event.clone()));
            }

            fn signal_event(&mut self, event: &Event) {
                self.core.sync("signal_event", false, SyncPoint::Event(event.clone()));
            }

            fn wait_semaphore(&mut self, semaphore: &Semaphore, value: u64) {
                self.core.sync("wait_semaphore", true, SyncPoint::Semaphore { semaphore: semaphore.clone(), value });
            }

            fn signal_semaphore(&mut self, semaphore: &Semaphore, value: u64) {
                self.core.sync("signal_semaphore", false, SyncPoint::Semaphore { semaphore: semaphore.clone(), value });
            }
        }

        impl fmt::Debug for $encoder<'_> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($encoder))
                    .field("label", &self.core.label)
                    .field("index", &self.core.index)
                    .field("open", &self.core.is_open())
                    .finish()
            }
        }
    };
}

pub struct RenderCommandEncoder<'a> {
    core: EncoderCore<'a>,
    descriptor: RenderPassDescriptor,
    commands: Vec<RenderCommand>,
    pipeline: Option<RenderPipeline>,
    index_buffer: bool,
    draw_count: u32,
}

impl_command_encoder!(RenderCommandEncoder, |encoder| PassCommands::Render {
    descriptor: encoder.descriptor.clone(),
    commands: std::mem::take(&mut encoder.commands),
});

impl<'a> RenderCommandEncoder<'a> {
    pub(crate) fn new(command_buffer: &'a mut CommandBuffer, native: Box<dyn NativeCommandBuffer>, index: u32, descriptor: RenderPassDescriptor) -> Self {
        let label = if descriptor.label.is_empty() { format!("render pass {index}") } else { descriptor.label.clone() };
        Self {
            core: EncoderCore::new(command_buffer, native, index, label),
            descriptor,
            commands: Vec::new(),
            pipeline: None,
            index_buffer: false,
            draw_count: 0,
        }
    }

    #[inline]
    pub fn descriptor(&self) -> &RenderPassDescriptor {
        &self.descriptor
    }

    /// Draws recorded so far.
    #[inline]
    pub fn draw_count(&self) -> u32 {
        self.draw_count
    }

    pub fn set_render_pipeline(&mut self, pipeline: &RenderPipeline) {
        if !self.core.guard("set_render_pipeline") || !self.core.check(self.core.belongs(pipeline.tracking()), || format!("pipeline '{}' belongs to another device", pipeline.label())) {
            return;
        }
        let pass_formats: SmallVec<[_; 4]> = self.descriptor.color_attachments.iter().map(|a| a.texture.format()).collect();
        let pipeline_formats: SmallVec<[_; 4]> = pipeline.descriptor().color_targets.iter().map(|t| t.format).collect();
        if !self.core.check(pass_formats == pipeline_formats, || format!(
            "pipeline '{}' targets {pipeline_formats:?} but the pass has {pass_formats:?}",
            pipeline.label()
        )) {
            return;
        }
        self.pipeline = Some(pipeline.clone());
        self.commands.push(RenderCommand::SetPipeline(pipeline.clone()));
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        if self.core.guard("set_viewport") {
            self.commands.push(RenderCommand::SetViewport(viewport));
        }
    }

    pub fn set_scissor_rect(&mut self, rect: ScissorRect) {
        if self.core.guard("set_scissor_rect") {
            self.commands.push(RenderCommand::SetScissor(rect));
        }
    }

    pub fn set_vertex_buffer(&mut self, slot: u32, buffer: &Buffer, offset: u64) {
        if !self.core.guard("set_vertex_buffer") {
            return;
        }
        let valid = self.core.belongs(buffer.tracking()) && buffer.usage().contains(BufferUsage::Vertex) && offset < buffer.size();
        if self.core.check(valid, || format!("buffer '{}' cannot be bound as vertex buffer at offset {offset}", buffer.label())) {
            self.commands.push(RenderCommand::SetVertexBuffer { slot, buffer: buffer.clone(), offset });
        }
    }

    pub fn set_index_buffer(&mut self, buffer: &Buffer, offset: u64, format: IndexFormat) {
        if !self.core.guard("set_index_buffer") {
            return;
        }
        let valid = self.core.belongs(buffer.tracking()) && buffer.usage().contains(BufferUsage::Index) && offset < buffer.size();
        if self.core.check(valid, || format!("buffer '{}' cannot be bound as index buffer at offset {offset}", buffer.label())) {
            self.index_buffer = true;
            self.commands.push(RenderCommand::SetIndexBuffer { buffer: buffer.clone(), offset, format });
        }
    }

    pub fn set_binding_set(&mut self, index: u32, set: &ShaderBindingSet) {
        if self.core.guard("set_binding_set") && self.core.check(self.core.belongs(set.tracking()), || format!("binding set '{}' belongs to another device", set.label())) {
            self.commands.push(RenderCommand::SetBindingSet { index, set: set.clone() });
        }
    }

    pub fn push_constants(&mut self, offset: u32, data: &[u8]) {
        if !self.core.guard("push_constants") {
            return;
        }
        let size = self.pipeline.as_ref().map_or(0, |p| p.reflection().push_constant_size);
        if self.core.check(offset as usize + data.len() <= size as usize, || format!("push constants {offset}+{} exceed the pipeline block of {size} bytes", data.len())) {
            self.commands.push(RenderCommand::PushConstants { offset, data: data.to_vec() });
        }
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        if self.core.guard("draw") && self.core.check(self.pipeline.is_some(), || "draw without a pipeline".to_owned()) {
            self.draw_count += 1;
            self.commands.push(RenderCommand::Draw { vertex_count, instance_count, first_vertex, first_instance });
        }
    }

    pub fn draw_indexed(&mut self, index_count: u32, instance_count: u32, first_index: u32, vertex_offset: i32, first_instance: u32) {
        if self.core.guard("draw_indexed")
            && self.core.check(self.pipeline.is_some(), || "draw_indexed without a pipeline".to_owned())
            && self.core.check(self.index_buffer, || "draw_indexed without an index buffer".to_owned())
        {
            self.draw_count += 1;
            self.commands.push(RenderCommand::DrawIndexed { index_count, instance_count, first_index, vertex_offset, first_instance });
        }
    }
}

pub struct ComputeCommandEncoder<'a> {
    core: EncoderCore<'a>,
    commands: Vec<ComputeCommand>,
    pipeline: Option<ComputePipeline>,
    dispatch_count: u32,
}

impl_command_encoder!(ComputeCommandEncoder, |encoder| PassCommands::Compute(std::mem::take(&mut encoder.commands)));

impl<'a> ComputeCommandEncoder<'a> {
    pub(crate) fn new(command_buffer: &'a mut CommandBuffer, native: Box<dyn NativeCommandBuffer>, index: u32, label: String) -> Self {
        Self {
            core: EncoderCore::new(command_buffer, native, index, label),
            commands: Vec::new(),
            pipeline: None,
            dispatch_count: 0,
        }
    }

    #[inline]
    pub fn dispatch_count(&self) -> u32 {
        self.dispatch_count
    }

    pub fn set_compute_pipeline(&mut self, pipeline: &ComputePipeline) {
        if self.core.guard("set_compute_pipeline") && self.core.check(self.core.belongs(pipeline.tracking()), || format!("pipeline '{}' belongs to another device", pipeline.label())) {
            self.pipeline = Some(pipeline.clone());
            self.commands.push(ComputeCommand::SetPipeline(pipeline.clone()));
        }
    }

    pub fn set_binding_set(&mut self, index: u32, set: &ShaderBindingSet) {
        if self.core.guard("set_binding_set") && self.core.check(self.core.belongs(set.tracking()), || format!("binding set '{}' belongs to another device", set.label())) {
            self.commands.push(ComputeCommand::SetBindingSet { index, set: set.clone() });
        }
    }

    pub fn push_constants(&mut self, offset: u32, data: &[u8]) {
        if !self.core.guard("push_constants") {
            return;
        }
        let size = self.pipeline.as_ref().map_or(0, |p| p.reflection().push_constant_size);
        if self.core.check(offset as usize + data.len() <= size as usize, || format!("push constants {offset}+{} exceed the pipeline block of {size} bytes", data.len())) {
            self.commands.push(ComputeCommand::PushConstants { offset, data: data.to_vec() });
        }
    }

    pub fn dispatch_threadgroups(&mut self, x: u32, y: u32, z: u32) {
        if self.core.guard("dispatch_threadgroups") && self.core.check(self.pipeline.is_some(), || "dispatch without a pipeline".to_owned()) {
            self.dispatch_count += 1;
            self.commands.push(ComputeCommand::Dispatch { groups: [x, y, z] });
        }
    }
}

pub struct BlitCommandEncoder<'a> {
    core: EncoderCore<'a>,
    commands: Vec<BlitCommand>,
}

impl_command_encoder!(BlitCommandEncoder, |encoder| PassCommands::Blit(std::mem::take(&mut encoder.commands)));

impl<'a> BlitCommandEncoder<'a> {
    pub(crate) fn new(command_buffer: &'a mut CommandBuffer, native: Box<dyn NativeCommandBuffer>, index: u32, label: String) -> Self {
        Self {
            core: EncoderCore::new(command_buffer, native, index, label),
            commands: Vec::new(),
        }
    }

    fn check_buffer(&self, buffer: &Buffer, usage: BufferUsage) -> RhiResult<()> {
        if !self.core.belongs(buffer.tracking()) {
            return Err(RhiError::invalid_descriptor(format!("buffer '{}' belongs to another device", buffer.label())));
        }
        if !buffer.usage().contains(usage) {
            return Err(RhiError::invalid_descriptor(format!("buffer '{}' lacks {usage:?} usage", buffer.label())));
        }
        Ok(())
    }

    fn check_texture(&self, texture: &Texture, usage: TextureUsage, region: &TextureRegion) -> RhiResult<()> {
        if !self.core.belongs(texture.tracking()) {
            return Err(RhiError::invalid_descriptor(format!("texture '{}' belongs to another device", texture.label())));
        }
        if !texture.descriptor().usage.contains(usage) {
            return Err(RhiError::invalid_descriptor(format!("texture '{}' lacks {usage:?} usage", texture.label())));
        }
        if texture.descriptor().storage_mode == StorageMode::Memoryless {
            return Err(RhiError::invalid_descriptor(format!("memoryless texture '{}' cannot be copied", texture.label())));
        }
        region.validate(texture.descriptor())
    }

    /// Bytes a tightly or row-padded image copy touches in a buffer.
    fn linear_footprint(texture: &Texture, region: &TextureRegion, bytes_per_row: u32) -> RhiResult<u64> {
        let bpp = texture.format().bytes_per_pixel();
        let row = region.extent[0] * bpp;
        if bytes_per_row < row || bytes_per_row % bpp != 0 {
            return Err(RhiError::invalid_descriptor(format!(
                "bytes_per_row {bytes_per_row} must be a multiple of {bpp} and at least {row}"
            )));
        }
        let rows = region.extent[1] as u64 * region.extent[2] as u64;
        Ok(bytes_per_row as u64 * (rows - 1) + row as u64)
    }

    fn push(&mut self, operation: &str, command: BlitCommand) -> RhiResult<()> {
        if !self.core.guard(operation) {
            return Err(RhiError::invalid_state(format!("{operation} on a closed encoder")));
        }
        self.commands.push(command);
        Ok(())
    }

    pub fn copy_buffer_to_buffer(&mut self, src: &Buffer, src_offset: u64, dst: &Buffer, dst_offset: u64, size: u64) -> RhiResult<()> {
        self.check_buffer(src, BufferUsage::CopySrc)?;
        self.check_buffer(dst, BufferUsage::CopyDst)?;
        check_span(src_offset, size, src.size(), "copy source")?;
        check_span(dst_offset, size, dst.size(), "copy destination")?;
        if src.ptr_eq(dst) && src_offset < dst_offset + size && dst_offset < src_offset + size {
            return Err(RhiError::invalid_descriptor("overlapping copy within one buffer"));
        }
        self.push("copy_buffer_to_buffer", BlitCommand::CopyBufferToBuffer {
            src: src.clone(),
            src_offset,
            dst: dst.clone(),
            dst_offset,
            size,
        })
    }

    pub fn copy_buffer_to_texture(&mut self, src: &Buffer, src_offset: u64, bytes_per_row: u32, dst: &Texture, region: TextureRegion) -> RhiResult<()> {
        self.check_buffer(src, BufferUsage::CopySrc)?;
        self.check_texture(dst, TextureUsage::CopyDst, &region)?;
        let footprint = Self::linear_footprint(dst, &region, bytes_per_row)?;
        check_span(src_offset, footprint, src.size(), "texture upload source")?;
        self.push("copy_buffer_to_texture", BlitCommand::CopyBufferToTexture {
            src: src.clone(),
            src_offset,
            bytes_per_row,
            dst: dst.clone(),
            region,
        })
    }

    pub fn copy_texture_to_buffer(&mut self, src: &Texture, region: TextureRegion, dst: &Buffer, dst_offset: u64, bytes_per_row: u32) -> RhiResult<()> {
        self.check_texture(src, TextureUsage::CopySrc, &region)?;
        self.check_buffer(dst, BufferUsage::CopyDst)?;
        let footprint = Self::linear_footprint(src, &region, bytes_per_row)?;
        check_span(dst_offset, footprint, dst.size(), "texture readback destination")?;
        self.push("copy_texture_to_buffer", BlitCommand::CopyTextureToBuffer {
            src: src.clone(),
            region,
            dst: dst.clone(),
            dst_offset,
            bytes_per_row,
        })
    }

    pub fn copy_texture_to_texture(&mut self, src: &Texture, src_region: TextureRegion, dst: &Texture, dst_mip_level: u32, dst_array_layer: u32, dst_origin: [u32; 3]) -> RhiResult<()> {
        self.check_texture(src, TextureUsage::CopySrc, &src_region)?;
        let dst_region = TextureRegion {
            mip_level: dst_mip_level,
            array_layer: dst_array_layer,
            origin: dst_origin,
            extent: src_region.extent,
        };
        self.check_texture(dst, TextureUsage::CopyDst, &dst_region)?;
        if src.format() != dst.format() {
            return Err(RhiError::invalid_descriptor(format!(
                "cannot copy {:?} into {:?}",
                src.format(),
                dst.format()
            )));
        }
        if src.ptr_eq(dst) && src_region.mip_level == dst_mip_level && src_region.array_layer == dst_array_layer {
            return Err(RhiError::invalid_descriptor("copy within one subresource"));
        }
        self.push("copy_texture_to_texture", BlitCommand::CopyTextureToTexture {
            src: src.clone(),
            src_region,
            dst: dst.clone(),
            dst_mip_level,
            dst_array_layer,
            dst_origin,
        })
    }

    /// Fill `offset..offset + size` with `value`. Offset and size must be 4-byte aligned.
    pub fn fill_buffer(&mut self, buffer: &Buffer, offset: u64, size: u64, value: u8) -> RhiResult<()> {
        self.check_buffer(buffer, BufferUsage::CopyDst)?;
        check_span(offset, size, buffer.size(), "fill")?;
        if offset % 4 != 0 || size % 4 != 0 {
            return Err(RhiError::invalid_descriptor(format!("fill range {offset}+{size} is not 4-byte aligned")));
        }
        self.push("fill_buffer", BlitCommand::FillBuffer {
            buffer: buffer.clone(),
            offset,
            size,
            value,
        })
    }
}
