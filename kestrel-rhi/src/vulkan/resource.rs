//! Buffers, textures, samplers, shader modules and binding sets backed by Vulkan objects.

use std::ffi::CString;
use std::sync::Arc;
use ash::vk;
use parking_lot::Mutex;
use kestrel_core::collections::hashmap::HashMap;
use kestrel_core::collections::SmallVec;
use kestrel_rhi_derive::DeviceObject;

use crate::backend::{downcast_native, NativeBindingSet, NativeBuffer, NativeSampler, NativeShaderModule, NativeTexture};
use crate::buffer::{BufferDescriptor, StorageMode};
use crate::error::{RhiError, RhiResult};
use crate::sampler::SamplerDescriptor;
use crate::shader::{BindingType, ShaderBindingSetLayout, ShaderModuleDescriptor};
use crate::texture::{TextureDescriptor, TextureDimension, TextureFormat, TextureRegion};
use crate::vulkan::conv;
use crate::vulkan::device::{find_memory_type, set_debug_name_handle, DebuggableObject, RawDevice};

fn memory_flags(mode: StorageMode) -> vk::MemoryPropertyFlags {
    match mode {
        StorageMode::Shared => vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        StorageMode::Private => vk::MemoryPropertyFlags::DEVICE_LOCAL,
        StorageMode::Memoryless => vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::LAZILY_ALLOCATED,
    }
}

/// Resources are shared by every queue family, so no ownership transfers are recorded.
fn sharing_mode(families: &[u32]) -> vk::SharingMode {
    if families.len() > 1 {
        vk::SharingMode::CONCURRENT
    } else {
        vk::SharingMode::EXCLUSIVE
    }
}

fn allocate(device: &RawDevice, requirements: vk::MemoryRequirements, flags: vk::MemoryPropertyFlags, label: &str) -> RhiResult<vk::DeviceMemory> {
    let memory_type_index = find_memory_type(device.memory_properties(), requirements.memory_type_bits, flags)
        .ok_or_else(|| RhiError::OutOfMemory(format!("'{label}': no memory type with {flags:?}")))?;
    let alloc_info = vk::MemoryAllocateInfo::default()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);
    Ok(unsafe { device.handle().allocate_memory(&alloc_info, None)? })
}

/// GPU buffer with its own memory allocation.
#[DeviceObject]
pub(crate) struct VulkanBuffer {
    label: String,
    pub(crate) buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: u64,
    /// Serializes map/unmap of `memory`.
    map_lock: Mutex<()>,
}

impl VulkanBuffer {
    pub(crate) fn new(device: &Arc<RawDevice>, desc: &BufferDescriptor, families: &[u32]) -> RhiResult<Self> {
        let raw = device.handle();
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(conv::buffer_usage(desc.usage))
            .sharing_mode(sharing_mode(families))
            .queue_family_indices(families);
        let buffer = unsafe { raw.create_buffer(&buffer_info, None)? };

        let requirements = unsafe { raw.get_buffer_memory_requirements(buffer) };
        let memory = match allocate(device, requirements, memory_flags(desc.storage_mode), &desc.label) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { raw.destroy_buffer(buffer, None) };
                return Err(err);
            }
        };

        let buf = Self {
            label: desc.label.clone(),
            buffer,
            memory,
            size: desc.size,
            map_lock: Mutex::new(()),
            device: device.clone(),
        };
        unsafe { raw.bind_buffer_memory(buffer, memory, 0)? };
        buf.set_debug_name();
        log::trace!("buffer '{}' created ({} bytes).", desc.label, desc.size);
        Ok(buf)
    }

    fn with_mapped<R>(&self, offset: u64, len: usize, f: impl FnOnce(*mut u8) -> R) -> RhiResult<R> {
        let _guard = self.map_lock.lock();
        // SAFETY: the front end checks the span against the buffer size, and only shared
        // buffers, which live in host-visible coherent memory, reach this path.
        unsafe {
            let ptr = self
                .device
                .handle()
                .map_memory(self.memory, offset, len as vk::DeviceSize, vk::MemoryMapFlags::empty())?;
            let out = f(ptr.cast());
            self.device.handle().unmap_memory(self.memory);
            Ok(out)
        }
    }
}

impl NativeBuffer for VulkanBuffer {
    fn size(&self) -> u64 {
        self.size
    }

    fn write(&self, offset: u64, data: &[u8]) -> RhiResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.with_mapped(offset, data.len(), |ptr| unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
        })
    }

    fn read(&self, offset: u64, out: &mut [u8]) -> RhiResult<()> {
        if out.is_empty() {
            return Ok(());
        }
        let len = out.len();
        self.with_mapped(offset, len, |ptr| unsafe {
            std::ptr::copy_nonoverlapping(ptr.cast_const(), out.as_mut_ptr(), len);
        })
    }
}

impl DebuggableObject for VulkanBuffer {
    fn set_debug_name(&self) {
        set_debug_name_handle(&self.device, self.buffer, vk::ObjectType::BUFFER, &self.label);
        set_debug_name_handle(&self.device, self.memory, vk::ObjectType::DEVICE_MEMORY, &format!("{}.memory", self.label));
    }
}

impl Drop for VulkanBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_buffer(self.buffer, None);
            self.device.handle().free_memory(self.memory, None);
        }
        log::trace!("buffer '{}' destroyed.", self.label);
    }
}

/// Image plus lazily created per-subresource views.
///
/// Every texture lives in `GENERAL` layout from creation on, so passes never track layouts.
#[DeviceObject]
pub(crate) struct VulkanTexture {
    label: String,
    pub(crate) image: vk::Image,
    memory: vk::DeviceMemory,
    format: TextureFormat,
    dimension: TextureDimension,
    mip_levels: u32,
    array_layers: u32,
    linear: bool,
    views: Mutex<HashMap<(u32, u32), vk::ImageView>>,
    map_lock: Mutex<()>,
}

impl VulkanTexture {
    pub(crate) fn new(device: &Arc<RawDevice>, desc: &TextureDescriptor, families: &[u32]) -> RhiResult<Self> {
        // Host access goes through a linear image, which drivers only guarantee for simple shapes.
        let linear = desc.storage_mode == StorageMode::Shared;
        if linear && (desc.dimension != TextureDimension::D2 || desc.mip_levels != 1 || desc.array_layers != 1 || desc.sample_count != 1 || desc.format.is_depth()) {
            return Err(RhiError::DeviceCapability(format!(
                "texture '{}': shared storage needs a single-mip, single-layer, single-sample 2D color texture",
                desc.label
            )));
        }

        let mut usage = conv::texture_usage(desc.usage, desc.format);
        if desc.storage_mode == StorageMode::Memoryless {
            usage |= vk::ImageUsageFlags::TRANSIENT_ATTACHMENT;
        }
        let image_info = vk::ImageCreateInfo::default()
            .image_type(conv::image_type(desc.dimension))
            .format(conv::format(desc.format))
            .extent(vk::Extent3D { width: desc.width, height: desc.height, depth: desc.depth })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(conv::sample_count(desc.sample_count))
            .tiling(if linear { vk::ImageTiling::LINEAR } else { vk::ImageTiling::OPTIMAL })
            .usage(usage)
            .sharing_mode(sharing_mode(families))
            .queue_family_indices(families)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let raw = device.handle();
        let image = unsafe { raw.create_image(&image_info, None)? };
        let requirements = unsafe { raw.get_image_memory_requirements(image) };
        let memory = match allocate(device, requirements, memory_flags(desc.storage_mode), &desc.label) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { raw.destroy_image(image, None) };
                return Err(err);
            }
        };

        let texture = Self {
            label: desc.label.clone(),
            image,
            memory,
            format: desc.format,
            dimension: desc.dimension,
            mip_levels: desc.mip_levels,
            array_layers: desc.array_layers,
            linear,
            views: Mutex::new(HashMap::default()),
            map_lock: Mutex::new(()),
            device: device.clone(),
        };
        unsafe { raw.bind_image_memory(image, memory, 0)? };
        texture.set_debug_name();
        log::trace!("texture '{}' created.", desc.label);
        Ok(texture)
    }

    #[inline]
    pub(crate) fn format(&self) -> TextureFormat {
        self.format
    }

    pub(crate) fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange::default()
            .aspect_mask(conv::aspect(self.format))
            .base_mip_level(0)
            .level_count(self.mip_levels)
            .base_array_layer(0)
            .layer_count(self.array_layers)
    }

    /// Barrier moving the freshly created image into `GENERAL`.
    pub(crate) fn initial_barrier(&self) -> vk::ImageMemoryBarrier2<'static> {
        vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::NONE)
            .src_access_mask(vk::AccessFlags2::NONE)
            .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .dst_access_mask(vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::GENERAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(self.full_range())
    }

    /// View of one mip level of one array layer, created on first use.
    pub(crate) fn view(&self, mip_level: u32, array_layer: u32) -> RhiResult<vk::ImageView> {
        let mut views = self.views.lock();
        if let Some(&view) = views.get(&(mip_level, array_layer)) {
            return Ok(view);
        }
        let range = vk::ImageSubresourceRange::default()
            .aspect_mask(conv::aspect(self.format))
            .base_mip_level(mip_level)
            .level_count(1)
            .base_array_layer(array_layer)
            .layer_count(1);
        let info = vk::ImageViewCreateInfo::default()
            .image(self.image)
            .view_type(conv::view_type(self.dimension))
            .format(conv::format(self.format))
            .subresource_range(range);
        let view = unsafe { self.device.handle().create_image_view(&info, None)? };
        set_debug_name_handle(&self.device, view, vk::ObjectType::IMAGE_VIEW, &format!("{}.view[{mip_level}][{array_layer}]", self.label));
        views.insert((mip_level, array_layer), view);
        Ok(view)
    }

    /// View of every subresource, used for shader bindings.
    pub(crate) fn whole_view(&self) -> RhiResult<vk::ImageView> {
        if self.mip_levels == 1 && self.array_layers == 1 {
            return self.view(0, 0);
        }
        let mut views = self.views.lock();
        if let Some(&view) = views.get(&(u32::MAX, u32::MAX)) {
            return Ok(view);
        }
        let view_type = match (self.dimension, self.array_layers > 1) {
            (TextureDimension::D1, true) => vk::ImageViewType::TYPE_1D_ARRAY,
            (TextureDimension::D2, true) => vk::ImageViewType::TYPE_2D_ARRAY,
            (dimension, _) => conv::view_type(dimension),
        };
        let info = vk::ImageViewCreateInfo::default()
            .image(self.image)
            .view_type(view_type)
            .format(conv::format(self.format))
            .subresource_range(self.full_range());
        let view = unsafe { self.device.handle().create_image_view(&info, None)? };
        views.insert((u32::MAX, u32::MAX), view);
        Ok(view)
    }
}

impl NativeTexture for VulkanTexture {
    fn read_region(&self, region: &TextureRegion, out: &mut [u8]) -> RhiResult<()> {
        if !self.linear {
            return Err(RhiError::invalid_state(format!("texture '{}' is not host accessible", self.label)));
        }
        let subresource = vk::ImageSubresource::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .mip_level(0)
            .array_layer(0);
        let layout = unsafe { self.device.handle().get_image_subresource_layout(self.image, subresource) };
        let bpp = u64::from(self.format.bytes_per_pixel());
        let row_len = (u64::from(region.extent[0]) * bpp) as usize;

        let _guard = self.map_lock.lock();
        // SAFETY: linear images only come from shared storage, which is host-visible and coherent;
        // the front end validated the region against the texture extent.
        unsafe {
            let base = self
                .device
                .handle()
                .map_memory(self.memory, layout.offset, layout.size, vk::MemoryMapFlags::empty())?
                .cast::<u8>();
            for row in 0..region.extent[1] {
                let src = u64::from(region.origin[1] + row) * layout.row_pitch + u64::from(region.origin[0]) * bpp;
                let dst = row as usize * row_len;
                std::ptr::copy_nonoverlapping(base.add(src as usize).cast_const(), out[dst..dst + row_len].as_mut_ptr(), row_len);
            }
            self.device.handle().unmap_memory(self.memory);
        }
        Ok(())
    }
}

impl DebuggableObject for VulkanTexture {
    fn set_debug_name(&self) {
        set_debug_name_handle(&self.device, self.image, vk::ObjectType::IMAGE, &self.label);
        set_debug_name_handle(&self.device, self.memory, vk::ObjectType::DEVICE_MEMORY, &format!("{}.memory", self.label));
    }
}

impl Drop for VulkanTexture {
    fn drop(&mut self) {
        unsafe {
            for (_, view) in self.views.get_mut().drain() {
                self.device.handle().destroy_image_view(view, None);
            }
            self.device.handle().destroy_image(self.image, None);
            self.device.handle().free_memory(self.memory, None);
        }
        log::trace!("texture '{}' destroyed.", self.label);
    }
}

#[DeviceObject(handle = sampler, object_type = SAMPLER)]
pub(crate) struct VulkanSampler {
    label: String,
    pub(crate) sampler: vk::Sampler,
}

impl VulkanSampler {
    pub(crate) fn new(device: &Arc<RawDevice>, desc: &SamplerDescriptor) -> RhiResult<Self> {
        let mut info = vk::SamplerCreateInfo::default()
            .mag_filter(conv::filter(desc.mag_filter))
            .min_filter(conv::filter(desc.min_filter))
            .mipmap_mode(conv::mipmap_mode(desc.mipmap_filter))
            .address_mode_u(conv::address_mode(desc.address_mode_u))
            .address_mode_v(conv::address_mode(desc.address_mode_v))
            .address_mode_w(conv::address_mode(desc.address_mode_w))
            .min_lod(desc.lod_min_clamp)
            .max_lod(desc.lod_max_clamp)
            .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK);
        if desc.max_anisotropy > 1.0 {
            info = info.anisotropy_enable(true).max_anisotropy(desc.max_anisotropy);
        }
        if let Some(compare) = desc.compare {
            info = info.compare_enable(true).compare_op(conv::compare_op(compare));
        }
        let sampler = unsafe { device.handle().create_sampler(&info, None)? };
        let sampler = Self {
            label: desc.label.clone(),
            sampler,
            device: device.clone(),
        };
        sampler.set_debug_name();
        Ok(sampler)
    }
}

impl NativeSampler for VulkanSampler {}

impl Drop for VulkanSampler {
    fn drop(&mut self) {
        unsafe { self.device.handle().destroy_sampler(self.sampler, None) };
    }
}

#[DeviceObject(handle = module, object_type = SHADER_MODULE)]
pub(crate) struct VulkanShaderModule {
    label: String,
    pub(crate) module: vk::ShaderModule,
    pub(crate) entry_point: CString,
}

impl VulkanShaderModule {
    pub(crate) fn new(device: &Arc<RawDevice>, desc: &ShaderModuleDescriptor) -> RhiResult<Self> {
        let entry_point = CString::new(desc.entry_point.as_str())
            .map_err(|_| RhiError::invalid_descriptor(format!("shader '{}': entry point contains NUL", desc.label)))?;
        let info = vk::ShaderModuleCreateInfo::default().code(&desc.bytecode);
        let module = unsafe { device.handle().create_shader_module(&info, None)? };
        let module = Self {
            label: desc.label.clone(),
            module,
            entry_point,
            device: device.clone(),
        };
        module.set_debug_name();
        Ok(module)
    }
}

impl NativeShaderModule for VulkanShaderModule {}

impl Drop for VulkanShaderModule {
    fn drop(&mut self) {
        unsafe { self.device.handle().destroy_shader_module(self.module, None) };
    }
}

/// Descriptor set layout built from binding metadata.
pub(crate) fn create_set_layout(device: &RawDevice, layout: &ShaderBindingSetLayout) -> RhiResult<vk::DescriptorSetLayout> {
    let bindings: SmallVec<[vk::DescriptorSetLayoutBinding; 16]> = layout
        .bindings()
        .iter()
        .map(|b| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(b.binding)
                .descriptor_type(conv::descriptor_type(b.binding_type))
                .descriptor_count(b.count)
                .stage_flags(conv::shader_stages(b.stages))
        })
        .collect();
    let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
    Ok(unsafe { device.handle().create_descriptor_set_layout(&info, None)? })
}

/// One descriptor set with its own pool and layout.
#[DeviceObject(handle = set, object_type = DESCRIPTOR_SET)]
pub(crate) struct VulkanBindingSet {
    label: String,
    layout: ShaderBindingSetLayout,
    set_layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    pub(crate) set: vk::DescriptorSet,
}

impl VulkanBindingSet {
    pub(crate) fn new(device: &Arc<RawDevice>, label: String, layout: &ShaderBindingSetLayout) -> RhiResult<Self> {
        let raw = device.handle();
        let set_layout = create_set_layout(device, layout)?;

        let mut sizes: HashMap<vk::DescriptorType, u32> = HashMap::default();
        for binding in layout.bindings() {
            *sizes.entry(conv::descriptor_type(binding.binding_type)).or_default() += binding.count;
        }
        let pool_sizes: SmallVec<[vk::DescriptorPoolSize; 5]> = sizes
            .into_iter()
            .map(|(ty, descriptor_count)| vk::DescriptorPoolSize { ty, descriptor_count })
            .collect();
        let pool_info = vk::DescriptorPoolCreateInfo::default().max_sets(1).pool_sizes(&pool_sizes);
        let pool = match unsafe { raw.create_descriptor_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(err) => {
                unsafe { raw.destroy_descriptor_set_layout(set_layout, None) };
                return Err(err.into());
            }
        };

        let set_layouts = [set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&set_layouts);
        let set = match unsafe { raw.allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => sets[0],
            Err(err) => {
                unsafe {
                    raw.destroy_descriptor_pool(pool, None);
                    raw.destroy_descriptor_set_layout(set_layout, None);
                }
                return Err(err.into());
            }
        };

        let binding_set = Self {
            label,
            layout: layout.clone(),
            set_layout,
            pool,
            set,
            device: device.clone(),
        };
        binding_set.set_debug_name();
        Ok(binding_set)
    }

    fn binding_type(&self, binding: u32) -> RhiResult<BindingType> {
        self.layout
            .get_binding(binding)
            .map(|b| b.binding_type)
            .ok_or_else(|| RhiError::invalid_state(format!("binding set '{}' has no binding {binding}", self.label)))
    }

    fn write(&self, binding: u32, array_index: u32, ty: BindingType, buffer_info: Option<vk::DescriptorBufferInfo>, image_info: Option<vk::DescriptorImageInfo>) {
        let buffer_infos = buffer_info.map(|info| [info]);
        let image_infos = image_info.map(|info| [info]);
        let mut write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(binding)
            .dst_array_element(array_index)
            .descriptor_type(conv::descriptor_type(ty));
        if let Some(infos) = &buffer_infos {
            write = write.buffer_info(infos);
        }
        if let Some(infos) = &image_infos {
            write = write.image_info(infos);
        }
        unsafe { self.device.handle().update_descriptor_sets(&[write], &[]) };
    }
}

impl NativeBindingSet for VulkanBindingSet {
    fn write_buffer(&self, binding: u32, array_index: u32, buffer: &dyn NativeBuffer, offset: u64, length: u64) -> RhiResult<()> {
        let ty = self.binding_type(binding)?;
        let buffer = downcast_native::<VulkanBuffer>(buffer.as_any(), "buffer")?;
        let info = vk::DescriptorBufferInfo::default().buffer(buffer.buffer).offset(offset).range(length);
        self.write(binding, array_index, ty, Some(info), None);
        Ok(())
    }

    fn write_texture(&self, binding: u32, array_index: u32, texture: &dyn NativeTexture) -> RhiResult<()> {
        let ty = self.binding_type(binding)?;
        let texture = downcast_native::<VulkanTexture>(texture.as_any(), "texture")?;
        let info = vk::DescriptorImageInfo::default()
            .image_view(texture.whole_view()?)
            .image_layout(vk::ImageLayout::GENERAL);
        self.write(binding, array_index, ty, None, Some(info));
        Ok(())
    }

    fn write_sampler(&self, binding: u32, array_index: u32, sampler: &dyn NativeSampler) -> RhiResult<()> {
        let ty = self.binding_type(binding)?;
        let sampler = downcast_native::<VulkanSampler>(sampler.as_any(), "sampler")?;
        let info = vk::DescriptorImageInfo::default().sampler(sampler.sampler);
        self.write(binding, array_index, ty, None, Some(info));
        Ok(())
    }
}

impl Drop for VulkanBindingSet {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_descriptor_pool(self.pool, None);
            self.device.handle().destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}
