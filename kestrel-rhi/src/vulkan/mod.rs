//! Vulkan 1.3 backend.
//!
//! Headless: no surface or swapchain. Passes are recorded with dynamic rendering and
//! synchronization2, every texture stays in `GENERAL` layout, and each pass starts with a full
//! memory barrier, so encoders never track resource state. Events map to binary semaphores,
//! semaphores to timeline semaphores, and the layer's pipeline cache blob is the driver's
//! `VkPipelineCache` data.

mod command;
mod conv;
pub(crate) mod device;
mod pipeline;
mod queue;
mod resource;
mod sync;

use std::ffi::{CStr, CString};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use ash::{vk, Entry, Instance};
use parking_lot::Mutex;
use kestrel_core::collections::hashmap::HashMap;
use kestrel_core::collections::SmallVec;

use crate::backend::{
    AdapterInfo, AdapterType, BackendKind, DeviceBackend, DeviceLimits, FenceProvider, MemoryTypeInfo, NativeBindingSet,
    NativeBuffer, NativeEvent, NativePipeline, NativeSampler, NativeSemaphore, NativeShaderModule, NativeTexture,
    QueueBackend, QueueFamilyInfo,
};
use crate::buffer::BufferDescriptor;
use crate::config::DeviceConfig;
use crate::error::{RhiError, RhiResult};
use crate::pipeline::{ComputePipelineDescriptor, RenderPipelineDescriptor};
use crate::sampler::SamplerDescriptor;
use crate::shader::{ShaderBindingSetLayout, ShaderModuleDescriptor};
use crate::texture::TextureDescriptor;

use self::device::{set_debug_name_handle, RawDevice};
use self::pipeline::VulkanPipeline;
use self::queue::VulkanQueue;
use self::resource::{VulkanBindingSet, VulkanBuffer, VulkanSampler, VulkanShaderModule, VulkanTexture};
use self::sync::{VulkanEvent, VulkanFenceProvider, VulkanSemaphore};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Scoring weights for physical device selection.
const SCORE_DISCRETE_GPU: u32 = 10000;
const SCORE_INTEGRATED_GPU: u32 = 1000;
const SCORE_PER_GB_VRAM: u32 = 100;
const SCORE_VULKAN_1_4: u32 = 600;
const SCORE_VULKAN_1_3: u32 = 400;

impl From<vk::Result> for RhiError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                RhiError::OutOfMemory(format!("{result:?}"))
            }
            vk::Result::ERROR_DEVICE_LOST => RhiError::DeviceLost,
            other => RhiError::Backend(format!("{other:?}")),
        }
    }
}

/// Blocking one-off submissions on the first queue, used for initial image layouts.
struct ImmediateContext {
    pool: vk::CommandPool,
    fence: vk::Fence,
    queue: Arc<Mutex<vk::Queue>>,
}

impl ImmediateContext {
    fn new(raw: &RawDevice, family: u32, queue: Arc<Mutex<vk::Queue>>) -> RhiResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = unsafe { raw.handle().create_command_pool(&pool_info, None)? };
        let fence = match unsafe { raw.handle().create_fence(&vk::FenceCreateInfo::default(), None) } {
            Ok(fence) => fence,
            Err(err) => {
                unsafe { raw.handle().destroy_command_pool(pool, None) };
                return Err(err.into());
            }
        };
        set_debug_name_handle(raw, pool, vk::ObjectType::COMMAND_POOL, "immediate command pool");
        Ok(Self { pool, fence, queue })
    }

    /// Record commands and submit immediately, blocking until the GPU finishes.
    fn submit_and_wait(&self, raw: &RawDevice, record: impl FnOnce(&ash::Device, vk::CommandBuffer)) -> RhiResult<()> {
        let device = raw.handle();
        unsafe {
            device.reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())?;
            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(self.pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let cmd = device.allocate_command_buffers(&alloc_info)?[0];
            let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.begin_command_buffer(cmd, &begin_info)?;
            record(device, cmd);
            device.end_command_buffer(cmd)?;

            let cmd_info = vk::CommandBufferSubmitInfo::default().command_buffer(cmd);
            let submit_info = vk::SubmitInfo2::default().command_buffer_infos(std::slice::from_ref(&cmd_info));
            {
                let queue = self.queue.lock();
                device.queue_submit2(*queue, &[submit_info], self.fence)?;
            }
            device.wait_for_fences(&[self.fence], true, u64::MAX)?;
            device.reset_fences(&[self.fence])?;
            device.free_command_buffers(self.pool, &[cmd]);
        }
        Ok(())
    }

    fn destroy(&self, raw: &RawDevice) {
        unsafe {
            raw.handle().destroy_fence(self.fence, None);
            raw.handle().destroy_command_pool(self.pool, None);
        }
    }
}

/// A Vulkan physical device with one logical device over every queue it exposes.
pub struct VulkanDevice {
    raw: Arc<RawDevice>,
    adapter: AdapterInfo,
    limits: DeviceLimits,
    memory_types: Vec<MemoryTypeInfo>,
    families: Vec<QueueFamilyInfo>,
    family_indices: SmallVec<[u32; 4]>,
    queues: HashMap<(u32, u32), Arc<Mutex<vk::Queue>>>,
    next_queue: HashMap<u32, AtomicU32>,
    fences: Arc<VulkanFenceProvider>,
    pipeline_cache: Mutex<vk::PipelineCache>,
    immediate: Mutex<ImmediateContext>,
}

impl VulkanDevice {
    /// Load the Vulkan loader, pick the best adapter and create the logical device.
    #[profiling::function]
    pub fn new(config: &DeviceConfig) -> RhiResult<Self> {
        let entry = unsafe { Entry::load() }.map_err(|err| RhiError::Fatal(format!("failed to load the Vulkan loader: {err}")))?;
        let validation = config.validation && has_validation_layer(&entry);
        if config.validation && !validation {
            log::warn!("validation requested but {} is not installed", VALIDATION_LAYER.to_string_lossy());
        }

        let instance = create_instance(&entry, &config.application_name, validation)
            .map_err(|err| RhiError::Fatal(format!("vkCreateInstance failed: {err:?}")))?;
        let messenger = if validation {
            match setup_debug_messenger(&entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(err) => {
                    log::warn!("failed to create the debug messenger: {err:?}");
                    None
                }
            }
        } else {
            None
        };

        let selected = match select_physical_device(&instance) {
            Ok(selected) => selected,
            Err(err) => {
                unsafe {
                    if let Some((debug_utils, messenger)) = &messenger {
                        debug_utils.destroy_debug_utils_messenger(*messenger, None);
                    }
                    instance.destroy_instance(None);
                }
                return Err(err);
            }
        };
        let device = match create_logical_device(&instance, &selected) {
            Ok(device) => device,
            Err(err) => {
                unsafe {
                    if let Some((debug_utils, messenger)) = &messenger {
                        debug_utils.destroy_debug_utils_messenger(*messenger, None);
                    }
                    instance.destroy_instance(None);
                }
                return Err(RhiError::Fatal(format!("vkCreateDevice failed: {err:?}")));
            }
        };
        let raw = Arc::new(RawDevice::new(entry, instance, selected.handle, device, messenger));

        let mut queues = HashMap::default();
        let mut next_queue = HashMap::default();
        for family in &selected.families {
            for index in 0..family.queue_count {
                let queue = unsafe { raw.handle().get_device_queue(family.index, index) };
                queues.insert((family.index, index), Arc::new(Mutex::new(queue)));
            }
            next_queue.insert(family.index, AtomicU32::new(0));
        }
        let first_family = selected.families[0].index;
        let immediate = ImmediateContext::new(&raw, first_family, queues[&(first_family, 0)].clone())?;

        let cache_info = vk::PipelineCacheCreateInfo::default();
        let pipeline_cache = match unsafe { raw.handle().create_pipeline_cache(&cache_info, None) } {
            Ok(cache) => cache,
            Err(err) => {
                immediate.destroy(&raw);
                return Err(err.into());
            }
        };

        let properties = &selected.properties;
        let adapter = AdapterInfo {
            name: selected.name.clone(),
            adapter_type: adapter_type(properties.device_type),
            vendor_id: properties.vendor_id,
            device_id: properties.device_id,
            driver_version: properties.driver_version,
            pipeline_cache_uuid: properties.pipeline_cache_uuid,
        };
        log::info!(
            "vulkan adapter '{}' (api {}.{}.{}, {} queue families)",
            adapter.name,
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version),
            selected.families.len()
        );

        Ok(Self {
            limits: map_limits(&properties.limits),
            memory_types: map_memory_types(raw.memory_properties()),
            family_indices: selected.families.iter().map(|f| f.index).collect(),
            families: selected.families,
            adapter,
            queues,
            next_queue,
            fences: Arc::new(VulkanFenceProvider::new(raw.clone())),
            pipeline_cache: Mutex::new(pipeline_cache),
            immediate: Mutex::new(immediate),
            raw,
        })
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        if let Err(err) = unsafe { self.raw.handle().device_wait_idle() } {
            log::warn!("vkDeviceWaitIdle failed: {err:?}");
        }
        self.immediate.get_mut().destroy(&self.raw);
        unsafe { self.raw.handle().destroy_pipeline_cache(*self.pipeline_cache.get_mut(), None) };
    }
}

impl DeviceBackend for VulkanDevice {
    fn kind(&self) -> BackendKind {
        BackendKind::Vulkan
    }

    fn adapter_info(&self) -> &AdapterInfo {
        &self.adapter
    }

    fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    fn memory_types(&self) -> &[MemoryTypeInfo] {
        &self.memory_types
    }

    fn queue_families(&self) -> &[QueueFamilyInfo] {
        &self.families
    }

    fn create_queue(&self, family_index: u32) -> RhiResult<Arc<dyn QueueBackend>> {
        let family = self
            .families
            .iter()
            .find(|f| f.index == family_index)
            .ok_or_else(|| RhiError::DeviceCapability(format!("no queue family {family_index}")))?;
        let index = self.next_queue[&family_index].fetch_add(1, Ordering::Relaxed) % family.queue_count;
        let queue = self.queues[&(family_index, index)].clone();
        Ok(Arc::new(VulkanQueue::new(self.raw.clone(), family.clone(), index, queue)))
    }

    fn fence_provider(&self) -> Arc<dyn FenceProvider> {
        self.fences.clone()
    }

    fn create_buffer(&self, desc: &BufferDescriptor) -> RhiResult<Arc<dyn NativeBuffer>> {
        Ok(Arc::new(VulkanBuffer::new(&self.raw, desc, &self.family_indices)?))
    }

    fn create_texture(&self, desc: &TextureDescriptor) -> RhiResult<Arc<dyn NativeTexture>> {
        let texture = VulkanTexture::new(&self.raw, desc, &self.family_indices)?;
        let barrier = texture.initial_barrier();
        self.immediate.lock().submit_and_wait(&self.raw, |device, cmd| {
            let barriers = [barrier];
            let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
            unsafe { device.cmd_pipeline_barrier2(cmd, &dependency) };
        })?;
        Ok(Arc::new(texture))
    }

    fn create_sampler(&self, desc: &SamplerDescriptor) -> RhiResult<Arc<dyn NativeSampler>> {
        Ok(Arc::new(VulkanSampler::new(&self.raw, desc)?))
    }

    fn create_shader_module(&self, desc: &ShaderModuleDescriptor) -> RhiResult<Arc<dyn NativeShaderModule>> {
        Ok(Arc::new(VulkanShaderModule::new(&self.raw, desc)?))
    }

    fn create_binding_set(&self, layout: &ShaderBindingSetLayout) -> RhiResult<Arc<dyn NativeBindingSet>> {
        Ok(Arc::new(VulkanBindingSet::new(&self.raw, "binding set".to_owned(), layout)?))
    }

    fn create_render_pipeline(&self, desc: &RenderPipelineDescriptor) -> RhiResult<Arc<dyn NativePipeline>> {
        let cache = self.pipeline_cache.lock();
        Ok(Arc::new(VulkanPipeline::render(&self.raw, *cache, desc, self.limits.max_push_constant_size)?))
    }

    fn create_compute_pipeline(&self, desc: &ComputePipelineDescriptor) -> RhiResult<Arc<dyn NativePipeline>> {
        let cache = self.pipeline_cache.lock();
        Ok(Arc::new(VulkanPipeline::compute(&self.raw, *cache, desc, self.limits.max_push_constant_size)?))
    }

    fn create_event(&self) -> RhiResult<Arc<dyn NativeEvent>> {
        Ok(Arc::new(VulkanEvent::new(&self.raw, "event".to_owned())?))
    }

    fn create_semaphore(&self) -> RhiResult<Arc<dyn NativeSemaphore>> {
        Ok(Arc::new(VulkanSemaphore::new(&self.raw, "semaphore".to_owned())?))
    }

    /// Replace the driver cache with one seeded from `blob`. The driver validates the blob
    /// header itself and starts empty on a mismatch.
    fn load_pipeline_cache(&self, blob: &[u8]) -> RhiResult<()> {
        let info = vk::PipelineCacheCreateInfo::default().initial_data(blob);
        let seeded = unsafe { self.raw.handle().create_pipeline_cache(&info, None)? };
        let previous = std::mem::replace(&mut *self.pipeline_cache.lock(), seeded);
        unsafe { self.raw.handle().destroy_pipeline_cache(previous, None) };
        log::debug!("vulkan pipeline cache seeded with {} bytes", blob.len());
        Ok(())
    }

    fn pipeline_cache_data(&self) -> RhiResult<Vec<u8>> {
        let cache = self.pipeline_cache.lock();
        Ok(unsafe { self.raw.handle().get_pipeline_cache_data(*cache)? })
    }

    fn wait_idle(&self) -> RhiResult<()> {
        // vkDeviceWaitIdle needs every queue externally synchronized.
        let mut locks: SmallVec<[_; 16]> = SmallVec::new();
        let mut keys: SmallVec<[(u32, u32); 16]> = self.queues.keys().copied().collect();
        keys.sort_unstable();
        for key in keys {
            locks.push(self.queues[&key].lock());
        }
        unsafe { self.raw.handle().device_wait_idle()? };
        Ok(())
    }
}

struct SelectedDevice {
    handle: vk::PhysicalDevice,
    name: String,
    properties: vk::PhysicalDeviceProperties,
    families: Vec<QueueFamilyInfo>,
    sampler_anisotropy: bool,
}

fn has_validation_layer(entry: &Entry) -> bool {
    unsafe { entry.enumerate_instance_layer_properties() }
        .map(|layers| {
            layers
                .iter()
                .any(|layer| layer.layer_name_as_c_str().is_ok_and(|name| name == VALIDATION_LAYER))
        })
        .unwrap_or(false)
}

fn create_instance(entry: &Entry, application_name: &str, validation: bool) -> Result<Instance, vk::Result> {
    let app_name = CString::new(application_name).unwrap_or_else(|_| c"kestrel".to_owned());
    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 1, 0, 0))
        .engine_name(c"Kestrel")
        .engine_version(vk::make_api_version(0, 1, 0, 0))
        .api_version(vk::API_VERSION_1_3);

    let mut extensions = Vec::new();
    let mut layers = Vec::new();
    if validation {
        extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        layers.push(VALIDATION_LAYER.as_ptr());
    }

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layers);
    unsafe { entry.create_instance(&create_info, None) }
}

fn setup_debug_messenger(entry: &Entry, instance: &Instance) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT), vk::Result> {
    let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);
    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(vulkan_debug_callback));
    let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None)? };
    Ok((debug_utils, messenger))
}

unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let callback_data = unsafe { *p_callback_data };
    let message = if callback_data.p_message.is_null() {
        "".into()
    } else {
        unsafe { CStr::from_ptr(callback_data.p_message) }.to_string_lossy()
    };

    let type_str = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "[General]",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "[Validation]",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "[Performance]",
        _ => "[Unknown]",
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::error!("Vulkan {type_str}: {message}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::warn!("Vulkan {type_str}: {message}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => log::debug!("Vulkan {type_str}: {message}"),
        _ => log::trace!("Vulkan {type_str}: {message}"),
    }

    vk::FALSE
}

/// Calculate a score for the physical device (higher is better, 0 is unusable).
fn score_physical_device(properties: &vk::PhysicalDeviceProperties, memory_properties: &vk::PhysicalDeviceMemoryProperties) -> u32 {
    if properties.api_version < vk::API_VERSION_1_3 {
        return 0;
    }

    let mut score = match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => SCORE_DISCRETE_GPU,
        vk::PhysicalDeviceType::INTEGRATED_GPU => SCORE_INTEGRATED_GPU,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 500,
        vk::PhysicalDeviceType::CPU => 100,
        _ => 10,
    };

    score += if properties.api_version >= vk::make_api_version(0, 1, 4, 0) {
        SCORE_VULKAN_1_4
    } else {
        SCORE_VULKAN_1_3
    };

    let vram_bytes: u64 = memory_properties.memory_heaps[..memory_properties.memory_heap_count as usize]
        .iter()
        .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|heap| heap.size)
        .sum();
    score + (vram_bytes / (1024 * 1024 * 1024)) as u32 * SCORE_PER_GB_VRAM
}

fn select_physical_device(instance: &Instance) -> RhiResult<SelectedDevice> {
    let physical_devices = unsafe { instance.enumerate_physical_devices() }
        .map_err(|err| RhiError::Fatal(format!("vkEnumeratePhysicalDevices failed: {err:?}")))?;

    let mut best: Option<(u32, SelectedDevice)> = None;
    for handle in physical_devices {
        let properties = unsafe { instance.get_physical_device_properties(handle) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(handle) };
        let features = unsafe { instance.get_physical_device_features(handle) };
        let name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let families: Vec<QueueFamilyInfo> = unsafe { instance.get_physical_device_queue_family_properties(handle) }
            .iter()
            .enumerate()
            .map(|(index, family)| QueueFamilyInfo {
                index: index as u32,
                flags: conv::queue_flags(family.queue_flags),
                queue_count: family.queue_count,
            })
            .filter(|family| !family.flags.is_empty() && family.queue_count > 0)
            .collect();

        let score = if families.is_empty() { 0 } else { score_physical_device(&properties, &memory_properties) };
        log::info!("found GPU: {name} (score: {score}, type: {:?})", properties.device_type);

        if score > 0 && best.as_ref().is_none_or(|(best_score, _)| score > *best_score) {
            best = Some((
                score,
                SelectedDevice {
                    handle,
                    name,
                    properties,
                    families,
                    sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
                },
            ));
        }
    }

    best.map(|(_, device)| device)
        .ok_or_else(|| RhiError::BackendUnavailable(BackendKind::Vulkan))
}

fn create_logical_device(instance: &Instance, selected: &SelectedDevice) -> Result<ash::Device, vk::Result> {
    let priorities: Vec<Vec<f32>> = selected.families.iter().map(|f| vec![1.0; f.queue_count as usize]).collect();
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = selected
        .families
        .iter()
        .zip(&priorities)
        .map(|(family, priorities)| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family.index)
                .queue_priorities(priorities)
        })
        .collect();

    let features = vk::PhysicalDeviceFeatures::default().sampler_anisotropy(selected.sampler_anisotropy);
    let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);
    let mut vulkan_13_features = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_features(&features)
        .push_next(&mut vulkan_12_features)
        .push_next(&mut vulkan_13_features);
    unsafe { instance.create_device(selected.handle, &create_info, None) }
}

fn adapter_type(device_type: vk::PhysicalDeviceType) -> AdapterType {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => AdapterType::Discrete,
        vk::PhysicalDeviceType::INTEGRATED_GPU => AdapterType::Integrated,
        vk::PhysicalDeviceType::VIRTUAL_GPU => AdapterType::Virtual,
        vk::PhysicalDeviceType::CPU => AdapterType::Cpu,
        _ => AdapterType::Other,
    }
}

fn map_limits(limits: &vk::PhysicalDeviceLimits) -> DeviceLimits {
    let samples = limits.framebuffer_color_sample_counts & limits.framebuffer_depth_sample_counts & limits.sampled_image_color_sample_counts;
    DeviceLimits {
        // Single allocations above maxMemoryAllocationSize may fail; storage buffer range is the
        // tighter portable bound for anything bound to a shader.
        max_buffer_size: u64::from(limits.max_storage_buffer_range).max(1 << 28),
        max_texture_dimension_1d: limits.max_image_dimension1_d,
        max_texture_dimension_2d: limits.max_image_dimension2_d,
        max_texture_dimension_3d: limits.max_image_dimension3_d,
        max_texture_array_layers: limits.max_image_array_layers,
        sample_count_mask: conv::sample_count_mask(samples),
        max_color_attachments: limits.max_color_attachments,
        max_binding_sets: limits.max_bound_descriptor_sets,
        max_bindings_per_set: limits.max_per_stage_resources.min(1024),
        max_push_constant_size: limits.max_push_constants_size,
        max_vertex_buffers: limits.max_vertex_input_bindings,
        max_vertex_attributes: limits.max_vertex_input_attributes,
        max_sampler_anisotropy: limits.max_sampler_anisotropy,
        max_threads_per_threadgroup: limits.max_compute_work_group_size,
        max_total_threads_per_threadgroup: limits.max_compute_work_group_invocations,
    }
}

fn map_memory_types(memory_properties: &vk::PhysicalDeviceMemoryProperties) -> Vec<MemoryTypeInfo> {
    memory_properties.memory_types[..memory_properties.memory_type_count as usize]
        .iter()
        .map(|memory_type| {
            let flags = memory_type.property_flags;
            MemoryTypeInfo {
                heap_index: memory_type.heap_index,
                device_local: flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL),
                host_visible: flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE),
                host_coherent: flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT),
                host_cached: flags.contains(vk::MemoryPropertyFlags::HOST_CACHED),
                lazily_allocated: flags.contains(vk::MemoryPropertyFlags::LAZILY_ALLOCATED),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(device_type: vk::PhysicalDeviceType, api_version: u32) -> vk::PhysicalDeviceProperties {
        vk::PhysicalDeviceProperties {
            device_type,
            api_version,
            ..Default::default()
        }
    }

    fn memory(heap_gb: u64) -> vk::PhysicalDeviceMemoryProperties {
        let mut memory = vk::PhysicalDeviceMemoryProperties {
            memory_heap_count: 1,
            ..Default::default()
        };
        memory.memory_heaps[0] = vk::MemoryHeap {
            size: heap_gb << 30,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        memory
    }

    #[test]
    fn discrete_adapters_outrank_integrated_ones() {
        let discrete = score_physical_device(&properties(vk::PhysicalDeviceType::DISCRETE_GPU, vk::API_VERSION_1_3), &memory(8));
        let integrated = score_physical_device(&properties(vk::PhysicalDeviceType::INTEGRATED_GPU, vk::API_VERSION_1_3), &memory(16));
        assert_eq!(discrete, SCORE_DISCRETE_GPU + SCORE_VULKAN_1_3 + 8 * SCORE_PER_GB_VRAM);
        assert!(discrete > integrated);
    }

    #[test]
    fn adapters_below_vulkan_1_3_are_unusable() {
        let score = score_physical_device(&properties(vk::PhysicalDeviceType::DISCRETE_GPU, vk::API_VERSION_1_2), &memory(24));
        assert_eq!(score, 0);
    }

    #[test]
    fn result_codes_map_to_error_categories() {
        assert!(matches!(RhiError::from(vk::Result::ERROR_DEVICE_LOST), RhiError::DeviceLost));
        assert!(matches!(RhiError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY), RhiError::OutOfMemory(_)));
        assert!(matches!(RhiError::from(vk::Result::ERROR_INITIALIZATION_FAILED), RhiError::Backend(_)));
    }

    #[test]
    #[ignore = "needs a Vulkan 1.3 driver"]
    fn creates_a_device_on_real_hardware() {
        let config = crate::config::DeviceConfigBuilder::default()
            .validation(false)
            .build()
            .unwrap();
        let device = VulkanDevice::new(&config).unwrap();
        assert!(!device.queue_families().is_empty());
        assert!(device.create_queue(device.queue_families()[0].index).is_ok());
        device.wait_idle().unwrap();
    }
}
