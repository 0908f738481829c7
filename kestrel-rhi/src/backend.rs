//! Backend capability set.
//!
//! Every native API is one implementation of these traits. The front end (device, queue,
//! command buffer, encoders) only ever talks to `dyn` trait objects, so a device instance is
//! bound to exactly one backend for its whole life.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use enumflags2::{bitflags, BitFlags};
use serde::{Deserialize, Serialize};

use crate::buffer::BufferDescriptor;
use crate::encoder::EncodedPass;
use crate::error::{RhiError, RhiResult};
use crate::pipeline::{ComputePipelineDescriptor, RenderPipelineDescriptor};
use crate::sampler::SamplerDescriptor;
use crate::shader::{ShaderBindingSetLayout, ShaderModuleDescriptor};
use crate::synchronization::SyncPoint;
use crate::texture::{TextureDescriptor, TextureRegion};

/// Native graphics API family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    Vulkan,
    Metal,
    Direct3D12,
    Software,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Vulkan,
        BackendKind::Metal,
        BackendKind::Direct3D12,
        BackendKind::Software,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Vulkan => "vulkan",
            BackendKind::Metal => "metal",
            BackendKind::Direct3D12 => "d3d12",
            BackendKind::Software => "software",
        }
    }

    /// Whether an implementation of this backend is compiled into this build.
    pub fn is_compiled(self) -> bool {
        match self {
            BackendKind::Vulkan => cfg!(feature = "vulkan"),
            BackendKind::Metal | BackendKind::Direct3D12 => false,
            BackendKind::Software => true,
        }
    }
}

#[bitflags]
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueCapability {
    Graphics = 1 << 0,
    Compute = 1 << 1,
    Transfer = 1 << 2,
}

pub type QueueFlags = BitFlags<QueueCapability>;

/// A set of queues sharing the same operation classes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueFamilyInfo {
    pub index: u32,
    pub flags: QueueFlags,
    pub queue_count: u32,
}

impl QueueFamilyInfo {
    #[inline]
    pub fn supports(&self, required: QueueFlags) -> bool {
        self.flags.contains(required)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdapterType {
    Discrete,
    Integrated,
    Virtual,
    Cpu,
    Other,
}

/// Identity of the physical adapter and its driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AdapterInfo {
    pub name: String,
    pub adapter_type: AdapterType,
    pub vendor_id: u32,
    pub device_id: u32,
    pub driver_version: u32,
    /// Opaque identifier the driver uses to tag its pipeline cache blobs.
    pub pipeline_cache_uuid: [u8; 16],
}

/// One entry of the device memory-type table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryTypeInfo {
    pub heap_index: u32,
    pub device_local: bool,
    pub host_visible: bool,
    pub host_coherent: bool,
    pub host_cached: bool,
    pub lazily_allocated: bool,
}

#[derive(Debug, Clone)]
pub struct DeviceLimits {
    pub max_buffer_size: u64,
    pub max_texture_dimension_1d: u32,
    pub max_texture_dimension_2d: u32,
    pub max_texture_dimension_3d: u32,
    pub max_texture_array_layers: u32,
    /// Bitmask of supported sample counts (bit n set means 2^n samples).
    pub sample_count_mask: u32,
    pub max_color_attachments: u32,
    pub max_binding_sets: u32,
    pub max_bindings_per_set: u32,
    pub max_push_constant_size: u32,
    pub max_vertex_buffers: u32,
    pub max_vertex_attributes: u32,
    pub max_sampler_anisotropy: f32,
    pub max_threads_per_threadgroup: [u32; 3],
    pub max_total_threads_per_threadgroup: u32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_buffer_size: 1 << 30,
            max_texture_dimension_1d: 16384,
            max_texture_dimension_2d: 16384,
            max_texture_dimension_3d: 2048,
            max_texture_array_layers: 2048,
            sample_count_mask: 0b1111,
            max_color_attachments: 8,
            max_binding_sets: 4,
            max_bindings_per_set: 32,
            max_push_constant_size: 128,
            max_vertex_buffers: 16,
            max_vertex_attributes: 16,
            max_sampler_anisotropy: 16.0,
            max_threads_per_threadgroup: [1024, 1024, 64],
            max_total_threads_per_threadgroup: 1024,
        }
    }
}

impl DeviceLimits {
    #[inline]
    pub fn supports_sample_count(&self, samples: u32) -> bool {
        samples.is_power_of_two() && (self.sample_count_mask & samples) != 0
    }
}

/// Upcast helper so backends can recover their concrete native types.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    #[inline]
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Recover a backend's concrete type from a native object of the same device.
pub(crate) fn downcast_native<'a, T: 'static>(object: &'a dyn Any, what: &str) -> RhiResult<&'a T> {
    object
        .downcast_ref::<T>()
        .ok_or_else(|| RhiError::invalid_state(format!("{what} was created by a different backend")))
}

/// Root of a backend: the per-adapter logical device.
pub trait DeviceBackend: AsAny + Send + Sync {
    fn kind(&self) -> BackendKind;
    fn adapter_info(&self) -> &AdapterInfo;
    fn limits(&self) -> &DeviceLimits;
    fn memory_types(&self) -> &[MemoryTypeInfo];
    fn queue_families(&self) -> &[QueueFamilyInfo];

    fn create_queue(&self, family_index: u32) -> RhiResult<Arc<dyn QueueBackend>>;
    fn fence_provider(&self) -> Arc<dyn FenceProvider>;

    fn create_buffer(&self, desc: &BufferDescriptor) -> RhiResult<Arc<dyn NativeBuffer>>;
    fn create_texture(&self, desc: &TextureDescriptor) -> RhiResult<Arc<dyn NativeTexture>>;
    fn create_sampler(&self, desc: &SamplerDescriptor) -> RhiResult<Arc<dyn NativeSampler>>;
    fn create_shader_module(&self, desc: &ShaderModuleDescriptor) -> RhiResult<Arc<dyn NativeShaderModule>>;
    fn create_binding_set(&self, layout: &ShaderBindingSetLayout) -> RhiResult<Arc<dyn NativeBindingSet>>;
    fn create_render_pipeline(&self, desc: &RenderPipelineDescriptor) -> RhiResult<Arc<dyn NativePipeline>>;
    fn create_compute_pipeline(&self, desc: &ComputePipelineDescriptor) -> RhiResult<Arc<dyn NativePipeline>>;
    fn create_event(&self) -> RhiResult<Arc<dyn NativeEvent>>;
    fn create_semaphore(&self) -> RhiResult<Arc<dyn NativeSemaphore>>;

    /// Replace the backend pipeline cache with `blob`. Called once, before any pipeline exists.
    fn load_pipeline_cache(&self, blob: &[u8]) -> RhiResult<()>;
    fn pipeline_cache_data(&self) -> RhiResult<Vec<u8>>;

    fn wait_idle(&self) -> RhiResult<()>;
}

/// One hardware queue of a family.
pub trait QueueBackend: Send + Sync {
    fn family(&self) -> &QueueFamilyInfo;

    /// Create a pool of native command buffers. Pools are used from one thread at a time.
    fn create_command_pool(&self) -> RhiResult<Box<dyn NativeCommandPool>>;

    /// Hand finished command buffers to the hardware queue. Callers serialize submissions.
    fn submit(&self, submission: Submission<'_>) -> RhiResult<()>;

    fn wait_idle(&self) -> RhiResult<()>;
}

/// Everything one `commit` hands to the native queue.
pub struct Submission<'a> {
    /// Executed in slice order.
    pub command_buffers: &'a [Box<dyn NativeCommandBuffer>],
    pub waits: &'a [SyncPoint],
    pub signals: &'a [SyncPoint],
    /// Signaled once every command buffer of this submission finished executing.
    pub fence: &'a dyn NativeFence,
}

/// Allocates native command buffers. The front end keeps the free list; a buffer handed back
/// to it is re-recorded from scratch by the next `encode`.
pub trait NativeCommandPool: Send {
    fn allocate(&mut self) -> RhiResult<Box<dyn NativeCommandBuffer>>;

    /// Number of native command buffers this pool has ever created.
    fn allocated_count(&self) -> usize;
}

/// A native command buffer / command list. One encoder records into exactly one of these.
pub trait NativeCommandBuffer: AsAny + Send {
    /// Replace the buffer's contents with `pass`.
    fn encode(&mut self, pass: &EncodedPass) -> RhiResult<()>;
}

pub trait NativeFence: AsAny + Send + Sync {
    fn is_signaled(&self) -> RhiResult<bool>;
    fn reset(&self) -> RhiResult<()>;
}

/// Creates fences and waits on them. Owned by the device, shared with the completion thread.
pub trait FenceProvider: Send + Sync {
    fn create_fence(&self) -> RhiResult<Box<dyn NativeFence>>;

    /// Wait until at least one of `fences` is signaled or `timeout` elapses.
    /// Returns `Ok(false)` on timeout.
    fn wait_any(&self, fences: &[&dyn NativeFence], timeout: Duration) -> RhiResult<bool>;
}

pub trait NativeBuffer: AsAny + Send + Sync {
    fn size(&self) -> u64;

    /// Copy `data` into host-visible memory at `offset`. The front end validates the range.
    fn write(&self, offset: u64, data: &[u8]) -> RhiResult<()>;

    /// Copy host-visible memory starting at `offset` into `out`.
    fn read(&self, offset: u64, out: &mut [u8]) -> RhiResult<()>;
}

pub trait NativeTexture: AsAny + Send + Sync {
    /// Read back one region of a host-accessible texture (software backend only).
    fn read_region(&self, _region: &TextureRegion, _out: &mut [u8]) -> RhiResult<()> {
        Err(RhiError::invalid_state("texture is not host accessible"))
    }
}

pub trait NativeSampler: AsAny + Send + Sync {}

pub trait NativeShaderModule: AsAny + Send + Sync {}

pub trait NativePipeline: AsAny + Send + Sync {}

pub trait NativeBindingSet: AsAny + Send + Sync {
    fn write_buffer(&self, binding: u32, array_index: u32, buffer: &dyn NativeBuffer, offset: u64, length: u64) -> RhiResult<()>;
    fn write_texture(&self, binding: u32, array_index: u32, texture: &dyn NativeTexture) -> RhiResult<()>;
    fn write_sampler(&self, binding: u32, array_index: u32, sampler: &dyn NativeSampler) -> RhiResult<()>;
}

/// GPU-to-GPU binary signal between submissions.
pub trait NativeEvent: AsAny + Send + Sync {}

/// GPU-to-GPU counter between submissions.
pub trait NativeSemaphore: AsAny + Send + Sync {
    fn completed_value(&self) -> RhiResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn software_is_always_compiled() {
        assert!(BackendKind::Software.is_compiled());
        assert!(!BackendKind::Metal.is_compiled());
        assert!(!BackendKind::Direct3D12.is_compiled());
    }

    #[test]
    fn queue_family_support_is_superset_match() {
        let family = QueueFamilyInfo {
            index: 0,
            flags: QueueCapability::Graphics | QueueCapability::Compute | QueueCapability::Transfer,
            queue_count: 1,
        };
        assert!(family.supports(QueueCapability::Graphics.into()));
        assert!(family.supports(QueueCapability::Compute | QueueCapability::Transfer));

        let transfer_only = QueueFamilyInfo { index: 1, flags: QueueCapability::Transfer.into(), queue_count: 2 };
        assert!(!transfer_only.supports(QueueCapability::Graphics.into()));
    }

    #[test]
    fn sample_count_mask() {
        let limits = DeviceLimits::default();
        assert!(limits.supports_sample_count(1));
        assert!(limits.supports_sample_count(4));
        assert!(!limits.supports_sample_count(3));
        assert!(!limits.supports_sample_count(16));
    }
}
