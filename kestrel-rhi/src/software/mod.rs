//! CPU reference device.
//!
//! Every hardware queue is a worker thread that executes submissions in order: clears and
//! blits move real bytes, draws and dispatches are counted. Fences, events and semaphores
//! are signaled by the worker exactly where a GPU would signal them, so the front end's
//! synchronization is exercised without a GPU. The execution log, latency, stalls and
//! injected submission failures make the device scriptable from tests.

mod queue;
mod resource;
mod sync;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use parking_lot::{Condvar, Mutex};
use kestrel_core::collections::hashmap::HashMap;
use kestrel_core::collections::hashset::HashSet;
use kestrel_core::collections::stable_hash;

use crate::backend::{
    AdapterInfo, AdapterType, BackendKind, DeviceBackend, DeviceLimits, FenceProvider, MemoryTypeInfo, NativeBindingSet,
    NativeBuffer, NativeEvent, NativePipeline, NativeSampler, NativeSemaphore, NativeShaderModule, NativeTexture,
    QueueBackend, QueueCapability, QueueFamilyInfo,
};
use crate::buffer::BufferDescriptor;
use crate::config::SoftwareOptions;
use crate::device::GraphicsDevice;
use crate::encoder::PassKind;
use crate::error::{RhiError, RhiResult};
use crate::pipeline::{ComputePipelineDescriptor, RenderPipelineDescriptor};
use crate::sampler::SamplerDescriptor;
use crate::shader::{ShaderBindingSetLayout, ShaderModuleDescriptor};
use crate::texture::TextureDescriptor;

use self::queue::SoftwareQueue;
use self::resource::{
    SoftwareBindingSet, SoftwareBuffer, SoftwarePipeline, SoftwareSampler, SoftwareShaderModule, SoftwareTexture,
};
use self::sync::{SoftwareEvent, SoftwareFenceProvider, SoftwareSemaphore};

const VENDOR_ID: u32 = 0x4b53;
const DEVICE_ID: u32 = 0x0001;
const DRIVER_VERSION: u32 = 1;
const PIPELINE_BLOB_LIMIT: usize = 64 << 20;

/// One pass the software device executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedPass {
    pub queue_family: u32,
    pub queue_index: u32,
    /// Device-wide submission number, in submission order.
    pub submission: u64,
    /// Encoder index within its command buffer.
    pub pass_index: u32,
    pub label: String,
    pub kind: PassKind,
    pub draws: u32,
    pub dispatches: u32,
    pub blits: u32,
}

/// Controls shared by the device and its queue workers.
pub(crate) struct SoftwareShared {
    latency: Mutex<Duration>,
    failures: AtomicU32,
    submissions: AtomicU64,
    log: Mutex<Vec<ExecutedPass>>,
    stalled: Mutex<bool>,
    resumed: Condvar,
}

impl SoftwareShared {
    fn new(latency: Duration) -> Self {
        Self {
            latency: Mutex::new(latency),
            failures: AtomicU32::new(0),
            submissions: AtomicU64::new(0),
            log: Mutex::new(Vec::new()),
            stalled: Mutex::new(false),
            resumed: Condvar::new(),
        }
    }

    #[inline]
    pub(crate) fn execution_latency(&self) -> Duration {
        *self.latency.lock()
    }

    pub(crate) fn take_injected_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    #[inline]
    pub(crate) fn next_submission(&self) -> u64 {
        self.submissions.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn record(&self, pass: ExecutedPass) {
        log::trace!("software pass '{}' executed on queue {}.{}", pass.label, pass.queue_family, pass.queue_index);
        self.log.lock().push(pass);
    }

    pub(crate) fn wait_while_stalled(&self, closing: &AtomicBool) {
        let mut stalled = self.stalled.lock();
        while *stalled && !closing.load(Ordering::Acquire) {
            self.resumed.wait_for(&mut stalled, Duration::from_millis(10));
        }
    }
}

/// The software backend's logical device.
pub struct SoftwareDevice {
    adapter: AdapterInfo,
    limits: DeviceLimits,
    memory_types: Vec<MemoryTypeInfo>,
    families: Vec<QueueFamilyInfo>,
    next_queue: Vec<AtomicU32>,
    queues: Mutex<HashMap<(u32, u32), Arc<SoftwareQueue>>>,
    fences: Arc<SoftwareFenceProvider>,
    compiled_pipelines: Mutex<HashSet<u64>>,
    shared: Arc<SoftwareShared>,
}

impl SoftwareDevice {
    pub fn new(options: &SoftwareOptions) -> Self {
        let queue_count = options.queues_per_family.max(1);
        let families = vec![
            QueueFamilyInfo {
                index: 0,
                flags: QueueCapability::Graphics | QueueCapability::Compute | QueueCapability::Transfer,
                queue_count,
            },
            QueueFamilyInfo {
                index: 1,
                flags: QueueCapability::Compute | QueueCapability::Transfer,
                queue_count,
            },
            QueueFamilyInfo {
                index: 2,
                flags: QueueCapability::Transfer.into(),
                queue_count,
            },
        ];

        let uuid_low = stable_hash(&(BackendKind::Software.name(), DRIVER_VERSION));
        let uuid_high = stable_hash(&uuid_low);
        let mut pipeline_cache_uuid = [0u8; 16];
        pipeline_cache_uuid[..8].copy_from_slice(&uuid_low.to_le_bytes());
        pipeline_cache_uuid[8..].copy_from_slice(&uuid_high.to_le_bytes());

        log::info!("software device '{}' with {queue_count} queues per family", options.adapter_name);
        Self {
            adapter: AdapterInfo {
                name: options.adapter_name.clone(),
                adapter_type: AdapterType::Cpu,
                vendor_id: VENDOR_ID,
                device_id: DEVICE_ID,
                driver_version: DRIVER_VERSION,
                pipeline_cache_uuid,
            },
            limits: DeviceLimits::default(),
            memory_types: vec![MemoryTypeInfo {
                heap_index: 0,
                device_local: true,
                host_visible: true,
                host_coherent: true,
                host_cached: true,
                lazily_allocated: false,
            }],
            next_queue: families.iter().map(|_| AtomicU32::new(0)).collect(),
            families,
            queues: Mutex::new(HashMap::default()),
            fences: Arc::new(SoftwareFenceProvider::new()),
            compiled_pipelines: Mutex::new(HashSet::default()),
            shared: Arc::new(SoftwareShared::new(options.execution_latency)),
        }
    }

    /// The software backend behind `device`, if that is what it runs on.
    pub fn from_device(device: &GraphicsDevice) -> Option<&SoftwareDevice> {
        device.backend().as_any().downcast_ref::<SoftwareDevice>()
    }

    /// Every pass executed so far, in execution order per queue.
    pub fn execution_log(&self) -> Vec<ExecutedPass> {
        self.shared.log.lock().clone()
    }

    pub fn take_execution_log(&self) -> Vec<ExecutedPass> {
        std::mem::take(&mut *self.shared.log.lock())
    }

    /// Extra time every following submission takes to execute.
    pub fn set_execution_latency(&self, latency: Duration) {
        *self.shared.latency.lock() = latency;
    }

    /// Hold every queue before its next submission until `resume`.
    ///
    /// A stalled device never becomes idle, so resume it before waiting on it or dropping it.
    pub fn stall(&self) {
        *self.shared.stalled.lock() = true;
    }

    pub fn resume(&self) {
        *self.shared.stalled.lock() = false;
        self.shared.resumed.notify_all();
    }

    /// Reject the next `count` queue submissions.
    pub fn fail_next_submissions(&self, count: u32) {
        self.shared.failures.store(count, Ordering::Release);
    }

    /// Distinct pipelines compiled or loaded from a cache blob.
    pub fn compiled_pipeline_count(&self) -> usize {
        self.compiled_pipelines.lock().len()
    }

    fn compile(&self, fingerprint: u64, label: &str) {
        if self.compiled_pipelines.lock().insert(fingerprint) {
            log::debug!("software pipeline '{label}' compiled ({fingerprint:016x})");
        } else {
            log::debug!("software pipeline '{label}' found in the backend cache");
        }
    }
}

impl DeviceBackend for SoftwareDevice {
    fn kind(&self) -> BackendKind {
        BackendKind::Software
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
            .get(family_index as usize)
            .ok_or_else(|| RhiError::DeviceCapability(format!("no queue family {family_index}")))?;
        let index = self.next_queue[family_index as usize].fetch_add(1, Ordering::Relaxed) % family.queue_count;

        let mut queues = self.queues.lock();
        if let Some(queue) = queues.get(&(family_index, index)) {
            return Ok(queue.clone());
        }
        let queue = Arc::new(SoftwareQueue::new(family.clone(), index, self.shared.clone())?);
        queues.insert((family_index, index), queue.clone());
        Ok(queue)
    }

    fn fence_provider(&self) -> Arc<dyn FenceProvider> {
        self.fences.clone()
    }

    fn create_buffer(&self, desc: &BufferDescriptor) -> RhiResult<Arc<dyn NativeBuffer>> {
        Ok(Arc::new(SoftwareBuffer::new(desc.size)?))
    }

    fn create_texture(&self, desc: &TextureDescriptor) -> RhiResult<Arc<dyn NativeTexture>> {
        Ok(Arc::new(SoftwareTexture::new(desc)?))
    }

    fn create_sampler(&self, _desc: &SamplerDescriptor) -> RhiResult<Arc<dyn NativeSampler>> {
        Ok(Arc::new(SoftwareSampler))
    }

    fn create_shader_module(&self, _desc: &ShaderModuleDescriptor) -> RhiResult<Arc<dyn NativeShaderModule>> {
        Ok(Arc::new(SoftwareShaderModule))
    }

    fn create_binding_set(&self, _layout: &ShaderBindingSetLayout) -> RhiResult<Arc<dyn NativeBindingSet>> {
        Ok(Arc::new(SoftwareBindingSet::default()))
    }

    fn create_render_pipeline(&self, desc: &RenderPipelineDescriptor) -> RhiResult<Arc<dyn NativePipeline>> {
        self.compile(desc.fingerprint(), &desc.label);
        Ok(Arc::new(SoftwarePipeline))
    }

    fn create_compute_pipeline(&self, desc: &ComputePipelineDescriptor) -> RhiResult<Arc<dyn NativePipeline>> {
        self.compile(desc.fingerprint(), &desc.label);
        Ok(Arc::new(SoftwarePipeline))
    }

    fn create_event(&self) -> RhiResult<Arc<dyn NativeEvent>> {
        Ok(Arc::new(SoftwareEvent::default()))
    }

    fn create_semaphore(&self) -> RhiResult<Arc<dyn NativeSemaphore>> {
        Ok(Arc::new(SoftwareSemaphore::default()))
    }

    fn load_pipeline_cache(&self, blob: &[u8]) -> RhiResult<()> {
        let config = bincode::config::standard().with_limit::<PIPELINE_BLOB_LIMIT>();
        let (fingerprints, _): (Vec<u64>, usize) = bincode::serde::decode_from_slice(blob, config)
            .map_err(|err| RhiError::Backend(format!("software pipeline cache blob: {err}")))?;
        let mut compiled = self.compiled_pipelines.lock();
        compiled.clear();
        compiled.extend(fingerprints);
        log::debug!("software pipeline cache seeded with {} pipelines", compiled.len());
        Ok(())
    }

    fn pipeline_cache_data(&self) -> RhiResult<Vec<u8>> {
        let mut fingerprints: Vec<u64> = self.compiled_pipelines.lock().iter().copied().collect();
        fingerprints.sort_unstable();
        bincode::serde::encode_to_vec(&fingerprints, bincode::config::standard())
            .map_err(|err| RhiError::Backend(format!("software pipeline cache blob: {err}")))
    }

    fn wait_idle(&self) -> RhiResult<()> {
        let queues: Vec<_> = self.queues.lock().values().cloned().collect();
        for queue in queues {
            queue.wait_idle()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn families_cover_every_capability() {
        let device = SoftwareDevice::new(&SoftwareOptions::default());
        let families = device.queue_families();
        assert_eq!(families.len(), 3);
        assert!(families[0].supports(QueueCapability::Graphics.into()));
        assert!(!families[1].supports(QueueCapability::Graphics.into()));
        assert_eq!(families[2].flags, crate::backend::QueueFlags::from(QueueCapability::Transfer));
    }

    #[test]
    fn queues_are_handed_out_round_robin() {
        let options = SoftwareOptions { queues_per_family: 2, ..Default::default() };
        let device = SoftwareDevice::new(&options);
        let a = device.create_queue(0).unwrap();
        let b = device.create_queue(0).unwrap();
        let c = device.create_queue(0).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &c));
        assert!(device.create_queue(7).is_err());
    }

    #[test]
    fn pipeline_blob_round_trips_fingerprints() {
        let device = SoftwareDevice::new(&SoftwareOptions::default());
        device.compile(7, "a");
        device.compile(3, "b");
        let blob = device.pipeline_cache_data().unwrap();

        let other = SoftwareDevice::new(&SoftwareOptions::default());
        other.load_pipeline_cache(&blob).unwrap();
        assert_eq!(other.compiled_pipeline_count(), 2);
        assert!(other.load_pipeline_cache(&[0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn injected_failures_are_consumed() {
        let shared = SoftwareShared::new(Duration::ZERO);
        shared.failures.store(2, Ordering::Release);
        assert!(shared.take_injected_failure());
        assert!(shared.take_injected_failure());
        assert!(!shared.take_injected_failure());
    }
}
