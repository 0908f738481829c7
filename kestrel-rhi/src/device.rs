//! Graphics device: backend selection, resource creation and device lifecycle.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use parking_lot::Mutex;

use crate::backend::{AdapterInfo, BackendKind, DeviceBackend, DeviceLimits, MemoryTypeInfo, QueueFamilyInfo, QueueFlags};
use crate::buffer::{Buffer, BufferDescriptor};
use crate::config::DeviceConfig;
use crate::error::{RhiError, RhiResult};
use crate::notifier::{CompletionNotifier, NotifierStats};
use crate::pipeline::{ComputePipeline, ComputePipelineDescriptor, RenderPipeline, RenderPipelineDescriptor};
use crate::pipeline_cache::{CachedPipeline, PipelineCache, PipelineCacheKey, PipelineCacheStats};
use crate::queue::CommandQueue;
use crate::sampler::{SamplerDescriptor, SamplerState};
use crate::shader::{ShaderBindingSet, ShaderBindingSetLayout, ShaderModule, ShaderModuleDescriptor};
use crate::software::SoftwareDevice;
use crate::synchronization::{Event, FencePool, FencePoolStats, Semaphore};
use crate::texture::{Texture, TextureDescriptor};
use crate::tracker::{ResourceKind, ResourceStats, ResourceTracker};

/// Lifecycle of a device after construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    Ready,
    ShuttingDown,
    Destroyed,
}

/// Everything one device owns. Queues, command buffers and completions hold it by `Arc`.
pub(crate) struct DeviceContext {
    pub(crate) backend: Arc<dyn DeviceBackend>,
    pub(crate) tracker: Arc<ResourceTracker>,
    pub(crate) fence_pool: Arc<FencePool>,
    pub(crate) notifier: CompletionNotifier,
    pub(crate) pipeline_cache: PipelineCache,
    config: DeviceConfig,
    state: Mutex<DeviceState>,
    degraded: AtomicBool,
}

impl DeviceContext {
    pub(crate) fn ensure_ready(&self) -> RhiResult<()> {
        match *self.state.lock() {
            DeviceState::Ready => Ok(()),
            DeviceState::ShuttingDown | DeviceState::Destroyed => Err(RhiError::ShuttingDown),
        }
    }

    /// Record a rejected submission. Warns once per device.
    pub(crate) fn mark_degraded(&self, err: &RhiError) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            log::warn!("{} device degraded after a rejected submission: {err}", self.backend.kind().name());
        } else {
            log::debug!("submission rejected on degraded device: {err}");
        }
    }

    fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if *state != DeviceState::Ready {
                return;
            }
            *state = DeviceState::ShuttingDown;
        }
        log::debug!("{} device shutting down", self.backend.kind().name());

        if let Err(err) = self.backend.wait_idle() {
            log::warn!("wait_idle failed during shutdown: {err}");
        }
        self.notifier.shutdown();

        if self.config.save_pipeline_cache_on_shutdown {
            if let Err(err) = self.pipeline_cache.save(self.backend.as_ref()) {
                log::warn!("failed to save pipeline cache at shutdown: {err}");
            }
        }
        self.tracker.report_live();
        *self.state.lock() = DeviceState::Destroyed;
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn create_backend(kind: BackendKind, config: &DeviceConfig) -> RhiResult<Arc<dyn DeviceBackend>> {
    match kind {
        #[cfg(feature = "vulkan")]
        BackendKind::Vulkan => Ok(Arc::new(crate::vulkan::VulkanDevice::new(config)?)),
        BackendKind::Software => Ok(Arc::new(SoftwareDevice::new(&config.software))),
        _ => Err(RhiError::BackendUnavailable(kind)),
    }
}

/// Root object of the layer. Cheap to clone; every clone is the same device.
#[derive(Clone)]
pub struct GraphicsDevice {
    context: Arc<DeviceContext>,
}

impl GraphicsDevice {
    /// Create a device on the first backend of `config.backend` that initialises.
    ///
    /// This is the only operation whose failure is fatal; the error of the last attempted
    /// backend is returned.
    #[profiling::function]
    pub fn new(config: DeviceConfig) -> RhiResult<Self> {
        let mut last_error = None;
        for kind in config.backend.candidates() {
            match create_backend(kind, &config) {
                Ok(backend) => return Self::with_backend(backend, config),
                Err(err) => {
                    log::warn!("backend {} failed to initialise: {err}", kind.name());
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| RhiError::Fatal("no graphics backend is compiled in".to_owned())))
    }

    /// Wrap an already created backend.
    pub fn with_backend(backend: Arc<dyn DeviceBackend>, config: DeviceConfig) -> RhiResult<Self> {
        let info = backend.adapter_info();
        log::info!(
            "graphics device: {} on '{}' ({:?}, vendor {:#06x}, device {:#06x})",
            backend.kind().name(),
            info.name,
            info.adapter_type,
            info.vendor_id,
            info.device_id
        );

        let fence_pool = Arc::new(FencePool::new(backend.fence_provider()));
        let notifier = CompletionNotifier::new(
            &format!("kestrel-completion-{}", backend.kind().name()),
            fence_pool.clone(),
            config.event_loop.clone(),
            config.fence_poll_interval,
        );
        let pipeline_cache = PipelineCache::open(config.pipeline_cache_dir.as_deref(), backend.as_ref());

        Ok(Self {
            context: Arc::new(DeviceContext {
                backend,
                tracker: ResourceTracker::new(),
                fence_pool,
                notifier,
                pipeline_cache,
                config,
                state: Mutex::new(DeviceState::Ready),
                degraded: AtomicBool::new(false),
            }),
        })
    }

    #[inline]
    pub fn backend_kind(&self) -> BackendKind {
        self.context.backend.kind()
    }

    /// The backend implementation, for downcasting to a concrete backend.
    #[inline]
    pub fn backend(&self) -> &dyn DeviceBackend {
        self.context.backend.as_ref()
    }

    #[inline]
    pub fn adapter_info(&self) -> &AdapterInfo {
        self.context.backend.adapter_info()
    }

    #[inline]
    pub fn limits(&self) -> &DeviceLimits {
        self.context.backend.limits()
    }

    #[inline]
    pub fn queue_families(&self) -> &[QueueFamilyInfo] {
        self.context.backend.queue_families()
    }

    #[inline]
    pub fn memory_types(&self) -> &[MemoryTypeInfo] {
        self.context.backend.memory_types()
    }

    #[inline]
    pub fn config(&self) -> &DeviceConfig {
        &self.context.config
    }

    pub fn state(&self) -> DeviceState {
        *self.context.state.lock()
    }

    /// Whether a submission was rejected since the device was created.
    pub fn is_degraded(&self) -> bool {
        self.context.degraded.load(Ordering::Acquire)
    }

    /// A queue of the family that supports `flags` with the fewest extra capabilities.
    pub fn create_command_queue(&self, flags: impl Into<QueueFlags>) -> RhiResult<CommandQueue> {
        self.context.ensure_ready()?;
        let flags = flags.into();
        let family = self
            .queue_families()
            .iter()
            .filter(|family| family.supports(flags) && family.queue_count > 0)
            .min_by_key(|family| (family.flags & !flags).iter().count())
            .ok_or_else(|| RhiError::DeviceCapability(format!("no queue family supports {flags:?}")))?;

        let native = self.context.backend.create_queue(family.index)?;
        let label = format!("{} queue (family {})", self.backend_kind().name(), family.index);
        log::debug!("created {label} for {flags:?}");
        Ok(CommandQueue::new(self.context.clone(), native, label))
    }

    #[profiling::function]
    pub fn create_buffer(&self, desc: &BufferDescriptor) -> RhiResult<Buffer> {
        self.context.ensure_ready()?;
        desc.validate(self.limits(), self.memory_types())?;
        let native = self.context.backend.create_buffer(desc)?;
        let tracking = self.context.tracker.register(ResourceKind::Buffer, &desc.label, desc.size);
        Ok(Buffer::new(desc.clone(), native, tracking))
    }

    #[profiling::function]
    pub fn create_texture(&self, desc: &TextureDescriptor) -> RhiResult<Texture> {
        self.context.ensure_ready()?;
        desc.validate(self.limits(), self.memory_types())?;
        let native = self.context.backend.create_texture(desc)?;
        let tracking = self.context.tracker.register(ResourceKind::Texture, &desc.label, desc.total_size());
        Ok(Texture::new(desc.clone(), native, tracking))
    }

    pub fn create_sampler_state(&self, desc: &SamplerDescriptor) -> RhiResult<SamplerState> {
        self.context.ensure_ready()?;
        desc.validate(self.limits())?;
        let native = self.context.backend.create_sampler(desc)?;
        let tracking = self.context.tracker.register(ResourceKind::Sampler, &desc.label, 0);
        Ok(SamplerState::new(desc.clone(), native, tracking))
    }

    pub fn create_shader_module(&self, desc: &ShaderModuleDescriptor) -> RhiResult<ShaderModule> {
        self.context.ensure_ready()?;
        desc.validate(self.limits())?;
        let native = self.context.backend.create_shader_module(desc)?;
        let bytes = desc.bytecode.len() as u64 * 4;
        let tracking = self.context.tracker.register(ResourceKind::ShaderModule, &desc.label, bytes);
        Ok(ShaderModule::new(desc.clone(), native, tracking))
    }

    pub fn create_shader_binding_set(&self, layout: &ShaderBindingSetLayout, label: &str) -> RhiResult<ShaderBindingSet> {
        self.context.ensure_ready()?;
        layout.validate(self.limits())?;
        let native = self.context.backend.create_binding_set(layout)?;
        let tracking = self.context.tracker.register(ResourceKind::BindingSet, label, 0);
        Ok(ShaderBindingSet::new(label, layout.clone(), native, tracking))
    }

    fn check_shader(&self, shader: &ShaderModule, pipeline: &str) -> RhiResult<()> {
        if shader.tracking().belongs_to(&self.context.tracker) {
            Ok(())
        } else {
            Err(RhiError::invalid_descriptor(format!(
                "pipeline '{pipeline}': shader '{}' belongs to another device",
                shader.label()
            )))
        }
    }

    /// Create a render pipeline, reusing a live pipeline with an identical descriptor.
    #[profiling::function]
    pub fn create_render_pipeline(&self, desc: &RenderPipelineDescriptor) -> RhiResult<RenderPipeline> {
        self.context.ensure_ready()?;
        desc.validate(self.limits())?;
        self.check_shader(&desc.vertex, &desc.label)?;

        let fingerprint = desc.fingerprint();
        if let Some(existing) = self.context.pipeline_cache.find_live::<RenderPipeline>(fingerprint) {
            log::trace!("render pipeline '{}' reuses '{}'", desc.label, existing.label());
            return Ok(existing);
        }

        let native = self.context.backend.create_render_pipeline(desc)?;
        let tracking = self.context.tracker.register(ResourceKind::RenderPipeline, &desc.label, 0);
        let pipeline = RenderPipeline::new(desc.clone(), desc.reflection(), native, tracking);
        self.record_pipeline(fingerprint, &pipeline, &desc.label);
        Ok(pipeline)
    }

    #[profiling::function]
    pub fn create_compute_pipeline(&self, desc: &ComputePipelineDescriptor) -> RhiResult<ComputePipeline> {
        self.context.ensure_ready()?;
        desc.validate(self.limits())?;
        self.check_shader(&desc.shader, &desc.label)?;

        let fingerprint = desc.fingerprint();
        if let Some(existing) = self.context.pipeline_cache.find_live::<ComputePipeline>(fingerprint) {
            log::trace!("compute pipeline '{}' reuses '{}'", desc.label, existing.label());
            return Ok(existing);
        }

        let native = self.context.backend.create_compute_pipeline(desc)?;
        let tracking = self.context.tracker.register(ResourceKind::ComputePipeline, &desc.label, 0);
        let pipeline = ComputePipeline::new(desc.clone(), desc.shader.reflection().clone(), native, tracking);
        self.record_pipeline(fingerprint, &pipeline, &desc.label);
        Ok(pipeline)
    }

    fn record_pipeline<P: CachedPipeline>(&self, fingerprint: u64, pipeline: &P, label: &str) {
        let hit = self.context.pipeline_cache.insert(fingerprint, pipeline);
        log::debug!(
            "pipeline '{label}' ({fingerprint:016x}) compiled, cache {}",
            if hit { "hit" } else { "miss" }
        );
    }

    pub fn create_event(&self, label: &str) -> RhiResult<Event> {
        self.context.ensure_ready()?;
        let native = self.context.backend.create_event()?;
        let tracking = self.context.tracker.register(ResourceKind::Event, label, 0);
        Ok(Event::new(label, native, tracking))
    }

    pub fn create_semaphore(&self, label: &str) -> RhiResult<Semaphore> {
        self.context.ensure_ready()?;
        let native = self.context.backend.create_semaphore()?;
        let tracking = self.context.tracker.register(ResourceKind::Semaphore, label, 0);
        Ok(Semaphore::new(label, native, tracking))
    }

    /// Persist the pipeline cache now. Returns the file written, or `None` when no cache
    /// directory is configured.
    pub fn save_pipeline_cache(&self) -> RhiResult<Option<PathBuf>> {
        self.context.pipeline_cache.save(self.context.backend.as_ref()).inspect_err(|err| {
            log::warn!("failed to save pipeline cache: {err}");
        })
    }

    #[inline]
    pub fn pipeline_cache_key(&self) -> &PipelineCacheKey {
        self.context.pipeline_cache.key()
    }

    /// Where the pipeline cache is persisted, if anywhere.
    #[inline]
    pub fn pipeline_cache_path(&self) -> Option<&std::path::Path> {
        self.context.pipeline_cache.path()
    }

    pub fn pipeline_cache_stats(&self) -> PipelineCacheStats {
        self.context.pipeline_cache.stats()
    }

    pub fn resource_stats(&self) -> ResourceStats {
        self.context.tracker.stats()
    }

    pub fn fence_pool_stats(&self) -> FencePoolStats {
        self.context.fence_pool.stats()
    }

    pub fn notifier_stats(&self) -> NotifierStats {
        self.context.notifier.stats()
    }

    /// Block until every queue of the device is idle.
    pub fn wait_idle(&self) -> RhiResult<()> {
        self.context.backend.wait_idle()
    }

    /// Wait for the GPU, drain every pending completion, save the pipeline cache when configured
    /// and refuse further work. Idempotent; also runs when the last handle drops.
    pub fn shutdown(&self) {
        self.context.shutdown();
    }
}

impl fmt::Debug for GraphicsDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphicsDevice")
            .field("backend", &self.backend_kind())
            .field("adapter", &self.adapter_info().name)
            .field("state", &self.state())
            .finish()
    }
}
