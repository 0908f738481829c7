//! Kestrel RHI - backend-agnostic GPU command submission and synchronization.
//!
//! A `GraphicsDevice` hands out queues and resources; command buffers record passes through
//! render, compute and blit encoders and are committed to their queue. Completion is observed
//! by a per-device notifier thread that fires registered callbacks and recycles fences.

pub mod backend;
pub mod buffer;
pub mod command;
pub mod config;
pub mod device;
pub mod encoder;
pub mod error;
pub mod event_loop;
pub mod notifier;
pub mod pipeline;
pub mod pipeline_cache;
pub mod queue;
pub mod sampler;
pub mod shader;
pub mod software;
pub mod synchronization;
pub mod texture;
pub mod tracker;
#[cfg(feature = "vulkan")]
pub mod vulkan;
mod utility;

pub use backend::{
    AdapterInfo, AdapterType, AsAny, BackendKind, DeviceBackend, DeviceLimits, MemoryTypeInfo,
    QueueCapability, QueueFamilyInfo, QueueFlags,
};
pub use buffer::{Buffer, BufferDescriptor, BufferUsage, BufferUsages, StorageMode};
pub use command::{CommandBuffer, CommandBufferCompletion, CommandBufferStatus};
pub use config::{
    BackendPreference, DeviceConfig, DeviceConfigBuilder, DeviceConfigBuilderError,
    SoftwareOptions, SoftwareOptionsBuilder,
};
pub use device::{DeviceState, GraphicsDevice};
pub use encoder::{
    BlitCommandEncoder, ColorAttachment, CommandEncoder, ComputeCommandEncoder, DepthAttachment,
    IndexFormat, LoadAction, PassKind, RenderCommandEncoder, RenderPassDescriptor, ScissorRect,
    StoreAction, Viewport,
};
pub use error::{RhiError, RhiResult};
pub use event_loop::{EventLoop, EventLoopProxy};
pub use notifier::{CompletionNotifier, CompletionStatus, Delivery, NotifierStats};
pub use pipeline::{
    BlendFactor, BlendOp, BlendState, ColorTargetState, ComputePipeline, ComputePipelineDescriptor,
    ComputePipelineDescriptorBuilder, CullMode, DepthStencilState, FrontFace, PolygonMode,
    PrimitiveTopology, RasterizationState, RenderPipeline, RenderPipelineDescriptor,
    RenderPipelineDescriptorBuilder, VertexAttribute, VertexBufferLayout, VertexFormat,
    VertexStepMode,
};
pub use pipeline_cache::{PipelineCacheKey, PipelineCacheStats};
pub use queue::{CommandQueue, CommandQueueStats};
pub use sampler::{AddressMode, CompareFunction, FilterMode, SamplerDescriptor, SamplerState};
pub use shader::{
    BindingError, BindingType, LayoutBinding, ShaderBinding, ShaderBindingSet,
    ShaderBindingSetLayout, ShaderModule, ShaderModuleDescriptor, ShaderReflection, ShaderStage,
    ShaderStages,
};
pub use software::{ExecutedPass, SoftwareDevice};
pub use synchronization::{Event, Fence, FencePool, FencePoolStats, Semaphore, SyncPoint};
pub use texture::{
    Texture, TextureDescriptor, TextureDimension, TextureFormat, TextureRegion, TextureUsage,
    TextureUsages,
};
pub use tracker::{KindStats, ResourceKind, ResourceStats};
