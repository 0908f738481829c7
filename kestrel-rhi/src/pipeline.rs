//! Render and compute pipeline descriptors and handles.

use std::fmt;
use std::sync::{Arc, Weak};
use derive_builder::Builder;

use crate::backend::{DeviceLimits, NativePipeline};
use crate::error::{RhiError, RhiResult};
use crate::sampler::CompareFunction;
use crate::shader::{ShaderModule, ShaderReflection, ShaderStage};
use crate::texture::TextureFormat;
use crate::tracker::TrackedAllocation;
use kestrel_core::collections::stable_hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Uint32,
    Uint32x2,
    Unorm8x4,
}

impl VertexFormat {
    pub fn size(self) -> u32 {
        match self {
            VertexFormat::Float32 | VertexFormat::Uint32 | VertexFormat::Unorm8x4 => 4,
            VertexFormat::Float32x2 | VertexFormat::Uint32x2 => 8,
            VertexFormat::Float32x3 => 12,
            VertexFormat::Float32x4 => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum VertexStepMode {
    #[default]
    Vertex,
    Instance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexBufferLayout {
    pub binding: u32,
    pub stride: u32,
    pub step_mode: VertexStepMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CullMode {
    #[default]
    None,
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum FrontFace {
    #[default]
    CounterClockwise,
    Clockwise,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PolygonMode {
    #[default]
    Fill,
    Line,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Builder)]
#[builder(setter(into))]
pub struct RasterizationState {
    #[builder(default)]
    pub cull_mode: CullMode,
    #[builder(default)]
    pub front_face: FrontFace,
    #[builder(default)]
    pub polygon_mode: PolygonMode,
    #[builder(default)]
    pub depth_clamp: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstColor,
    OneMinusDstColor,
    DstAlpha,
    OneMinusDstAlpha,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum BlendOp {
    #[default]
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Builder)]
#[builder(setter(into))]
pub struct BlendState {
    #[builder(default = "BlendFactor::One")]
    pub src_color: BlendFactor,
    #[builder(default = "BlendFactor::Zero")]
    pub dst_color: BlendFactor,
    #[builder(default)]
    pub color_op: BlendOp,
    #[builder(default = "BlendFactor::One")]
    pub src_alpha: BlendFactor,
    #[builder(default = "BlendFactor::Zero")]
    pub dst_alpha: BlendFactor,
    #[builder(default)]
    pub alpha_op: BlendOp,
}

impl BlendState {
    pub const ALPHA_BLENDING: BlendState = BlendState {
        src_color: BlendFactor::SrcAlpha,
        dst_color: BlendFactor::OneMinusSrcAlpha,
        color_op: BlendOp::Add,
        src_alpha: BlendFactor::One,
        dst_alpha: BlendFactor::OneMinusSrcAlpha,
        alpha_op: BlendOp::Add,
    };
}

pub const COLOR_WRITE_ALL: u8 = 0b1111;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Builder)]
#[builder(setter(into))]
pub struct ColorTargetState {
    pub format: TextureFormat,
    #[builder(default, setter(strip_option))]
    pub blend: Option<BlendState>,
    /// RGBA channel mask, bit 0 is red.
    #[builder(default = "COLOR_WRITE_ALL")]
    pub write_mask: u8,
}

impl ColorTargetState {
    pub fn new(format: TextureFormat) -> Self {
        Self {
            format,
            blend: None,
            write_mask: COLOR_WRITE_ALL,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Builder)]
#[builder(setter(into))]
pub struct DepthStencilState {
    pub format: TextureFormat,
    #[builder(default = "true")]
    pub depth_write: bool,
    #[builder(default = "CompareFunction::Less")]
    pub depth_compare: CompareFunction,
}

/// Render pipeline descriptor for `GraphicsDevice::create_render_pipeline`.
#[derive(Clone, Debug, Builder)]
#[builder(setter(into))]
pub struct RenderPipelineDescriptor {
    #[builder(default)]
    pub label: String,
    pub vertex: ShaderModule,
    #[builder(default, setter(strip_option))]
    pub fragment: Option<ShaderModule>,
    #[builder(default)]
    pub vertex_buffers: Vec<VertexBufferLayout>,
    #[builder(default)]
    pub vertex_attributes: Vec<VertexAttribute>,
    #[builder(default)]
    pub topology: PrimitiveTopology,
    #[builder(default)]
    pub rasterization: RasterizationState,
    #[builder(default)]
    pub color_targets: Vec<ColorTargetState>,
    #[builder(default, setter(strip_option))]
    pub depth_stencil: Option<DepthStencilState>,
    #[builder(default = "1")]
    pub sample_count: u32,
}

impl RenderPipelineDescriptor {
    /// Combined binding metadata of every stage.
    pub fn reflection(&self) -> ShaderReflection {
        match &self.fragment {
            Some(fragment) => ShaderReflection::merge(&[self.vertex.reflection(), fragment.reflection()]),
            None => self.vertex.reflection().clone(),
        }
    }

    /// Content hash of everything but the label. Stable across runs.
    pub fn fingerprint(&self) -> u64 {
        stable_hash(&(
            "render",
            self.vertex.fingerprint(),
            self.fragment.as_ref().map(ShaderModule::fingerprint),
            &self.vertex_buffers,
            &self.vertex_attributes,
            self.topology,
            self.rasterization,
            &self.color_targets,
            self.depth_stencil,
            self.sample_count,
        ))
    }

    pub(crate) fn validate(&self, limits: &DeviceLimits) -> RhiResult<()> {
        let invalid = |msg: String| Err(RhiError::invalid_descriptor(format!("pipeline '{}': {msg}", self.label)));

        if self.vertex.stage() != ShaderStage::Vertex {
            return invalid(format!("'{}' is not a vertex shader", self.vertex.label()));
        }
        if let Some(fragment) = &self.fragment {
            if fragment.stage() != ShaderStage::Fragment {
                return invalid(format!("'{}' is not a fragment shader", fragment.label()));
            }
            if !self.vertex.tracking().same_device(fragment.tracking()) {
                return invalid("shader stages belong to different devices".to_owned());
            }
        }
        if self.color_targets.is_empty() && self.depth_stencil.is_none() && self.fragment.is_some() {
            return invalid("fragment shader without any render target".to_owned());
        }
        if self.color_targets.len() as u32 > limits.max_color_attachments {
            return invalid(format!(
                "{} color targets exceed the device limit of {}",
                self.color_targets.len(),
                limits.max_color_attachments
            ));
        }
        if let Some(target) = self.color_targets.iter().find(|t| t.format.is_depth()) {
            return invalid(format!("depth format {:?} used as a color target", target.format));
        }
        if let Some(depth) = &self.depth_stencil {
            if !depth.format.is_depth() {
                return invalid(format!("{:?} is not a depth format", depth.format));
            }
        }
        if !limits.supports_sample_count(self.sample_count) {
            return invalid(format!("unsupported sample count {}", self.sample_count));
        }
        if self.vertex_buffers.len() as u32 > limits.max_vertex_buffers {
            return invalid(format!("{} vertex buffers exceed the device limit", self.vertex_buffers.len()));
        }
        if self.vertex_attributes.len() as u32 > limits.max_vertex_attributes {
            return invalid(format!("{} vertex attributes exceed the device limit", self.vertex_attributes.len()));
        }
        for attribute in &self.vertex_attributes {
            let Some(layout) = self.vertex_buffers.iter().find(|b| b.binding == attribute.binding) else {
                return invalid(format!(
                    "attribute at location {} reads undeclared vertex buffer {}",
                    attribute.location, attribute.binding
                ));
            };
            if attribute.offset + attribute.format.size() > layout.stride {
                return invalid(format!("attribute at location {} overruns its vertex stride", attribute.location));
            }
        }
        if let Some(fragment) = &self.fragment {
            for a in &self.vertex.reflection().bindings {
                let conflict = fragment
                    .reflection()
                    .bindings
                    .iter()
                    .find(|b| b.set == a.set && b.binding == a.binding && b.binding_type != a.binding_type);
                if let Some(b) = conflict {
                    return invalid(format!(
                        "set {} binding {} is {:?} in the vertex stage but {:?} in the fragment stage",
                        a.set, a.binding, a.binding_type, b.binding_type
                    ));
                }
            }
        }
        self.reflection().validate(limits)
    }
}

/// Compute pipeline descriptor for `GraphicsDevice::create_compute_pipeline`.
#[derive(Clone, Debug, Builder)]
#[builder(setter(into))]
pub struct ComputePipelineDescriptor {
    #[builder(default)]
    pub label: String,
    pub shader: ShaderModule,
    #[builder(default = "[64, 1, 1]")]
    pub threadgroup_size: [u32; 3],
}

impl ComputePipelineDescriptor {
    pub fn new(label: &str, shader: ShaderModule) -> Self {
        Self {
            label: label.to_owned(),
            shader,
            threadgroup_size: [64, 1, 1],
        }
    }

    pub fn fingerprint(&self) -> u64 {
        stable_hash(&("compute", self.shader.fingerprint(), self.threadgroup_size))
    }

    pub(crate) fn validate(&self, limits: &DeviceLimits) -> RhiResult<()> {
        if self.shader.stage() != ShaderStage::Compute {
            return Err(RhiError::invalid_descriptor(format!(
                "pipeline '{}': '{}' is not a compute shader",
                self.label,
                self.shader.label()
            )));
        }
        let total: u64 = self.threadgroup_size.iter().map(|&s| s as u64).product();
        let per_axis_ok = self
            .threadgroup_size
            .iter()
            .zip(limits.max_threads_per_threadgroup)
            .all(|(&size, max)| size > 0 && size <= max);
        if !per_axis_ok || total > limits.max_total_threads_per_threadgroup as u64 {
            return Err(RhiError::invalid_descriptor(format!(
                "pipeline '{}': threadgroup size {:?} exceeds the device limits",
                self.label, self.threadgroup_size
            )));
        }
        self.shader.reflection().validate(limits)
    }
}

pub(crate) struct PipelineInner<D> {
    pub(crate) desc: D,
    pub(crate) fingerprint: u64,
    pub(crate) reflection: ShaderReflection,
    pub(crate) native: Arc<dyn NativePipeline>,
    pub(crate) tracking: TrackedAllocation,
}

macro_rules! pipeline_handle {
    ($name:ident, $desc:ty) => {
        #[derive(Clone)]
        pub struct $name {
            pub(crate) inner: Arc<PipelineInner<$desc>>,
        }

        impl $name {
            pub(crate) fn new(desc: $desc, reflection: ShaderReflection, native: Arc<dyn NativePipeline>, tracking: TrackedAllocation) -> Self {
                let fingerprint = desc.fingerprint();
                Self {
                    inner: Arc::new(PipelineInner { desc, fingerprint, reflection, native, tracking }),
                }
            }

            #[inline]
            pub fn label(&self) -> &str {
                &self.inner.desc.label
            }

            #[inline]
            pub fn descriptor(&self) -> &$desc {
                &self.inner.desc
            }

            #[inline]
            pub fn fingerprint(&self) -> u64 {
                self.inner.fingerprint
            }

            /// Binding metadata of every stage, merged.
            #[inline]
            pub fn reflection(&self) -> &ShaderReflection {
                &self.inner.reflection
            }

            #[inline]
            pub fn native(&self) -> &dyn NativePipeline {
                self.inner.native.as_ref()
            }

            #[inline]
            pub(crate) fn tracking(&self) -> &TrackedAllocation {
                &self.inner.tracking
            }

            #[inline]
            pub fn ptr_eq(&self, other: &Self) -> bool {
                Arc::ptr_eq(&self.inner, &other.inner)
            }

            pub(crate) fn downgrade(&self) -> Weak<PipelineInner<$desc>> {
                Arc::downgrade(&self.inner)
            }

            pub(crate) fn upgrade(weak: &Weak<PipelineInner<$desc>>) -> Option<Self> {
                weak.upgrade().map(|inner| Self { inner })
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("label", &self.label())
                    .field("fingerprint", &format_args!("{:016x}", self.fingerprint()))
                    .finish()
            }
        }
    };
}

pipeline_handle!(RenderPipeline, RenderPipelineDescriptor);
pipeline_handle!(ComputePipeline, ComputePipelineDescriptor);
