//! Shader modules, binding metadata and shader binding sets.
//!
//! Bytecode arrives already compiled and validated, together with its binding metadata. This
//! module only checks the metadata against device limits and keeps binding sets consistent
//! with their layout.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use enumflags2::{bitflags, BitFlags};
use parking_lot::Mutex;
use kestrel_core::collections::hashmap::HashMap;

use crate::backend::{DeviceLimits, NativeBindingSet, NativeShaderModule};
use crate::buffer::{Buffer, BufferUsage};
use crate::error::{RhiError, RhiResult};
use crate::sampler::SamplerState;
use crate::texture::{Texture, TextureUsage};
use crate::tracker::TrackedAllocation;
use crate::utility::normalize_range_u64;

pub const SPIRV_MAGIC: u32 = 0x0723_0203;

#[bitflags]
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex = 1 << 0,
    Fragment = 1 << 1,
    Compute = 1 << 2,
}

pub type ShaderStages = BitFlags<ShaderStage>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingType {
    UniformBuffer,
    StorageBuffer,
    SampledTexture,
    StorageTexture,
    Sampler,
}

impl BindingType {
    #[inline]
    pub fn is_buffer(self) -> bool {
        matches!(self, BindingType::UniformBuffer | BindingType::StorageBuffer)
    }

    #[inline]
    pub fn is_texture(self) -> bool {
        matches!(self, BindingType::SampledTexture | BindingType::StorageTexture)
    }
}

/// A single shader resource binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShaderBinding {
    pub name: String,
    pub set: u32,
    pub binding: u32,
    pub binding_type: BindingType,
    pub count: u32,
    pub stages: ShaderStages,
}

/// Binding metadata produced by the offline shader compiler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ShaderReflection {
    pub bindings: Vec<ShaderBinding>,
    pub push_constant_size: u32,
}

impl ShaderReflection {
    /// Merge multiple reflections into one.
    /// Stage flags of bindings sharing the same (set, binding) are combined.
    pub fn merge(reflections: &[&ShaderReflection]) -> Self {
        let mut binding_map: HashMap<(u32, u32), ShaderBinding> = HashMap::default();
        let mut push_constant_size = 0u32;

        for reflection in reflections {
            push_constant_size = push_constant_size.max(reflection.push_constant_size);

            for binding in &reflection.bindings {
                binding_map
                    .entry((binding.set, binding.binding))
                    .and_modify(|existing| existing.stages |= binding.stages)
                    .or_insert_with(|| binding.clone());
            }
        }

        let mut bindings: Vec<ShaderBinding> = binding_map.into_values().collect();
        bindings.sort_by_key(|b| (b.set, b.binding));

        Self {
            bindings,
            push_constant_size,
        }
    }

    pub fn find_binding(&self, name: &str) -> Option<&ShaderBinding> {
        self.bindings.iter().find(|b| b.name == name)
    }

    /// Number of binding sets, counting gaps below the highest used set.
    pub fn set_count(&self) -> u32 {
        self.bindings.iter().map(|b| b.set + 1).max().unwrap_or(0)
    }

    /// Layout of binding set `set`; empty when no binding uses it.
    pub fn binding_set_layout(&self, set: u32) -> ShaderBindingSetLayout {
        ShaderBindingSetLayout::new(
            self.bindings
                .iter()
                .filter(|b| b.set == set)
                .map(|b| LayoutBinding {
                    binding: b.binding,
                    binding_type: b.binding_type,
                    count: b.count,
                    stages: b.stages,
                })
                .collect(),
        )
    }

    pub(crate) fn validate(&self, limits: &DeviceLimits) -> RhiResult<()> {
        if self.push_constant_size > limits.max_push_constant_size {
            return Err(RhiError::invalid_descriptor(format!(
                "push constant block of {} bytes exceeds the device limit of {}",
                self.push_constant_size, limits.max_push_constant_size
            )));
        }
        if self.set_count() > limits.max_binding_sets {
            return Err(RhiError::invalid_descriptor(format!(
                "{} binding sets exceed the device limit of {}",
                self.set_count(),
                limits.max_binding_sets
            )));
        }
        for set in 0..self.set_count() {
            self.binding_set_layout(set).validate(limits)?;
        }
        Ok(())
    }
}

/// Layout binding information.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LayoutBinding {
    pub binding: u32,
    pub binding_type: BindingType,
    pub count: u32,
    pub stages: ShaderStages,
}

/// Binding layout of one shader binding set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ShaderBindingSetLayout {
    bindings: Vec<LayoutBinding>,
}

impl ShaderBindingSetLayout {
    pub fn new(mut bindings: Vec<LayoutBinding>) -> Self {
        bindings.sort_by_key(|b| b.binding);
        Self { bindings }
    }

    pub fn bindings(&self) -> &[LayoutBinding] {
        &self.bindings
    }

    pub fn get_binding(&self, binding: u32) -> Option<&LayoutBinding> {
        self.bindings
            .binary_search_by_key(&binding, |b| b.binding)
            .ok()
            .map(|i| &self.bindings[i])
    }

    pub(crate) fn validate(&self, limits: &DeviceLimits) -> RhiResult<()> {
        if self.bindings.len() as u32 > limits.max_bindings_per_set {
            return Err(RhiError::invalid_descriptor(format!(
                "{} bindings exceed the per-set limit of {}",
                self.bindings.len(),
                limits.max_bindings_per_set
            )));
        }
        for pair in self.bindings.windows(2) {
            if pair[0].binding == pair[1].binding {
                return Err(RhiError::invalid_descriptor(format!("binding {} declared twice", pair[0].binding)));
            }
        }
        if let Some(b) = self.bindings.iter().find(|b| b.count == 0) {
            return Err(RhiError::invalid_descriptor(format!("binding {} has an array count of zero", b.binding)));
        }
        Ok(())
    }

    fn check(&self, binding: u32, array_index: u32, accepts: impl Fn(BindingType) -> bool, got: &'static str) -> Result<&LayoutBinding, BindingError> {
        let entry = self.get_binding(binding).ok_or(BindingError::BindingNotFound(binding))?;
        if !accepts(entry.binding_type) {
            return Err(BindingError::TypeMismatch {
                binding,
                expected: entry.binding_type,
                got,
            });
        }
        if array_index >= entry.count {
            return Err(BindingError::ArrayIndexOutOfBounds {
                binding,
                index: array_index,
                max: entry.count,
            });
        }
        Ok(entry)
    }
}

/// Shader binding validation error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindingError {
    #[error("binding {0} not found in layout")]
    BindingNotFound(u32),
    #[error("type mismatch at binding {binding}: layout expects {expected:?}, got a {got}")]
    TypeMismatch {
        binding: u32,
        expected: BindingType,
        got: &'static str,
    },
    #[error("array index {index} out of bounds at binding {binding} (count {max})")]
    ArrayIndexOutOfBounds { binding: u32, index: u32, max: u32 },
}

impl From<BindingError> for RhiError {
    fn from(err: BindingError) -> Self {
        RhiError::InvalidDescriptor(err.to_string())
    }
}

/// Shader module descriptor for `GraphicsDevice::create_shader_module`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderModuleDescriptor {
    pub label: String,
    pub stage: ShaderStage,
    pub entry_point: String,
    /// SPIR-V words.
    pub bytecode: Vec<u32>,
    pub reflection: ShaderReflection,
}

impl ShaderModuleDescriptor {
    pub fn new(label: &str, stage: ShaderStage, bytecode: Vec<u32>) -> Self {
        Self {
            label: label.to_owned(),
            stage,
            entry_point: "main".to_owned(),
            bytecode,
            reflection: ShaderReflection::default(),
        }
    }

    /// Build from little-endian SPIR-V bytes as read from disk.
    pub fn from_spirv_bytes(label: &str, stage: ShaderStage, bytes: &[u8]) -> RhiResult<Self> {
        if bytes.len() % 4 != 0 {
            return Err(RhiError::invalid_descriptor(format!(
                "shader '{label}': SPIR-V length {} is not a multiple of 4",
                bytes.len()
            )));
        }
        let words = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self::new(label, stage, words))
    }

    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = entry_point.into();
        self
    }

    pub fn with_reflection(mut self, reflection: ShaderReflection) -> Self {
        self.reflection = reflection;
        self
    }

    pub(crate) fn validate(&self, limits: &DeviceLimits) -> RhiResult<()> {
        if self.bytecode.is_empty() {
            return Err(RhiError::invalid_descriptor(format!("shader '{}' has no bytecode", self.label)));
        }
        if self.entry_point.is_empty() {
            return Err(RhiError::invalid_descriptor(format!("shader '{}' has no entry point", self.label)));
        }
        if let Some(b) = self.reflection.bindings.iter().find(|b| !b.stages.contains(self.stage)) {
            return Err(RhiError::invalid_descriptor(format!(
                "shader '{}': binding '{}' is not visible to the {:?} stage",
                self.label, b.name, self.stage
            )));
        }
        self.reflection.validate(limits)
    }

    /// Content hash; identical bytecode and metadata give identical fingerprints across runs.
    pub fn fingerprint(&self) -> u64 {
        kestrel_core::collections::stable_hash(&(self.stage, &self.entry_point, &self.bytecode, &self.reflection))
    }
}

struct ShaderModuleInner {
    desc: ShaderModuleDescriptor,
    fingerprint: u64,
    native: Arc<dyn NativeShaderModule>,
    tracking: TrackedAllocation,
}

#[derive(Clone)]
pub struct ShaderModule {
    inner: Arc<ShaderModuleInner>,
}

impl ShaderModule {
    pub(crate) fn new(desc: ShaderModuleDescriptor, native: Arc<dyn NativeShaderModule>, tracking: TrackedAllocation) -> Self {
        let fingerprint = desc.fingerprint();
        Self {
            inner: Arc::new(ShaderModuleInner { desc, fingerprint, native, tracking }),
        }
    }

    #[inline]
    pub fn label(&self) -> &str {
        &self.inner.desc.label
    }

    #[inline]
    pub fn stage(&self) -> ShaderStage {
        self.inner.desc.stage
    }

    #[inline]
    pub fn entry_point(&self) -> &str {
        &self.inner.desc.entry_point
    }

    #[inline]
    pub fn reflection(&self) -> &ShaderReflection {
        &self.inner.desc.reflection
    }

    #[inline]
    pub fn fingerprint(&self) -> u64 {
        self.inner.fingerprint
    }

    #[inline]
    pub fn native(&self) -> &dyn NativeShaderModule {
        self.inner.native.as_ref()
    }

    #[inline]
    pub(crate) fn tracking(&self) -> &TrackedAllocation {
        &self.inner.tracking
    }
}

impl PartialEq for ShaderModule {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint() == other.fingerprint()
    }
}

impl Eq for ShaderModule {}

impl Hash for ShaderModule {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fingerprint().hash(state);
    }
}

impl fmt::Debug for ShaderModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShaderModule")
            .field("label", &self.label())
            .field("stage", &self.stage())
            .field("fingerprint", &format_args!("{:016x}", self.fingerprint()))
            .finish()
    }
}

// Held only for lifetime.
#[allow(dead_code)]
enum BoundResource {
    Buffer(Buffer),
    Texture(Texture),
    Sampler(SamplerState),
}

struct BindingSetInner {
    label: String,
    layout: ShaderBindingSetLayout,
    native: Arc<dyn NativeBindingSet>,
    /// Keeps every written resource alive as long as the set is.
    bound: Mutex<HashMap<(u32, u32), BoundResource>>,
    tracking: TrackedAllocation,
}

/// A set of resources bound together, written through its layout.
#[derive(Clone)]
pub struct ShaderBindingSet {
    inner: Arc<BindingSetInner>,
}

impl ShaderBindingSet {
    pub(crate) fn new(label: &str, layout: ShaderBindingSetLayout, native: Arc<dyn NativeBindingSet>, tracking: TrackedAllocation) -> Self {
        Self {
            inner: Arc::new(BindingSetInner {
                label: label.to_owned(),
                layout,
                native,
                bound: Mutex::new(HashMap::default()),
                tracking,
            }),
        }
    }

    #[inline]
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    #[inline]
    pub fn layout(&self) -> &ShaderBindingSetLayout {
        &self.inner.layout
    }

    #[inline]
    pub fn native(&self) -> &dyn NativeBindingSet {
        self.inner.native.as_ref()
    }

    #[inline]
    pub(crate) fn tracking(&self) -> &TrackedAllocation {
        &self.inner.tracking
    }

    fn check_device(&self, other: &TrackedAllocation, what: &str) -> RhiResult<()> {
        if self.inner.tracking.same_device(other) {
            Ok(())
        } else {
            Err(RhiError::invalid_descriptor(format!(
                "{what} bound to set '{}' belongs to another device",
                self.label()
            )))
        }
    }

    /// Bind `range` of `buffer` at `binding[array_index]`.
    pub fn set_buffer<R: std::ops::RangeBounds<u64>>(&self, binding: u32, array_index: u32, buffer: &Buffer, range: R) -> RhiResult<()> {
        let entry = self.inner.layout.check(binding, array_index, BindingType::is_buffer, "buffer")?;
        self.check_device(buffer.tracking(), "buffer")?;

        let required = match entry.binding_type {
            BindingType::UniformBuffer => BufferUsage::Uniform,
            _ => BufferUsage::Storage,
        };
        if !buffer.usage().contains(required) {
            return Err(RhiError::invalid_descriptor(format!(
                "buffer '{}' lacks {required:?} usage for binding {binding}",
                buffer.label()
            )));
        }
        let (offset, length) = normalize_range_u64(range, buffer.size())?;

        self.inner.native.write_buffer(binding, array_index, buffer.native(), offset, length)?;
        self.inner.bound.lock().insert((binding, array_index), BoundResource::Buffer(buffer.clone()));
        Ok(())
    }

    pub fn set_texture(&self, binding: u32, array_index: u32, texture: &Texture) -> RhiResult<()> {
        let entry = self.inner.layout.check(binding, array_index, BindingType::is_texture, "texture")?;
        self.check_device(texture.tracking(), "texture")?;

        let required = match entry.binding_type {
            BindingType::StorageTexture => TextureUsage::Storage,
            _ => TextureUsage::Sampled,
        };
        if !texture.descriptor().usage.contains(required) {
            return Err(RhiError::invalid_descriptor(format!(
                "texture '{}' lacks {required:?} usage for binding {binding}",
                texture.label()
            )));
        }

        self.inner.native.write_texture(binding, array_index, texture.native())?;
        self.inner.bound.lock().insert((binding, array_index), BoundResource::Texture(texture.clone()));
        Ok(())
    }

    pub fn set_sampler(&self, binding: u32, array_index: u32, sampler: &SamplerState) -> RhiResult<()> {
        self.inner.layout.check(binding, array_index, |ty| ty == BindingType::Sampler, "sampler")?;
        self.check_device(sampler.tracking(), "sampler")?;

        self.inner.native.write_sampler(binding, array_index, sampler.native())?;
        self.inner.bound.lock().insert((binding, array_index), BoundResource::Sampler(sampler.clone()));
        Ok(())
    }

    /// Number of array elements currently written.
    pub fn bound_count(&self) -> usize {
        self.inner.bound.lock().len()
    }
}

impl fmt::Debug for ShaderBindingSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShaderBindingSet")
            .field("label", &self.label())
            .field("bindings", &self.layout().bindings().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(name: &str, set: u32, binding: u32, binding_type: BindingType, stage: ShaderStage) -> ShaderBinding {
        ShaderBinding {
            name: name.to_owned(),
            set,
            binding,
            binding_type,
            count: 1,
            stages: stage.into(),
        }
    }

    #[test]
    fn merge_combines_stages() {
        let vs = ShaderReflection {
            bindings: vec![binding("camera", 0, 0, BindingType::UniformBuffer, ShaderStage::Vertex)],
            push_constant_size: 16,
        };
        let fs = ShaderReflection {
            bindings: vec![
                binding("camera", 0, 0, BindingType::UniformBuffer, ShaderStage::Fragment),
                binding("albedo", 1, 0, BindingType::SampledTexture, ShaderStage::Fragment),
            ],
            push_constant_size: 64,
        };

        let merged = ShaderReflection::merge(&[&vs, &fs]);
        assert_eq!(merged.push_constant_size, 64);
        assert_eq!(merged.set_count(), 2);
        assert_eq!(merged.bindings[0].stages, ShaderStage::Vertex | ShaderStage::Fragment);
        assert_eq!(merged.binding_set_layout(1).bindings().len(), 1);
        assert!(merged.binding_set_layout(3).bindings().is_empty());
    }

    #[test]
    fn layout_checks() {
        let layout = ShaderBindingSetLayout::new(vec![
            LayoutBinding { binding: 2, binding_type: BindingType::Sampler, count: 1, stages: ShaderStage::Fragment.into() },
            LayoutBinding { binding: 0, binding_type: BindingType::StorageBuffer, count: 4, stages: ShaderStage::Compute.into() },
        ]);
        assert_eq!(layout.bindings()[0].binding, 0);

        assert!(layout.check(0, 3, BindingType::is_buffer, "buffer").is_ok());
        assert_eq!(
            layout.check(0, 4, BindingType::is_buffer, "buffer").unwrap_err(),
            BindingError::ArrayIndexOutOfBounds { binding: 0, index: 4, max: 4 }
        );
        assert_eq!(layout.check(1, 0, BindingType::is_buffer, "buffer").unwrap_err(), BindingError::BindingNotFound(1));
        assert!(matches!(
            layout.check(2, 0, BindingType::is_texture, "texture"),
            Err(BindingError::TypeMismatch { binding: 2, .. })
        ));

        let duplicate = ShaderBindingSetLayout::new(vec![
            LayoutBinding { binding: 0, binding_type: BindingType::Sampler, count: 1, stages: ShaderStage::Fragment.into() },
            LayoutBinding { binding: 0, binding_type: BindingType::Sampler, count: 1, stages: ShaderStage::Fragment.into() },
        ]);
        assert!(duplicate.validate(&DeviceLimits::default()).is_err());
    }

    #[test]
    fn spirv_bytes_and_fingerprint() {
        let bytes: Vec<u8> = [SPIRV_MAGIC, 0x0001_0300].iter().flat_map(|w| w.to_le_bytes()).collect();
        let desc = ShaderModuleDescriptor::from_spirv_bytes("vs", ShaderStage::Vertex, &bytes).unwrap();
        assert_eq!(desc.bytecode[0], SPIRV_MAGIC);
        assert!(ShaderModuleDescriptor::from_spirv_bytes("vs", ShaderStage::Vertex, &bytes[..5]).is_err());

        let same = desc.clone();
        assert_eq!(desc.fingerprint(), same.fingerprint());
        assert_ne!(desc.fingerprint(), desc.clone().with_entry_point("vs_main").fingerprint());
        assert!(ShaderModuleDescriptor::new("empty", ShaderStage::Compute, Vec::new())
            .validate(&DeviceLimits::default())
            .is_err());
    }
}
