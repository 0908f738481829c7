//! Textures, formats and copy regions.

use std::fmt;
use std::sync::Arc;
use enumflags2::{bitflags, BitFlags};

use crate::backend::{DeviceLimits, MemoryTypeInfo, NativeTexture};
use crate::buffer::StorageMode;
use crate::error::{RhiError, RhiResult};
use crate::tracker::TrackedAllocation;
use crate::utility::{full_mip_chain, mip_extent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    Bgra8Srgb,
    R16Float,
    Rgba16Float,
    R32Float,
    Rg32Float,
    Rgba32Float,
    R32Uint,
    Depth32Float,
    Depth24Stencil8,
}

impl TextureFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            TextureFormat::R8Unorm => 1,
            TextureFormat::Rg8Unorm | TextureFormat::R16Float => 2,
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8Srgb
            | TextureFormat::Bgra8Unorm
            | TextureFormat::Bgra8Srgb
            | TextureFormat::R32Float
            | TextureFormat::R32Uint
            | TextureFormat::Depth32Float
            | TextureFormat::Depth24Stencil8 => 4,
            TextureFormat::Rgba16Float | TextureFormat::Rg32Float => 8,
            TextureFormat::Rgba32Float => 16,
        }
    }

    #[inline]
    pub fn is_depth(self) -> bool {
        matches!(self, TextureFormat::Depth32Float | TextureFormat::Depth24Stencil8)
    }

    #[inline]
    pub fn has_stencil(self) -> bool {
        matches!(self, TextureFormat::Depth24Stencil8)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TextureDimension {
    D1,
    #[default]
    D2,
    D3,
}

#[bitflags]
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureUsage {
    Sampled = 1 << 0,
    Storage = 1 << 1,
    RenderTarget = 1 << 2,
    CopySrc = 1 << 3,
    CopyDst = 1 << 4,
}

pub type TextureUsages = BitFlags<TextureUsage>;

/// Texture descriptor for `GraphicsDevice::create_texture`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TextureDescriptor {
    pub label: String,
    pub format: TextureFormat,
    pub dimension: TextureDimension,
    pub width: u32,
    pub height: u32,
    /// Depth of a 3D texture; 1 otherwise.
    pub depth: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub sample_count: u32,
    pub usage: TextureUsages,
    pub storage_mode: StorageMode,
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            label: String::new(),
            format: TextureFormat::Rgba8Unorm,
            dimension: TextureDimension::D2,
            width: 1,
            height: 1,
            depth: 1,
            mip_levels: 1,
            array_layers: 1,
            sample_count: 1,
            usage: TextureUsage::Sampled | TextureUsage::CopyDst,
            storage_mode: StorageMode::Private,
        }
    }
}

impl TextureDescriptor {
    pub fn new_2d(label: &str, width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            label: label.to_owned(),
            format,
            width,
            height,
            ..Default::default()
        }
    }

    pub fn new_3d(label: &str, width: u32, height: u32, depth: u32, format: TextureFormat) -> Self {
        Self {
            label: label.to_owned(),
            format,
            dimension: TextureDimension::D3,
            width,
            height,
            depth,
            ..Default::default()
        }
    }

    /// Color render target that can also be copied out.
    pub fn render_target(label: &str, width: u32, height: u32, format: TextureFormat) -> Self {
        Self::new_2d(label, width, height, format)
            .with_usage(TextureUsage::RenderTarget | TextureUsage::Sampled | TextureUsage::CopySrc)
    }

    pub fn depth(label: &str, width: u32, height: u32, format: TextureFormat) -> Self {
        Self::new_2d(label, width, height, format).with_usage(TextureUsage::RenderTarget.into())
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_usage(mut self, usage: TextureUsages) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_additional_usage(mut self, usage: impl Into<TextureUsages>) -> Self {
        self.usage |= usage.into();
        self
    }

    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    pub fn with_array_layers(mut self, array_layers: u32) -> Self {
        self.array_layers = array_layers;
        self
    }

    pub fn with_sample_count(mut self, sample_count: u32) -> Self {
        self.sample_count = sample_count;
        self
    }

    pub fn with_storage_mode(mut self, mode: StorageMode) -> Self {
        self.storage_mode = mode;
        self
    }

    /// Extent of `mip_level` as `[width, height, depth]`.
    pub fn mip_size(&self, mip_level: u32) -> [u32; 3] {
        [
            mip_extent(self.width, mip_level),
            mip_extent(self.height, mip_level),
            mip_extent(self.depth, mip_level),
        ]
    }

    /// Byte size of one subresource (one mip of one layer), tightly packed.
    pub fn subresource_size(&self, mip_level: u32) -> u64 {
        let [w, h, d] = self.mip_size(mip_level);
        w as u64 * h as u64 * d as u64 * self.format.bytes_per_pixel() as u64
    }

    /// Total tightly packed byte size of every subresource.
    pub fn total_size(&self) -> u64 {
        let per_layer: u64 = (0..self.mip_levels).map(|mip| self.subresource_size(mip)).sum();
        per_layer * self.array_layers as u64 * self.sample_count as u64
    }

    pub(crate) fn validate(&self, limits: &DeviceLimits, memory_types: &[MemoryTypeInfo]) -> RhiResult<()> {
        let invalid = |msg: String| Err(RhiError::invalid_descriptor(format!("texture '{}': {msg}", self.label)));

        if self.width == 0 || self.height == 0 || self.depth == 0 {
            return invalid(format!("extent {}x{}x{} has a zero axis", self.width, self.height, self.depth));
        }
        let (max_extent, shape_ok) = match self.dimension {
            TextureDimension::D1 => (limits.max_texture_dimension_1d, self.height == 1 && self.depth == 1),
            TextureDimension::D2 => (limits.max_texture_dimension_2d, self.depth == 1),
            TextureDimension::D3 => (limits.max_texture_dimension_3d, self.array_layers == 1),
        };
        if !shape_ok {
            return invalid(format!("{}x{}x{} with {} layers is not a valid {:?} shape", self.width, self.height, self.depth, self.array_layers, self.dimension));
        }
        if self.width.max(self.height).max(self.depth) > max_extent {
            return invalid(format!("extent exceeds the device limit of {max_extent}"));
        }
        if self.array_layers == 0 || self.array_layers > limits.max_texture_array_layers {
            return invalid(format!("{} array layers (limit {})", self.array_layers, limits.max_texture_array_layers));
        }
        let max_mips = full_mip_chain(self.width, self.height, self.depth);
        if self.mip_levels == 0 || self.mip_levels > max_mips {
            return invalid(format!("{} mip levels, at most {max_mips} possible", self.mip_levels));
        }
        if !limits.supports_sample_count(self.sample_count) {
            return invalid(format!("unsupported sample count {}", self.sample_count));
        }
        if self.sample_count > 1 && (self.dimension != TextureDimension::D2 || self.mip_levels != 1 || self.usage.contains(TextureUsage::Storage)) {
            return invalid("multisampled textures must be single-mip 2D textures without storage usage".to_owned());
        }
        if self.usage.is_empty() {
            return invalid("no usage flags".to_owned());
        }
        if self.format.is_depth() && (self.dimension != TextureDimension::D2 || self.usage.contains(TextureUsage::Storage)) {
            return invalid(format!("{:?} only supports 2D textures without storage usage", self.format));
        }

        match self.storage_mode {
            StorageMode::Memoryless => {
                if self.usage != BitFlags::from(TextureUsage::RenderTarget) {
                    return invalid("memoryless textures can only be render targets".to_owned());
                }
                if !memory_types.iter().any(|m| m.lazily_allocated) {
                    return Err(RhiError::DeviceCapability("device has no lazily allocated memory for memoryless textures".to_owned()));
                }
            }
            StorageMode::Shared => {
                if !memory_types.iter().any(|m| m.host_visible && m.host_coherent) {
                    return Err(RhiError::DeviceCapability("no host-visible coherent memory type for shared textures".to_owned()));
                }
            }
            StorageMode::Private => {}
        }
        Ok(())
    }
}

/// A box inside one subresource of a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureRegion {
    pub mip_level: u32,
    pub array_layer: u32,
    pub origin: [u32; 3],
    pub extent: [u32; 3],
}

impl TextureRegion {
    /// The whole of `mip_level` / `array_layer`.
    pub fn whole(desc: &TextureDescriptor, mip_level: u32, array_layer: u32) -> Self {
        Self {
            mip_level,
            array_layer,
            origin: [0, 0, 0],
            extent: desc.mip_size(mip_level),
        }
    }

    #[inline]
    pub fn texel_count(&self) -> u64 {
        self.extent.iter().map(|&e| e as u64).product()
    }

    pub(crate) fn validate(&self, desc: &TextureDescriptor) -> RhiResult<()> {
        if self.mip_level >= desc.mip_levels || self.array_layer >= desc.array_layers {
            return Err(RhiError::invalid_descriptor(format!(
                "texture '{}' has no subresource mip {} layer {}",
                desc.label, self.mip_level, self.array_layer
            )));
        }
        let size = desc.mip_size(self.mip_level);
        for axis in 0..3 {
            let end = self.origin[axis] as u64 + self.extent[axis] as u64;
            if self.extent[axis] == 0 || end > size[axis] as u64 {
                return Err(RhiError::invalid_descriptor(format!(
                    "region {:?}+{:?} is outside mip {} of texture '{}' ({:?})",
                    self.origin, self.extent, self.mip_level, desc.label, size
                )));
            }
        }
        Ok(())
    }
}

struct TextureInner {
    desc: TextureDescriptor,
    native: Arc<dyn NativeTexture>,
    tracking: TrackedAllocation,
}

#[derive(Clone)]
pub struct Texture {
    inner: Arc<TextureInner>,
}

impl Texture {
    pub(crate) fn new(desc: TextureDescriptor, native: Arc<dyn NativeTexture>, tracking: TrackedAllocation) -> Self {
        Self {
            inner: Arc::new(TextureInner { desc, native, tracking }),
        }
    }

    #[inline]
    pub fn label(&self) -> &str {
        &self.inner.desc.label
    }

    #[inline]
    pub fn descriptor(&self) -> &TextureDescriptor {
        &self.inner.desc
    }

    #[inline]
    pub fn format(&self) -> TextureFormat {
        self.inner.desc.format
    }

    #[inline]
    pub fn native(&self) -> &dyn NativeTexture {
        self.inner.native.as_ref()
    }

    #[inline]
    pub(crate) fn tracking(&self) -> &TrackedAllocation {
        &self.inner.tracking
    }

    #[inline]
    pub fn ptr_eq(&self, other: &Texture) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Read back a region of a shared texture, tightly packed.
    pub fn read_region(&self, region: &TextureRegion) -> RhiResult<Vec<u8>> {
        let desc = self.descriptor();
        if desc.storage_mode != StorageMode::Shared {
            return Err(RhiError::invalid_state(format!(
                "texture '{}' has {:?} storage and is not host accessible",
                desc.label, desc.storage_mode
            )));
        }
        region.validate(desc)?;
        let mut out = vec![0u8; (region.texel_count() * desc.format.bytes_per_pixel() as u64) as usize];
        self.inner.native.read_region(region, &mut out)?;
        Ok(out)
    }
}

impl fmt::Debug for Texture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let desc = self.descriptor();
        f.debug_struct("Texture")
            .field("label", &desc.label)
            .field("format", &desc.format)
            .field("extent", &[desc.width, desc.height, desc.depth])
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        let desc = TextureDescriptor::new_2d("albedo", 64, 32, TextureFormat::Rgba8Unorm).with_mip_levels(3);
        assert_eq!(desc.mip_size(1), [32, 16, 1]);
        assert_eq!(desc.subresource_size(0), 64 * 32 * 4);
        assert_eq!(desc.total_size(), (64 * 32 + 32 * 16 + 16 * 8) * 4);
    }

    #[test]
    fn region_validation() {
        let desc = TextureDescriptor::new_2d("albedo", 16, 16, TextureFormat::R8Unorm);
        assert!(TextureRegion::whole(&desc, 0, 0).validate(&desc).is_ok());

        let mut region = TextureRegion::whole(&desc, 0, 0);
        region.origin = [8, 0, 0];
        assert!(region.validate(&desc).is_err());

        assert!(TextureRegion::whole(&desc, 1, 0).validate(&desc).is_err());
    }

    #[test]
    fn descriptor_validation() {
        let limits = DeviceLimits::default();
        let memory = [MemoryTypeInfo {
            heap_index: 0,
            device_local: true,
            host_visible: true,
            host_coherent: true,
            host_cached: true,
            lazily_allocated: false,
        }];
        let color = TextureDescriptor::render_target("color", 128, 64, TextureFormat::Rgba8Unorm);
        assert!(color.validate(&limits, &memory).is_ok());
        assert!(color.clone().with_mip_levels(8).validate(&limits, &memory).is_ok());
        assert!(color.clone().with_mip_levels(9).validate(&limits, &memory).is_err());
        assert!(color.clone().with_sample_count(3).validate(&limits, &memory).is_err());
        assert!(color.clone().with_sample_count(4).with_mip_levels(2).validate(&limits, &memory).is_err());

        let flat = TextureDescriptor { width: 0, ..color.clone() };
        assert!(flat.validate(&limits, &memory).is_err());

        let memoryless = color.clone().with_usage(TextureUsage::RenderTarget.into()).with_storage_mode(StorageMode::Memoryless);
        assert!(matches!(memoryless.validate(&limits, &memory), Err(RhiError::DeviceCapability(_))));
        let sampled_memoryless = color.with_storage_mode(StorageMode::Memoryless);
        assert!(matches!(sampled_memoryless.validate(&limits, &memory), Err(RhiError::InvalidDescriptor(_))));
    }
}
