//! Buffers and their descriptors.

use std::fmt;
use std::ops::RangeBounds;
use std::sync::Arc;
use enumflags2::{bitflags, BitFlags};

use crate::backend::{DeviceLimits, MemoryTypeInfo, NativeBuffer};
use crate::error::{RhiError, RhiResult};
use crate::tracker::TrackedAllocation;
use crate::utility::{check_span, normalize_range_u64};

/// Where a resource's memory lives and who may touch it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum StorageMode {
    /// Host visible and coherent; CPU reads and writes are allowed.
    Shared,
    /// Device local; only GPU commands access it.
    #[default]
    Private,
    /// Tile memory that never leaves the GPU. Only valid for render targets.
    Memoryless,
}

#[bitflags]
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    Vertex = 1 << 0,
    Index = 1 << 1,
    Uniform = 1 << 2,
    Storage = 1 << 3,
    Indirect = 1 << 4,
    CopySrc = 1 << 5,
    CopyDst = 1 << 6,
}

pub type BufferUsages = BitFlags<BufferUsage>;

/// Buffer descriptor for `GraphicsDevice::create_buffer`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferDescriptor {
    pub label: String,
    /// Size of the buffer in bytes.
    pub size: u64,
    pub usage: BufferUsages,
    pub storage_mode: StorageMode,
}

impl Default for BufferDescriptor {
    fn default() -> Self {
        Self {
            label: "Unnamed buffer".to_owned(),
            size: 0,
            usage: BufferUsage::CopySrc | BufferUsage::CopyDst,
            storage_mode: StorageMode::Private,
        }
    }
}

impl BufferDescriptor {
    pub fn new(label: &str, size: u64) -> Self {
        Self {
            label: label.to_owned(),
            size,
            ..Default::default()
        }
    }

    pub fn vertex(label: &str, size: u64) -> Self {
        Self::new(label, size).with_usage(BufferUsage::Vertex | BufferUsage::CopyDst)
    }

    pub fn index(label: &str, size: u64) -> Self {
        Self::new(label, size).with_usage(BufferUsage::Index | BufferUsage::CopyDst)
    }

    /// Uniform buffers are written from the CPU every frame, so they default to shared memory.
    pub fn uniform(label: &str, size: u64) -> Self {
        Self::new(label, size)
            .with_usage(BufferUsage::Uniform.into())
            .shared()
    }

    pub fn storage(label: &str, size: u64) -> Self {
        Self::new(label, size).with_usage(BufferUsage::Storage | BufferUsage::CopySrc | BufferUsage::CopyDst)
    }

    /// CPU-visible buffer used as a copy source or readback target.
    pub fn staging(label: &str, size: u64) -> Self {
        Self::new(label, size)
            .with_usage(BufferUsage::CopySrc | BufferUsage::CopyDst)
            .shared()
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_usage(mut self, usage: BufferUsages) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_additional_usage(mut self, usage: impl Into<BufferUsages>) -> Self {
        self.usage |= usage.into();
        self
    }

    pub fn with_storage_mode(mut self, mode: StorageMode) -> Self {
        self.storage_mode = mode;
        self
    }

    pub fn shared(self) -> Self {
        self.with_storage_mode(StorageMode::Shared)
    }

    pub fn private(self) -> Self {
        self.with_storage_mode(StorageMode::Private)
    }

    pub(crate) fn validate(&self, limits: &DeviceLimits, memory_types: &[MemoryTypeInfo]) -> RhiResult<()> {
        let invalid = |msg: String| Err(RhiError::invalid_descriptor(format!("buffer '{}': {msg}", self.label)));

        if self.size == 0 {
            return invalid("size must be non-zero".to_owned());
        }
        if self.size > limits.max_buffer_size {
            return invalid(format!("size {} exceeds the device limit of {}", self.size, limits.max_buffer_size));
        }
        if self.usage.is_empty() {
            return invalid("no usage flags".to_owned());
        }
        match self.storage_mode {
            StorageMode::Memoryless => invalid("memoryless storage is only valid for render target textures".to_owned()),
            StorageMode::Shared if !memory_types.iter().any(|m| m.host_visible && m.host_coherent) => {
                Err(RhiError::DeviceCapability("no host-visible coherent memory type for shared buffers".to_owned()))
            }
            _ => Ok(()),
        }
    }
}

struct BufferInner {
    desc: BufferDescriptor,
    native: Arc<dyn NativeBuffer>,
    tracking: TrackedAllocation,
}

/// GPU buffer handle. Clones share the same allocation.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

impl Buffer {
    pub(crate) fn new(desc: BufferDescriptor, native: Arc<dyn NativeBuffer>, tracking: TrackedAllocation) -> Self {
        Self {
            inner: Arc::new(BufferInner { desc, native, tracking }),
        }
    }

    #[inline]
    pub fn label(&self) -> &str {
        &self.inner.desc.label
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.inner.desc.size
    }

    #[inline]
    pub fn usage(&self) -> BufferUsages {
        self.inner.desc.usage
    }

    #[inline]
    pub fn storage_mode(&self) -> StorageMode {
        self.inner.desc.storage_mode
    }

    #[inline]
    pub fn descriptor(&self) -> &BufferDescriptor {
        &self.inner.desc
    }

    #[inline]
    pub fn native(&self) -> &dyn NativeBuffer {
        self.inner.native.as_ref()
    }

    #[inline]
    pub(crate) fn tracking(&self) -> &TrackedAllocation {
        &self.inner.tracking
    }

    /// Whether both handles refer to the same allocation.
    #[inline]
    pub fn ptr_eq(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn check_host_access(&self) -> RhiResult<()> {
        match self.storage_mode() {
            StorageMode::Shared => Ok(()),
            mode => Err(RhiError::invalid_state(format!(
                "buffer '{}' has {mode:?} storage and is not host accessible",
                self.label()
            ))),
        }
    }

    /// Copy `data` into the buffer at `offset`. Only valid for shared storage.
    pub fn write(&self, offset: u64, data: &[u8]) -> RhiResult<()> {
        self.check_host_access()?;
        check_span(offset, data.len() as u64, self.size(), "buffer write")?;
        self.inner.native.write(offset, data)
    }

    /// Copy buffer contents starting at `offset` into `out`. Only valid for shared storage.
    pub fn read(&self, offset: u64, out: &mut [u8]) -> RhiResult<()> {
        self.check_host_access()?;
        check_span(offset, out.len() as u64, self.size(), "buffer read")?;
        self.inner.native.read(offset, out)
    }

    /// Read a byte range of a shared buffer into a new vector.
    pub fn read_range<R: RangeBounds<u64>>(&self, range: R) -> RhiResult<Vec<u8>> {
        let (offset, length) = normalize_range_u64(range, self.size())?;
        let mut out = vec![0u8; length as usize];
        self.read(offset, &mut out)?;
        Ok(out)
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("label", &self.label())
            .field("size", &self.size())
            .field("storage_mode", &self.storage_mode())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_presets() {
        let uniform = BufferDescriptor::uniform("camera", 256);
        assert_eq!(uniform.storage_mode, StorageMode::Shared);
        assert!(uniform.usage.contains(BufferUsage::Uniform));

        let vertex = BufferDescriptor::vertex("mesh", 1024).with_additional_usage(BufferUsage::Storage);
        assert_eq!(vertex.storage_mode, StorageMode::Private);
        assert!(vertex.usage.contains(BufferUsage::Vertex | BufferUsage::Storage));

        let staging = BufferDescriptor::staging("upload", 64).private().with_label("renamed");
        assert_eq!(staging.storage_mode, StorageMode::Private);
        assert_eq!(staging.label, "renamed");
    }

    #[test]
    fn validation_rejects_unusable_descriptors() {
        let limits = DeviceLimits::default();
        let memory = [MemoryTypeInfo {
            heap_index: 0,
            device_local: true,
            host_visible: true,
            host_coherent: true,
            host_cached: false,
            lazily_allocated: false,
        }];

        assert!(BufferDescriptor::storage("ok", 64).validate(&limits, &memory).is_ok());
        assert!(matches!(
            BufferDescriptor::storage("empty", 0).validate(&limits, &memory),
            Err(RhiError::InvalidDescriptor(_))
        ));
        assert!(matches!(
            BufferDescriptor::storage("tile", 64).with_storage_mode(StorageMode::Memoryless).validate(&limits, &memory),
            Err(RhiError::InvalidDescriptor(_))
        ));
        assert!(BufferDescriptor::storage("huge", limits.max_buffer_size + 1).validate(&limits, &memory).is_err());
        assert!(BufferDescriptor::new("unused", 16).with_usage(BufferUsages::empty()).validate(&limits, &memory).is_err());
        assert!(matches!(
            BufferDescriptor::staging("upload", 16).validate(&limits, &[]),
            Err(RhiError::DeviceCapability(_))
        ));
    }
}
