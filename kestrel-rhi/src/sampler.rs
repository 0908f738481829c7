//! Sampler states.

use std::fmt;
use std::sync::Arc;

use crate::backend::{DeviceLimits, NativeSampler};
use crate::error::{RhiError, RhiResult};
use crate::tracker::TrackedAllocation;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum FilterMode {
    Nearest,
    #[default]
    Linear,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AddressMode {
    #[default]
    Repeat,
    MirrorRepeat,
    ClampToEdge,
    ClampToBorder,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CompareFunction {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    #[default]
    Always,
}

/// Sampler descriptor for `GraphicsDevice::create_sampler_state`.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerDescriptor {
    pub label: String,
    pub mag_filter: FilterMode,
    pub min_filter: FilterMode,
    pub mipmap_filter: FilterMode,
    pub address_mode_u: AddressMode,
    pub address_mode_v: AddressMode,
    pub address_mode_w: AddressMode,
    pub lod_min_clamp: f32,
    pub lod_max_clamp: f32,
    /// 1.0 disables anisotropic filtering.
    pub max_anisotropy: f32,
    /// Depth comparison for shadow samplers.
    pub compare: Option<CompareFunction>,
}

impl Default for SamplerDescriptor {
    fn default() -> Self {
        Self {
            label: "Unnamed sampler".to_owned(),
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            mipmap_filter: FilterMode::Linear,
            address_mode_u: AddressMode::Repeat,
            address_mode_v: AddressMode::Repeat,
            address_mode_w: AddressMode::Repeat,
            lod_min_clamp: 0.0,
            lod_max_clamp: 1000.0,
            max_anisotropy: 1.0,
            compare: None,
        }
    }
}

impl SamplerDescriptor {
    pub fn linear(label: &str) -> Self {
        Self {
            label: label.to_owned(),
            ..Default::default()
        }
    }

    pub fn nearest(label: &str) -> Self {
        Self {
            label: label.to_owned(),
            mag_filter: FilterMode::Nearest,
            min_filter: FilterMode::Nearest,
            mipmap_filter: FilterMode::Nearest,
            ..Default::default()
        }
    }

    pub fn anisotropic(label: &str, max_anisotropy: f32) -> Self {
        Self {
            max_anisotropy,
            ..Self::linear(label)
        }
    }

    /// Shadow-map comparison sampler.
    pub fn comparison(label: &str, compare: CompareFunction) -> Self {
        Self {
            compare: Some(compare),
            ..Self::linear(label)
        }
        .with_address_mode(AddressMode::ClampToEdge)
    }

    /// Set the address mode of all three axes.
    pub fn with_address_mode(mut self, mode: AddressMode) -> Self {
        self.address_mode_u = mode;
        self.address_mode_v = mode;
        self.address_mode_w = mode;
        self
    }

    pub(crate) fn validate(&self, limits: &DeviceLimits) -> RhiResult<()> {
        if !(self.lod_min_clamp >= 0.0 && self.lod_min_clamp <= self.lod_max_clamp) {
            return Err(RhiError::invalid_descriptor(format!(
                "sampler '{}': lod clamp {}..{} is not a valid range",
                self.label, self.lod_min_clamp, self.lod_max_clamp
            )));
        }
        if !(self.max_anisotropy >= 1.0 && self.max_anisotropy <= limits.max_sampler_anisotropy) {
            return Err(RhiError::invalid_descriptor(format!(
                "sampler '{}': anisotropy {} outside 1..={}",
                self.label, self.max_anisotropy, limits.max_sampler_anisotropy
            )));
        }
        Ok(())
    }
}

struct SamplerInner {
    desc: SamplerDescriptor,
    native: Arc<dyn NativeSampler>,
    tracking: TrackedAllocation,
}

#[derive(Clone)]
pub struct SamplerState {
    inner: Arc<SamplerInner>,
}

impl SamplerState {
    pub(crate) fn new(desc: SamplerDescriptor, native: Arc<dyn NativeSampler>, tracking: TrackedAllocation) -> Self {
        Self {
            inner: Arc::new(SamplerInner { desc, native, tracking }),
        }
    }

    #[inline]
    pub fn label(&self) -> &str {
        &self.inner.desc.label
    }

    #[inline]
    pub fn descriptor(&self) -> &SamplerDescriptor {
        &self.inner.desc
    }

    #[inline]
    pub fn native(&self) -> &dyn NativeSampler {
        self.inner.native.as_ref()
    }

    #[inline]
    pub(crate) fn tracking(&self) -> &TrackedAllocation {
        &self.inner.tracking
    }
}

impl fmt::Debug for SamplerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SamplerState").field(&self.label()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation() {
        let limits = DeviceLimits::default();
        assert!(SamplerDescriptor::linear("linear").validate(&limits).is_ok());
        assert!(SamplerDescriptor::comparison("shadow", CompareFunction::LessEqual).validate(&limits).is_ok());
        assert!(SamplerDescriptor::anisotropic("aniso", 32.0).validate(&limits).is_err());
        assert!(SamplerDescriptor::anisotropic("aniso", 0.5).validate(&limits).is_err());

        let inverted = SamplerDescriptor { lod_min_clamp: 4.0, lod_max_clamp: 1.0, ..SamplerDescriptor::nearest("inverted") };
        assert!(inverted.validate(&limits).is_err());
        let nan = SamplerDescriptor { lod_max_clamp: f32::NAN, ..SamplerDescriptor::nearest("nan") };
        assert!(nan.validate(&limits).is_err());
    }
}
