//! Host memory backing the software device's resources.

use std::ops::Range;
use parking_lot::Mutex;
use kestrel_core::collections::hashset::HashSet;

use crate::backend::{
    downcast_native, NativeBindingSet, NativeBuffer, NativePipeline, NativeSampler, NativeShaderModule, NativeTexture,
};
use crate::error::{RhiError, RhiResult};
use crate::texture::{TextureDescriptor, TextureFormat, TextureRegion};

pub(crate) struct SoftwareBuffer {
    data: Mutex<Vec<u8>>,
}

impl SoftwareBuffer {
    pub(crate) fn new(size: u64) -> RhiResult<Self> {
        let size = usize::try_from(size).map_err(|_| RhiError::OutOfMemory(format!("{size} byte buffer")))?;
        Ok(Self { data: Mutex::new(vec![0; size]) })
    }

    fn span(&self, offset: u64, length: usize) -> RhiResult<Range<usize>> {
        let start = usize::try_from(offset).map_err(|_| RhiError::invalid_state("buffer offset overflows"))?;
        let end = start.checked_add(length).ok_or_else(|| RhiError::invalid_state("buffer span overflows"))?;
        if end > self.data.lock().len() {
            return Err(RhiError::invalid_state(format!("buffer span {start}..{end} is out of bounds")));
        }
        Ok(start..end)
    }

    pub(crate) fn fill(&self, offset: u64, size: u64, value: u8) -> RhiResult<()> {
        let length = usize::try_from(size).map_err(|_| RhiError::invalid_state("fill size overflows"))?;
        let span = self.span(offset, length)?;
        self.data.lock()[span].fill(value);
        Ok(())
    }
}

impl NativeBuffer for SoftwareBuffer {
    fn size(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn write(&self, offset: u64, data: &[u8]) -> RhiResult<()> {
        let span = self.span(offset, data.len())?;
        self.data.lock()[span].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, offset: u64, out: &mut [u8]) -> RhiResult<()> {
        let span = self.span(offset, out.len())?;
        out.copy_from_slice(&self.data.lock()[span]);
        Ok(())
    }
}

/// Every subresource is stored tightly packed, indexed by `layer * mip_levels + mip`.
pub(crate) struct SoftwareTexture {
    desc: TextureDescriptor,
    subresources: Mutex<Vec<Vec<u8>>>,
}

impl SoftwareTexture {
    pub(crate) fn new(desc: &TextureDescriptor) -> RhiResult<Self> {
        let mut subresources = Vec::with_capacity((desc.array_layers * desc.mip_levels) as usize);
        for _layer in 0..desc.array_layers {
            for mip in 0..desc.mip_levels {
                let size = desc.subresource_size(mip);
                let size = usize::try_from(size).map_err(|_| RhiError::OutOfMemory(format!("{size} byte texture level")))?;
                subresources.push(vec![0; size]);
            }
        }
        Ok(Self {
            desc: desc.clone(),
            subresources: Mutex::new(subresources),
        })
    }

    #[inline]
    fn subresource_index(&self, mip_level: u32, array_layer: u32) -> usize {
        (array_layer * self.desc.mip_levels + mip_level) as usize
    }

    /// Byte ranges of the rows of `region` inside its subresource, in copy order.
    fn row_ranges(&self, region: &TextureRegion) -> impl Iterator<Item = Range<usize>> + use<> {
        let [width, height, _] = self.desc.mip_size(region.mip_level);
        let bpp = self.desc.format.bytes_per_pixel() as usize;
        let row_len = region.extent[0] as usize * bpp;
        let [x, y, z] = region.origin.map(|o| o as usize);
        let [rows, slices] = [region.extent[1] as usize, region.extent[2] as usize];
        let (width, height) = (width as usize, height as usize);

        (0..slices).flat_map(move |slice| {
            (0..rows).map(move |row| {
                let start = (((z + slice) * height + y + row) * width + x) * bpp;
                start..start + row_len
            })
        })
    }

    fn check_region(&self, region: &TextureRegion) -> RhiResult<()> {
        region
            .validate(&self.desc)
            .map_err(|err| RhiError::invalid_state(format!("software texture copy: {err}")))
    }

    /// Read `region` into `out`, one row every `row_pitch` bytes.
    pub(crate) fn read_rows(&self, region: &TextureRegion, row_pitch: usize, out: &mut [u8]) -> RhiResult<()> {
        self.check_region(region)?;
        let subresources = self.subresources.lock();
        let data = &subresources[self.subresource_index(region.mip_level, region.array_layer)];
        for (index, range) in self.row_ranges(region).enumerate() {
            let start = index * row_pitch;
            let dst = out
                .get_mut(start..start + range.len())
                .ok_or_else(|| RhiError::invalid_state("texture read overruns its destination"))?;
            dst.copy_from_slice(&data[range]);
        }
        Ok(())
    }

    /// Write `region` from `data`, one row every `row_pitch` bytes.
    pub(crate) fn write_rows(&self, region: &TextureRegion, row_pitch: usize, data: &[u8]) -> RhiResult<()> {
        self.check_region(region)?;
        let index = self.subresource_index(region.mip_level, region.array_layer);
        let mut subresources = self.subresources.lock();
        let target = &mut subresources[index];
        for (row, range) in self.row_ranges(region).enumerate() {
            let start = row * row_pitch;
            let src = data
                .get(start..start + range.len())
                .ok_or_else(|| RhiError::invalid_state("texture write overruns its source"))?;
            target[range].copy_from_slice(src);
        }
        Ok(())
    }

    /// Set every texel of one subresource to `texel`.
    pub(crate) fn fill(&self, mip_level: u32, array_layer: u32, texel: &[u8]) {
        let index = self.subresource_index(mip_level, array_layer);
        let mut subresources = self.subresources.lock();
        for chunk in subresources[index].chunks_exact_mut(texel.len()) {
            chunk.copy_from_slice(texel);
        }
    }
}

impl NativeTexture for SoftwareTexture {
    fn read_region(&self, region: &TextureRegion, out: &mut [u8]) -> RhiResult<()> {
        let row_pitch = region.extent[0] as usize * self.desc.format.bytes_per_pixel() as usize;
        self.read_rows(region, row_pitch, out)
    }
}

pub(crate) struct SoftwareSampler;

impl NativeSampler for SoftwareSampler {}

pub(crate) struct SoftwareShaderModule;

impl NativeShaderModule for SoftwareShaderModule {}

pub(crate) struct SoftwarePipeline;

impl NativePipeline for SoftwarePipeline {}

/// Records which slots were written.
#[derive(Default)]
pub(crate) struct SoftwareBindingSet {
    written: Mutex<HashSet<(u32, u32)>>,
}

impl SoftwareBindingSet {
    fn mark(&self, binding: u32, array_index: u32) {
        self.written.lock().insert((binding, array_index));
    }
}

impl NativeBindingSet for SoftwareBindingSet {
    fn write_buffer(&self, binding: u32, array_index: u32, buffer: &dyn NativeBuffer, offset: u64, length: u64) -> RhiResult<()> {
        let buffer = downcast_native::<SoftwareBuffer>(buffer.as_any(), "buffer")?;
        if offset.saturating_add(length) > buffer.size() {
            return Err(RhiError::invalid_state("bound buffer range is out of bounds"));
        }
        self.mark(binding, array_index);
        Ok(())
    }

    fn write_texture(&self, binding: u32, array_index: u32, texture: &dyn NativeTexture) -> RhiResult<()> {
        downcast_native::<SoftwareTexture>(texture.as_any(), "texture")?;
        self.mark(binding, array_index);
        Ok(())
    }

    fn write_sampler(&self, binding: u32, array_index: u32, sampler: &dyn NativeSampler) -> RhiResult<()> {
        downcast_native::<SoftwareSampler>(sampler.as_any(), "sampler")?;
        self.mark(binding, array_index);
        Ok(())
    }
}

/// Texel a color clear writes into a `format` attachment.
pub(crate) fn encode_clear_color(format: TextureFormat, color: [f32; 4]) -> Vec<u8> {
    let unorm = |v: f32| (v.clamp(0.0, 1.0) * 255.0 + 0.5) as u8;
    let srgb = |v: f32| unorm(linear_to_srgb(v));
    let [r, g, b, a] = color;
    match format {
        TextureFormat::R8Unorm => vec![unorm(r)],
        TextureFormat::Rg8Unorm => vec![unorm(r), unorm(g)],
        TextureFormat::Rgba8Unorm => vec![unorm(r), unorm(g), unorm(b), unorm(a)],
        TextureFormat::Rgba8Srgb => vec![srgb(r), srgb(g), srgb(b), unorm(a)],
        TextureFormat::Bgra8Unorm => vec![unorm(b), unorm(g), unorm(r), unorm(a)],
        TextureFormat::Bgra8Srgb => vec![srgb(b), srgb(g), srgb(r), unorm(a)],
        TextureFormat::R16Float => f16_bits(r).to_le_bytes().to_vec(),
        TextureFormat::Rgba16Float => color.iter().flat_map(|&c| f16_bits(c).to_le_bytes()).collect(),
        TextureFormat::R32Float => r.to_le_bytes().to_vec(),
        TextureFormat::Rg32Float => [r, g].iter().flat_map(|c| c.to_le_bytes()).collect(),
        TextureFormat::Rgba32Float => color.iter().flat_map(|c| c.to_le_bytes()).collect(),
        TextureFormat::R32Uint => (r.max(0.0) as u32).to_le_bytes().to_vec(),
        TextureFormat::Depth32Float | TextureFormat::Depth24Stencil8 => encode_clear_depth(format, r, 0),
    }
}

/// Texel a depth clear writes into a `format` attachment.
pub(crate) fn encode_clear_depth(format: TextureFormat, depth: f32, stencil: u32) -> Vec<u8> {
    let depth = depth.clamp(0.0, 1.0);
    match format {
        TextureFormat::Depth24Stencil8 => {
            let packed = ((depth * 0x00ff_ffff as f32) as u32 & 0x00ff_ffff) | ((stencil & 0xff) << 24);
            packed.to_le_bytes().to_vec()
        }
        _ => depth.to_le_bytes().to_vec(),
    }
}

fn linear_to_srgb(v: f32) -> f32 {
    let v = v.clamp(0.0, 1.0);
    if v <= 0.003_130_8 {
        v * 12.92
    } else {
        1.055 * v.powf(1.0 / 2.4) - 0.055
    }
}

/// IEEE 754 binary16 bits of `value`, rounded to nearest.
fn f16_bits(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exponent = ((bits >> 23) & 0xff) as i32;
    let mantissa = bits & 0x007f_ffff;

    if exponent == 0xff {
        let nan = if mantissa != 0 { 0x0200 } else { 0 };
        return sign | 0x7c00 | nan;
    }
    let exponent = exponent - 127 + 15;
    if exponent >= 0x1f {
        return sign | 0x7c00;
    }
    if exponent <= 0 {
        if exponent < -10 {
            return sign;
        }
        let mantissa = (mantissa | 0x0080_0000) >> (1 - exponent);
        return sign | ((mantissa + 0x1000) >> 13) as u16;
    }
    (sign | ((exponent as u16) << 10)) + ((mantissa + 0x1000) >> 13) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::texture::TextureUsage;

    #[test]
    fn buffer_spans_are_checked() {
        let buffer = SoftwareBuffer::new(16).unwrap();
        buffer.write(4, &[1, 2, 3, 4]).unwrap();
        buffer.fill(12, 4, 9).unwrap();

        let mut out = [0u8; 16];
        buffer.read(0, &mut out).unwrap();
        assert_eq!(out, [0, 0, 0, 0, 1, 2, 3, 4, 0, 0, 0, 0, 9, 9, 9, 9]);
        assert!(buffer.write(14, &[0; 4]).is_err());
    }

    #[test]
    fn texture_rows_honor_pitch() {
        let desc = TextureDescriptor::new_2d("rows", 4, 4, TextureFormat::R8Unorm)
            .with_usage(TextureUsage::CopyDst | TextureUsage::CopySrc);
        let texture = SoftwareTexture::new(&desc).unwrap();
        let region = TextureRegion { mip_level: 0, array_layer: 0, origin: [1, 1, 0], extent: [2, 2, 1] };

        // Rows padded to 4 bytes.
        texture.write_rows(&region, 4, &[1, 2, 0, 0, 3, 4]).unwrap();
        let mut whole = vec![0u8; 16];
        texture.read_region(&TextureRegion::whole(&desc, 0, 0), &mut whole).unwrap();
        assert_eq!(whole, [0, 0, 0, 0, 0, 1, 2, 0, 0, 3, 4, 0, 0, 0, 0, 0]);

        let mut packed = vec![0u8; 4];
        texture.read_region(&region, &mut packed).unwrap();
        assert_eq!(packed, [1, 2, 3, 4]);
    }

    #[test]
    fn clear_values() {
        assert_eq!(encode_clear_color(TextureFormat::Rgba8Unorm, [1.0, 0.0, 0.5, 1.0]), [255, 0, 128, 255]);
        assert_eq!(encode_clear_color(TextureFormat::Bgra8Unorm, [1.0, 0.0, 0.0, 1.0]), [0, 0, 255, 255]);
        assert_eq!(encode_clear_color(TextureFormat::R16Float, [1.0, 0.0, 0.0, 0.0]), 0x3c00u16.to_le_bytes());
        assert_eq!(f16_bits(-2.0), 0xc000);
        assert_eq!(f16_bits(0.5), 0x3800);
        assert_eq!(encode_clear_depth(TextureFormat::Depth24Stencil8, 1.0, 3), (0x00ff_ffffu32 | 3 << 24).to_le_bytes());
        assert_eq!(encode_clear_depth(TextureFormat::Depth32Float, 0.25, 0), 0.25f32.to_le_bytes());
    }
}
