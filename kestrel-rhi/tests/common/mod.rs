#![allow(dead_code)]

use std::path::Path;
use std::time::{Duration, Instant};

use kestrel_rhi::shader::SPIRV_MAGIC;
use kestrel_rhi::{
    BackendKind, ColorTargetState, DeviceConfig, DeviceConfigBuilder, EventLoopProxy, GraphicsDevice,
    RenderPipelineDescriptor, RenderPipelineDescriptorBuilder, ShaderModuleDescriptor, ShaderStage,
    SoftwareDevice, SoftwareOptions, TextureFormat,
};

pub fn config() -> DeviceConfigBuilder {
    let mut builder = DeviceConfig::builder();
    builder.backend(BackendKind::Software).validation(false);
    builder
}

pub fn device() -> GraphicsDevice {
    GraphicsDevice::new(config().build().unwrap()).unwrap()
}

pub fn device_with_latency(latency: Duration) -> GraphicsDevice {
    let software = SoftwareOptions {
        execution_latency: latency,
        ..Default::default()
    };
    GraphicsDevice::new(config().software(software).build().unwrap()).unwrap()
}

pub fn device_with_event_loop(proxy: EventLoopProxy) -> GraphicsDevice {
    GraphicsDevice::new(config().event_loop(proxy).build().unwrap()).unwrap()
}

pub fn device_with_cache(dir: &Path) -> GraphicsDevice {
    GraphicsDevice::new(config().pipeline_cache_dir(dir.to_path_buf()).build().unwrap()).unwrap()
}

pub fn software(device: &GraphicsDevice) -> &SoftwareDevice {
    SoftwareDevice::from_device(device).unwrap()
}

pub fn shader(label: &str, stage: ShaderStage) -> ShaderModuleDescriptor {
    ShaderModuleDescriptor::new(label, stage, vec![SPIRV_MAGIC, 0x0001_0300, 0, 16, 0])
}

/// Vertex + fragment pipeline drawing into a single color target of `format`.
pub fn triangle_pipeline(device: &GraphicsDevice, format: TextureFormat) -> RenderPipelineDescriptor {
    let vertex = device.create_shader_module(&shader("triangle.vert", ShaderStage::Vertex)).unwrap();
    let fragment = device.create_shader_module(&shader("triangle.frag", ShaderStage::Fragment)).unwrap();
    RenderPipelineDescriptorBuilder::default()
        .label("triangle")
        .vertex(vertex)
        .fragment(fragment)
        .color_targets(vec![ColorTargetState::new(format)])
        .build()
        .unwrap()
}

/// Poll `condition` for up to five seconds.
pub fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}
