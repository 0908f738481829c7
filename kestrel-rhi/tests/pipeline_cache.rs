mod common;

use std::fs;

use kestrel_rhi::{ComputePipelineDescriptor, GraphicsDevice, RenderPipelineDescriptor, RhiError, ShaderStage, TextureFormat};

use common::{config, device, device_with_cache, shader, software, triangle_pipeline};

fn fill_pipeline(device: &GraphicsDevice) -> ComputePipelineDescriptor {
    let module = device.create_shader_module(&shader("fill", ShaderStage::Compute)).unwrap();
    ComputePipelineDescriptor::new("fill", module)
}

#[test]
fn identical_descriptors_share_a_live_pipeline() {
    let device = device();
    let desc = fill_pipeline(&device);
    let first = device.create_compute_pipeline(&desc).unwrap();
    let second = device.create_compute_pipeline(&desc).unwrap();
    assert!(first.ptr_eq(&second));

    let stats = device.pipeline_cache_stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.reused, 1);
    assert_eq!(stats.entries, 1);

    // Once every handle is gone the pipeline is compiled again, as a known fingerprint.
    drop(first);
    drop(second);
    let third = device.create_compute_pipeline(&desc).unwrap();
    assert_eq!(third.fingerprint(), desc.fingerprint());
    assert_eq!(device.pipeline_cache_stats().hits, 1);
}

#[test]
fn render_pipelines_are_shared_and_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let fingerprint = {
        let device = device_with_cache(dir.path());
        let desc = triangle_pipeline(&device, TextureFormat::Rgba8Unorm);
        let first = device.create_render_pipeline(&desc).unwrap();
        let second = device.create_render_pipeline(&desc).unwrap();
        assert!(first.ptr_eq(&second));
        let stats = device.pipeline_cache_stats();
        assert_eq!((stats.misses, stats.reused, stats.entries), (1, 1, 1));

        // A different target format is a different pipeline.
        let other = device.create_render_pipeline(&triangle_pipeline(&device, TextureFormat::Bgra8Unorm)).unwrap();
        assert!(!other.ptr_eq(&first));
        assert_eq!(device.pipeline_cache_stats().misses, 2);

        device.shutdown();
        first.fingerprint()
    };

    let device = device_with_cache(dir.path());
    assert_eq!(device.pipeline_cache_stats().loaded, 2);
    let pipeline = device.create_render_pipeline(&triangle_pipeline(&device, TextureFormat::Rgba8Unorm)).unwrap();
    assert_eq!(pipeline.fingerprint(), fingerprint);
    let stats = device.pipeline_cache_stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 0);
}

#[test]
fn render_stages_are_checked() {
    let device = device();
    let desc = triangle_pipeline(&device, TextureFormat::Rgba8Unorm);
    let swapped = RenderPipelineDescriptor {
        vertex: desc.fragment.clone().unwrap(),
        fragment: Some(desc.vertex.clone()),
        ..desc.clone()
    };
    assert!(matches!(device.create_render_pipeline(&swapped), Err(RhiError::InvalidDescriptor(_))));

    let depth_as_color = RenderPipelineDescriptor {
        color_targets: vec![kestrel_rhi::ColorTargetState::new(TextureFormat::Depth32Float)],
        ..desc
    };
    assert!(matches!(device.create_render_pipeline(&depth_as_color), Err(RhiError::InvalidDescriptor(_))));
}

#[test]
fn label_does_not_affect_identity() {
    let device = device();
    let desc = fill_pipeline(&device);
    let renamed = ComputePipelineDescriptor {
        label: "fill again".to_owned(),
        ..desc.clone()
    };
    assert_eq!(desc.fingerprint(), renamed.fingerprint());

    let wider = ComputePipelineDescriptor {
        threadgroup_size: [128, 1, 1],
        ..desc.clone()
    };
    assert_ne!(desc.fingerprint(), wider.fingerprint());
}

#[test]
fn wrong_stage_is_rejected() {
    let device = device();
    let module = device.create_shader_module(&shader("vs", ShaderStage::Vertex)).unwrap();
    let desc = ComputePipelineDescriptor::new("not compute", module);
    assert!(matches!(device.create_compute_pipeline(&desc), Err(RhiError::InvalidDescriptor(_))));
}

#[test]
fn compiled_pipelines_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let fingerprint = {
        let device = device_with_cache(dir.path());
        assert_eq!(device.pipeline_cache_stats().loaded, 0);
        let pipeline = device.create_compute_pipeline(&fill_pipeline(&device)).unwrap();
        device.shutdown();
        assert!(device.pipeline_cache_path().unwrap().exists());
        pipeline.fingerprint()
    };

    let device = device_with_cache(dir.path());
    assert_eq!(device.pipeline_cache_stats().loaded, 1);
    assert_eq!(software(&device).compiled_pipeline_count(), 1);

    let pipeline = device.create_compute_pipeline(&fill_pipeline(&device)).unwrap();
    assert_eq!(pipeline.fingerprint(), fingerprint);
    let stats = device.pipeline_cache_stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 0);
}

#[test]
fn damaged_cache_files_are_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let path = {
        let device = device_with_cache(dir.path());
        device.create_compute_pipeline(&fill_pipeline(&device)).unwrap();
        device.save_pipeline_cache().unwrap().unwrap()
    };
    let valid = fs::read(&path).unwrap();

    fs::write(&path, &valid[..valid.len() / 2]).unwrap();
    let device = device_with_cache(dir.path());
    assert_eq!(device.pipeline_cache_stats().loaded, 0);
    assert_eq!(software(&device).compiled_pipeline_count(), 0);
    device.shutdown();

    fs::write(&path, b"definitely not a pipeline cache").unwrap();
    let device = device_with_cache(dir.path());
    assert_eq!(device.pipeline_cache_stats().loaded, 0);

    // The next save replaces the damaged file with a usable one.
    device.create_compute_pipeline(&fill_pipeline(&device)).unwrap();
    device.shutdown();
    let device = device_with_cache(dir.path());
    assert_eq!(device.pipeline_cache_stats().loaded, 1);
}

#[test]
fn persistence_can_be_disabled() {
    let device = device();
    assert_eq!(device.pipeline_cache_path(), None);
    assert_eq!(device.save_pipeline_cache().unwrap(), None);

    let dir = tempfile::tempdir().unwrap();
    let device = GraphicsDevice::new(
        config()
            .pipeline_cache_dir(dir.path().to_path_buf())
            .save_pipeline_cache_on_shutdown(false)
            .build()
            .unwrap(),
    )
    .unwrap();
    device.create_compute_pipeline(&fill_pipeline(&device)).unwrap();
    device.shutdown();
    assert!(!device.pipeline_cache_path().unwrap().exists());
}
