use kestrel_core::cli::{BackendArg, EngineArgs};
use kestrel_rhi::{BackendKind, BackendPreference, DeviceConfig, EventLoop, GraphicsDevice};

use crate::frame_loop::FrameLoop;

mod frame_loop;

fn backend_preference(arg: BackendArg) -> BackendPreference {
    match arg {
        BackendArg::Auto => BackendPreference::Auto,
        BackendArg::Vulkan => BackendKind::Vulkan.into(),
        BackendArg::Metal => BackendKind::Metal.into(),
        BackendArg::Direct3D12 => BackendKind::Direct3D12.into(),
        BackendArg::Software => BackendKind::Software.into(),
    }
}

fn launch(args: &EngineArgs) -> Result<(), anyhow::Error> {
    kestrel_core::profile::initialize(args.profile)?;
    kestrel_core::log::initialize(args.log_level.into())?;

    let event_loop = EventLoop::new();

    let mut config = DeviceConfig::builder();
    config
        .backend(backend_preference(args.backend))
        .validation(args.validation)
        .application_name("kestrel-sandbox")
        .event_loop(event_loop.proxy());
    if let Some(dir) = &args.cache_dir {
        config.pipeline_cache_dir(dir.clone());
    }

    let device = GraphicsDevice::new(config.build()?)?;
    log::info!("running {} frames on {:?}", args.frames, device);

    let mut main_loop = FrameLoop::new(device.clone(), event_loop)?;
    let result = main_loop.run(args.frames);

    device.shutdown();
    result
}

fn main() -> Result<(), anyhow::Error> {
    let args = EngineArgs::parse_args();
    launch(&args)
}
