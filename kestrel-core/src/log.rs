pub use log::{trace, debug, info, warn, error, log_enabled, Level, LevelFilter};

pub fn initialize(level: LevelFilter) -> Result<(), anyhow::Error> {
    env_logger::builder()
        .filter_level(level)
        .filter_module("kestrel_rhi::vulkan", level.min(LevelFilter::Info))
        .parse_default_env()
        .try_init()?;

    Ok(())
}
